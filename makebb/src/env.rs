// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    env,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Resolved invocation environment: the detected Go toolchain plus the
/// ordered list of base directories relative patterns are searched under.
#[derive(Debug)]
pub struct Env {
    pub go: golist::GoEnv,
    pub search_path: Vec<PathBuf>,
}

impl Env {
    pub fn new() -> Result<Self, Error> {
        let go = golist::GoEnv::detect()?;
        let search_path = resolve_search_path();

        if !search_path.is_empty() {
            log::debug!("pattern search path: {search_path:?}");
        }

        Ok(Self { go, search_path })
    }

    /// Nearest ancestor of `dir` containing a module manifest
    pub fn module_root(dir: &Path) -> Option<PathBuf> {
        dir.ancestors()
            .find(|candidate| candidate.join("go.mod").is_file())
            .map(Path::to_path_buf)
    }
}

/// `GBB_PATH` is a colon separated list of directories; `GBB_SOURCE` is the
/// single-directory fallback honoured when the list is unset.
fn resolve_search_path() -> Vec<PathBuf> {
    if let Ok(path) = env::var("GBB_PATH") {
        return path
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
    }

    if let Ok(source) = env::var("GBB_SOURCE") {
        if !source.is_empty() {
            return vec![PathBuf::from(source)];
        }
    }

    vec![]
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("detect go toolchain")]
    Toolchain(#[from] golist::Error),
}
