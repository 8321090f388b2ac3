// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The final compile step over an emitted tree

use std::{
    io,
    path::{Path, PathBuf},
    process::Command,
};

use thiserror::Error;

use crate::{emit::Layout, env::Env};

#[derive(Debug)]
pub struct Options<'a> {
    pub output: &'a Path,
    /// Arguments forwarded verbatim to `go build`
    pub go_args: &'a [String],
    /// Module mode builds resolve through the synthesised manifest; the
    /// legacy mode points GOPATH at the scratch root instead
    pub module_mode: bool,
}

pub fn build(env: &Env, layout: &Layout, options: &Options<'_>) -> Result<(), Error> {
    let bb_dir = layout.bb_dir();
    let output = absolute(options.output)?;

    if options.module_mode {
        // The synthesised manifest only pins local modules; tidy fills in
        // the transitive requirements before the compile.
        let mut tidy = env.go.command();
        tidy.current_dir(&bb_dir)
            .env("GO111MODULE", "on")
            .args(["mod", "tidy"]);
        run(tidy)?;
    }

    let mut command = env.go.command();
    command.current_dir(&bb_dir).arg("build");
    command.args(options.go_args);
    command.arg("-o").arg(&output).arg(".");

    if options.module_mode {
        command.env("GO111MODULE", "on");
    } else {
        command
            .env("GO111MODULE", "off")
            .env("GOPATH", &layout.root);
    }

    log::debug!("go build -o {output:?} in {bb_dir:?}");

    run(command)?;

    println!("Built {}", output.display());

    Ok(())
}

fn run(mut command: Command) -> Result<(), Error> {
    let rendered = format!("{command:?}");

    let output = command.output().map_err(|source| Error::Spawn {
        command: rendered.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(Error::Tool {
            command: rendered,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf, Error> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    Ok(std::env::current_dir().map_err(Error::Io)?.join(path))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} failed:\n{stderr}")]
    Tool { command: String, stderr: String },
    #[error("io")]
    Io(#[from] io::Error),
}
