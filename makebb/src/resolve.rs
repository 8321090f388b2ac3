// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Pattern resolution: user supplied patterns in, a deduplicated sorted
//! set of command directories out
//!
//! Patterns come in several dialects: filesystem paths and globs, Go
//! import paths (optionally with the `...` wildcard), shell brace
//! expansions, and `-` prefixed exclusions. Filesystem candidates are
//! validated through `go list` one batch per module root; that batching
//! dominates resolution time on large command sets.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::{Path, PathBuf},
};

use regex::Regex;
use thiserror::Error;

use golist::{ModuleMode, Package, Query};

use crate::env::Env;

pub fn resolve(env: &Env, patterns: &[String]) -> Result<Vec<PathBuf>, Error> {
    let mut includes = vec![];
    let mut excludes = vec![];

    for pattern in patterns {
        match pattern.strip_prefix('-') {
            Some(exclude) if !exclude.is_empty() => excludes.push(exclude.to_owned()),
            _ => includes.push(pattern.clone()),
        }
    }

    let included = resolve_set(env, &includes)?;
    let excluded = if excludes.is_empty() {
        BTreeSet::new()
    } else {
        resolve_set(env, &excludes)?
    };

    let resolved = included.difference(&excluded).cloned().collect::<Vec<_>>();

    if resolved.is_empty() {
        return Err(Error::NoMatch {
            patterns: patterns.join(" "),
        });
    }

    Ok(resolved)
}

fn resolve_set(env: &Env, patterns: &[String]) -> Result<BTreeSet<PathBuf>, Error> {
    let mut candidates = vec![];
    let mut import_plain = vec![];
    let mut import_wildcard = vec![];

    for pattern in patterns {
        for expanded in brace_expand(pattern) {
            match classify(env, &expanded) {
                Class::Paths(paths) => candidates.extend(paths),
                Class::ImportPath(path) => {
                    if path.contains("...") || path.contains('*') {
                        import_wildcard.push(path);
                    } else {
                        import_plain.push(path);
                    }
                }
            }
        }
    }

    let mut dirs = BTreeSet::new();

    for (root, group) in group_by_module_root(candidates)? {
        let patterns = group
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>();

        let query = Query {
            dir: root.as_deref().unwrap_or(Path::new(".")),
            patterns: &patterns,
            module_mode: if root.is_some() {
                ModuleMode::Enabled
            } else {
                ModuleMode::Disabled
            },
            deps: false,
        };

        dirs.extend(eligible_dirs(golist::list(&env.go, &query)?)?);
    }

    if !import_plain.is_empty() {
        let query = Query {
            dir: Path::new("."),
            patterns: &import_plain,
            module_mode: ModuleMode::Disabled,
            deps: false,
        };

        dirs.extend(eligible_dirs(golist::list(&env.go, &query)?)?);
    }

    // Wildcard matches cannot be attributed back to their input once
    // batched, so each pattern is queried on its own and filtered.
    for pattern in import_wildcard {
        let regex = pattern_regex(&pattern);
        let patterns = vec![pattern];

        let query = Query {
            dir: Path::new("."),
            patterns: &patterns,
            module_mode: ModuleMode::Disabled,
            deps: false,
        };

        let matched = golist::list(&env.go, &query)?
            .into_iter()
            .filter(|p| regex.is_match(&p.import_path))
            .collect();

        dirs.extend(eligible_dirs(matched)?);
    }

    Ok(dirs)
}

enum Class {
    Paths(Vec<PathBuf>),
    ImportPath(String),
}

fn classify(env: &Env, pattern: &str) -> Class {
    let direct = glob_dirs(pattern);
    if !direct.is_empty() {
        return Class::Paths(direct);
    }

    let anchored = pattern.starts_with('.') || pattern.starts_with('/');
    if !anchored {
        for base in &env.search_path {
            let hits = glob_dirs(&base.join(pattern).display().to_string());
            if !hits.is_empty() {
                return Class::Paths(hits);
            }
        }
    }

    Class::ImportPath(pattern.to_owned())
}

/// Directories matching a filesystem glob; an unmatched or malformed
/// pattern simply yields nothing and falls through to import-path handling
fn glob_dirs(pattern: &str) -> Vec<PathBuf> {
    let Ok(paths) = glob::glob(pattern) else {
        return vec![];
    };

    paths
        .flatten()
        .filter(|path| path.is_dir())
        .collect()
}

/// Group candidate directories by their nearest module root. Directories
/// without one form the `None` group, queried with module mode off.
pub(crate) fn group_by_module_root(
    candidates: Vec<PathBuf>,
) -> Result<BTreeMap<Option<PathBuf>, BTreeSet<PathBuf>>, Error> {
    let mut groups: BTreeMap<Option<PathBuf>, BTreeSet<PathBuf>> = BTreeMap::new();

    for dir in candidates {
        let dir = fs_err::canonicalize(&dir)?;
        groups.entry(Env::module_root(&dir)).or_default().insert(dir);
    }

    Ok(groups)
}

/// Filter `go list` results down to buildable commands. Constraint
/// exclusions and non-command packages are logged and dropped; anything
/// else the tool reports is fatal.
fn eligible_dirs(packages: Vec<Package>) -> Result<BTreeSet<PathBuf>, Error> {
    let mut dirs = BTreeSet::new();

    for package in packages {
        if package.dep_only {
            continue;
        }

        if let Some(error) = &package.error {
            if constraints_excluded(&error.err) {
                log::warn!(
                    "skipping {}: build constraints exclude all Go files",
                    package.import_path
                );
                continue;
            }
            return Err(Error::Package {
                import_path: package.import_path,
                message: error.err.clone(),
            });
        }

        if package.compiled_files().next().is_none() {
            if package.ignored_go_files.is_empty() {
                log::warn!("skipping {}: no Go files", package.import_path);
            } else {
                log::warn!(
                    "skipping {}: build constraints exclude all Go files",
                    package.import_path
                );
            }
            continue;
        }

        if !package.is_command() {
            log::warn!(
                "skipping {}: not a command (package {})",
                package.import_path,
                package.name
            );
            continue;
        }

        dirs.insert(package.dir);
    }

    Ok(dirs)
}

pub(crate) fn constraints_excluded(message: &str) -> bool {
    message.contains("build constraints exclude all Go files")
}

/// Shell style brace expansion: `a/{x,y}/b` becomes `a/x/b`, `a/y/b`.
/// Braces may nest; a pattern without braces expands to itself.
pub fn brace_expand(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_owned()];
    };

    let mut depth = 0;
    let mut close = None;
    let mut splits = vec![];

    for (idx, c) in pattern[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + idx);
                    break;
                }
            }
            ',' if depth == 1 => splits.push(open + idx),
            _ => {}
        }
    }

    let Some(close) = close else {
        // unbalanced; treat literally
        return vec![pattern.to_owned()];
    };

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];

    let mut alternatives = vec![];
    let mut start = open + 1;
    for split in splits {
        alternatives.push(&pattern[start..split]);
        start = split + 1;
    }
    alternatives.push(&pattern[start..close]);

    alternatives
        .into_iter()
        .flat_map(|alt| brace_expand(&format!("{prefix}{alt}{suffix}")))
        .collect()
}

/// Compile an import-path pattern to a regex: `...` matches any suffix
/// including `/`, `*` and `?` stay within one path element
pub fn pattern_regex(pattern: &str) -> Regex {
    let parts = pattern
        .split("...")
        .map(|part| {
            regex::escape(part)
                .replace("\\*", "[^/]*")
                .replace("\\?", "[^/]")
        })
        .collect::<Vec<_>>();

    let expression = format!("^{}$", parts.join(".*"));

    // escaped input is always a valid expression; match nothing on the
    // impossible failure path
    Regex::new(&expression).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no commands matched: {patterns}")]
    NoMatch { patterns: String },
    #[error("{import_path}: {message}")]
    Package { import_path: String, message: String },
    #[error("io")]
    Io(#[from] io::Error),
    #[error(transparent)]
    List(#[from] golist::Error),
}
