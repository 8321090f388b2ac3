// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Reading and writing Go module manifests
//!
//! Covers the directives the merge pipeline consumes: `module`, `go`,
//! `require`, `replace` and `exclude`. Everything else is preserved only in
//! the sense that the original file is copied verbatim into the output
//! tree; this model is for reconciliation, not round-tripping.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub module: String,
    pub go_version: Option<String>,
    pub requires: Vec<Require>,
    pub replaces: Vec<Replace>,
    pub excludes: Vec<ModuleRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Require {
    pub path: String,
    pub version: String,
}

/// A `replace` directive: `from [version] => to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replace {
    pub from: ModuleRef,
    pub to: Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub path: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A filesystem directory (`./fork`, `../sibling`, `/abs`)
    Local(PathBuf),
    Module(ModuleRef),
}

impl Manifest {
    pub fn parse(source: &str) -> Result<Self, Error> {
        let mut manifest = Manifest::default();
        let mut block: Option<&str> = None;

        for (number, raw) in source.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if block.is_some() {
                if line == ")" {
                    block = None;
                } else {
                    let directive = block.unwrap_or_default();
                    manifest.push(directive, &tokens(line), number + 1)?;
                }
                continue;
            }

            let words = tokens(line);
            let Some((directive, rest)) = words.split_first() else {
                continue;
            };

            match (directive.as_str(), rest) {
                ("module", [path]) => manifest.module = path.clone(),
                ("go", [version]) => manifest.go_version = Some(version.clone()),
                ("toolchain" | "retract", _) => {}
                ("require" | "replace" | "exclude", [open]) if open.as_str() == "(" => {
                    block = Some(match directive.as_str() {
                        "require" => "require",
                        "replace" => "replace",
                        _ => "exclude",
                    });
                }
                ("require" | "replace" | "exclude", rest) if !rest.is_empty() => {
                    manifest.push(directive, rest, number + 1)?;
                }
                _ => {
                    return Err(Error::Directive {
                        line: number + 1,
                        text: line.to_owned(),
                    })
                }
            }
        }

        if manifest.module.is_empty() {
            return Err(Error::MissingModule);
        }

        Ok(manifest)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source)
    }

    fn push(&mut self, directive: &str, words: &[String], line: usize) -> Result<(), Error> {
        let invalid = || Error::Directive {
            line,
            text: format!("{directive} {}", words.join(" ")),
        };

        match directive {
            "require" => {
                let [path, version] = words else {
                    return Err(invalid());
                };
                self.requires.push(Require {
                    path: path.clone(),
                    version: version.clone(),
                });
            }
            "replace" => {
                let arrow = words.iter().position(|w| w == "=>").ok_or_else(invalid)?;
                let (lhs, rhs) = words.split_at(arrow);
                let rhs = &rhs[1..];

                let from = match lhs {
                    [path] => ModuleRef {
                        path: path.clone(),
                        version: None,
                    },
                    [path, version] => ModuleRef {
                        path: path.clone(),
                        version: Some(version.clone()),
                    },
                    _ => return Err(invalid()),
                };

                let to = match rhs {
                    [target] if is_local(target) => Target::Local(PathBuf::from(target)),
                    [path] => Target::Module(ModuleRef {
                        path: path.clone(),
                        version: None,
                    }),
                    [path, version] => Target::Module(ModuleRef {
                        path: path.clone(),
                        version: Some(version.clone()),
                    }),
                    _ => return Err(invalid()),
                };

                self.replaces.push(Replace { from, to });
            }
            "exclude" => {
                let [path, version] = words else {
                    return Err(invalid());
                };
                self.excludes.push(ModuleRef {
                    path: path.clone(),
                    version: Some(version.clone()),
                });
            }
            _ => return Err(invalid()),
        }

        Ok(())
    }

    /// Replace target for `path`, if the manifest declares one
    pub fn replacement(&self, path: &str) -> Option<&Target> {
        self.replaces
            .iter()
            .rev()
            .find(|r| r.from.path == path)
            .map(|r| &r.to)
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.module)?;

        if let Some(version) = &self.go_version {
            writeln!(f, "\ngo {version}")?;
        }

        if !self.requires.is_empty() {
            writeln!(f, "\nrequire (")?;
            for require in &self.requires {
                writeln!(f, "\t{} {}", require.path, require.version)?;
            }
            writeln!(f, ")")?;
        }

        if !self.replaces.is_empty() {
            writeln!(f)?;
            for replace in &self.replaces {
                let from = match &replace.from.version {
                    Some(v) => format!("{} {v}", replace.from.path),
                    None => replace.from.path.clone(),
                };
                match &replace.to {
                    Target::Local(dir) => {
                        writeln!(f, "replace {from} => {}", dir.display())?;
                    }
                    Target::Module(m) => match &m.version {
                        Some(v) => writeln!(f, "replace {from} => {} {v}", m.path)?,
                        None => writeln!(f, "replace {from} => {}", m.path)?,
                    },
                }
            }
        }

        if !self.excludes.is_empty() {
            writeln!(f, "\nexclude (")?;
            for exclude in &self.excludes {
                writeln!(
                    f,
                    "\t{} {}",
                    exclude.path,
                    exclude.version.as_deref().unwrap_or_default()
                )?;
            }
            writeln!(f, ")")?;
        }

        Ok(())
    }
}

fn is_local(target: &str) -> bool {
    target.starts_with("./") || target.starts_with("../") || target.starts_with('/')
}

fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

fn tokens(line: &str) -> Vec<String> {
    line.split_whitespace()
        .map(|w| w.trim_matches('"').to_owned())
        .collect()
}

/// Merge `go.sum` contents: union of lines, sorted, deduplicated
pub fn merge_checksums<'a>(contents: impl IntoIterator<Item = &'a str>) -> String {
    let mut lines = contents
        .into_iter()
        .flat_map(str::lines)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>();

    lines.sort_unstable();
    lines.dedup();

    let mut merged = lines.join("\n");
    if !merged.is_empty() {
        merged.push('\n');
    }
    merged
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest has no module directive")]
    MissingModule,
    #[error("malformed directive at line {line}: {text}")]
    Directive { line: usize, text: String },
}
