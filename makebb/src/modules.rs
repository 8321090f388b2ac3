// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Module reconciliation: which modules are locally rooted, whether their
//! bindings agree, and the synthesised top-level manifest that ties the
//! output tree together

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use thiserror::Error;

use gomod::{Manifest, ModuleRef, Replace, Require, Target};

use crate::program::Program;

/// Module identifier of the generated tree. The `.invalid` TLD cannot be
/// routed, so it can never collide with a real module path.
pub const SYNTHETIC_MODULE: &str = "makebb.invalid/bb";

/// Import path of the generated registry package
pub fn registry_import() -> String {
    format!("{SYNTHETIC_MODULE}/pkg/bbmain")
}

/// A module whose sources live in a concrete local directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModule {
    pub path: String,
    pub dir: PathBuf,
    pub manifest_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Reconciled {
    /// Locally rooted modules, sorted by module path
    pub locals: Vec<LocalModule>,
    /// The synthesised top-level manifest
    pub manifest: Manifest,
    /// Concatenated checksum database for the generated tree
    pub checksums: String,
}

#[derive(Debug, Clone)]
struct Binding {
    dir: PathBuf,
    manifest_path: Option<PathBuf>,
    origin: Origin,
}

#[derive(Debug, Clone)]
enum Origin {
    /// Directly requested on the command line
    Requested,
    /// Bound by a `replace` directive in `manifest`
    Declared(PathBuf),
}

pub fn reconcile(
    programs: &[Program],
    in_module_cache: impl Fn(&Path) -> bool,
    go_version: &str,
) -> Result<Reconciled, Error> {
    let mut bindings: BTreeMap<String, Binding> = BTreeMap::new();

    // Requested modules first
    for program in programs {
        let Some(module) = &program.module else {
            continue;
        };
        let Some(dir) = &module.dir else {
            continue;
        };
        if in_module_cache(dir) {
            continue;
        }

        let binding = Binding {
            dir: dir.clone(),
            manifest_path: module.go_mod.clone(),
            origin: Origin::Requested,
        };

        if let Some(existing) = bindings.get(&module.path) {
            if existing.dir != *dir {
                return Err(conflict(&module.path, existing, &binding));
            }
            continue;
        }

        bindings.insert(module.path.clone(), binding);
    }

    // One level of `replace` directives from the requested modules'
    // manifests. Directives declared further down the graph are neither
    // honoured nor reconciled here.
    let requested = bindings.values().cloned().collect::<Vec<_>>();

    for binding in requested {
        let Some(manifest_path) = &binding.manifest_path else {
            continue;
        };
        let manifest = Manifest::load(manifest_path)?;

        for replace in &manifest.replaces {
            let Target::Local(target) = &replace.to else {
                continue;
            };

            let dir = resolve_target(&binding.dir, target);
            let declared = Binding {
                manifest_path: existing_manifest(&dir),
                dir,
                origin: Origin::Declared(manifest_path.clone()),
            };

            match bindings.get(&replace.from.path) {
                Some(existing) if existing.dir != declared.dir => {
                    return Err(conflict(&replace.from.path, existing, &declared));
                }
                Some(_) => {}
                None => {
                    bindings.insert(replace.from.path.clone(), declared);
                }
            }
        }
    }

    // Remote use of a locally bound module is a conflict the user has to
    // resolve in the offending manifest; we cannot pick a side.
    for program in programs {
        for module in &program.deps.modules {
            let Some(binding) = bindings.get(&module.path) else {
                continue;
            };

            let remote = match &module.dir {
                Some(dir) => in_module_cache(dir) && *dir != binding.dir,
                None => true,
            };

            if remote {
                return Err(Error::RemoteLocal {
                    path: module.path.clone(),
                    dir: binding.dir.clone(),
                });
            }
        }
    }

    let locals = bindings
        .into_iter()
        .map(|(path, binding)| LocalModule {
            path,
            dir: binding.dir,
            manifest_path: binding.manifest_path,
        })
        .collect::<Vec<_>>();

    let manifest = synthesise_manifest(&locals, go_version);
    let checksums = merge_local_checksums(&locals);

    Ok(Reconciled {
        locals,
        manifest,
        checksums,
    })
}

fn conflict(path: &str, existing: &Binding, incoming: &Binding) -> Error {
    let (requested, declared) = match (&existing.origin, &incoming.origin) {
        (Origin::Declared(a), Origin::Declared(_)) => {
            return Error::DuplicateLocal {
                path: path.to_owned(),
                a: existing.dir.clone(),
                b: incoming.dir.clone(),
                manifest: a.clone(),
            }
        }
        (Origin::Requested, Origin::Declared(m)) => (existing, m.clone()),
        (Origin::Declared(m), Origin::Requested) => (incoming, m.clone()),
        (Origin::Requested, Origin::Requested) => {
            return Error::DuplicateLocal {
                path: path.to_owned(),
                a: existing.dir.clone(),
                b: incoming.dir.clone(),
                manifest: PathBuf::new(),
            }
        }
    };

    Error::RequestedConflict {
        path: path.to_owned(),
        requested: requested.dir.clone(),
        manifest: declared,
    }
}

fn resolve_target(module_dir: &Path, target: &Path) -> PathBuf {
    let joined = if target.is_absolute() {
        target.to_path_buf()
    } else {
        module_dir.join(target)
    };

    fs_err::canonicalize(&joined).unwrap_or(joined)
}

fn existing_manifest(dir: &Path) -> Option<PathBuf> {
    let manifest = dir.join("go.mod");
    manifest.is_file().then_some(manifest)
}

/// The top-level manifest: requires every local module and rebinds each to
/// its copy inside the generated tree
fn synthesise_manifest(locals: &[LocalModule], go_version: &str) -> Manifest {
    let ups = "../".repeat(SYNTHETIC_MODULE.split('/').count());

    Manifest {
        module: SYNTHETIC_MODULE.to_owned(),
        go_version: Some(go_version.trim_start_matches("go").to_owned()),
        requires: locals
            .iter()
            .map(|local| Require {
                path: local.path.clone(),
                version: "v0.0.0".to_owned(),
            })
            .collect(),
        replaces: locals
            .iter()
            .map(|local| Replace {
                from: ModuleRef {
                    path: local.path.clone(),
                    version: None,
                },
                to: Target::Local(PathBuf::from(format!("{ups}{}", local.path))),
            })
            .collect(),
        excludes: vec![],
    }
}

fn merge_local_checksums(locals: &[LocalModule]) -> String {
    let sums = locals
        .iter()
        .filter_map(|local| fs_err::read_to_string(local.dir.join("go.sum")).ok())
        .collect::<Vec<_>>();

    gomod::merge_checksums(sums.iter().map(String::as_str))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("module {path} is bound to two local directories, {a:?} and {b:?} (see {manifest:?}); remove one of the replace directives")]
    DuplicateLocal {
        path: String,
        a: PathBuf,
        b: PathBuf,
        manifest: PathBuf,
    },
    #[error("module {path} is rebound locally but still fetched remotely elsewhere; add `replace {path} => {dir:?}` to the go.mod of every module requiring it")]
    RemoteLocal { path: String, dir: PathBuf },
    #[error("requested module {path} from {requested:?}, but {manifest:?} binds it elsewhere; add `replace {path} => {requested:?}` there")]
    RequestedConflict {
        path: String,
        requested: PathBuf,
        manifest: PathBuf,
    },
    #[error(transparent)]
    Manifest(#[from] gomod::Error),
}

#[cfg(test)]
mod test {
    use std::{path::PathBuf, rc::Rc};

    use gosource::File;

    use super::{reconcile, SYNTHETIC_MODULE};
    use crate::program::{DepGraph, Program};

    fn program(name: &str, module: Option<golist::Module>) -> Program {
        let file = File::parse("main.go", "package main\n\nfunc main() {}\n").unwrap();

        Program {
            name: name.to_owned(),
            import_path: format!("example.com/{name}"),
            dir: PathBuf::from(format!("/src/{name}")),
            files: vec![file],
            sidecars: vec![],
            module,
            init_plan: Default::default(),
            deps: Rc::new(DepGraph::default()),
        }
    }

    fn module(path: &str, dir: &std::path::Path) -> golist::Module {
        golist::Module {
            path: path.to_owned(),
            main: true,
            dir: Some(dir.to_path_buf()),
            go_mod: Some(dir.join("go.mod")),
            ..Default::default()
        }
    }

    #[test]
    fn synthesised_manifest_shape() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("mod5");
        fs_err::create_dir_all(&dir).unwrap();
        fs_err::write(dir.join("go.mod"), "module example.com/mod5\n\ngo 1.21\n").unwrap();

        let programs = vec![program("hello", Some(module("example.com/mod5", &dir)))];
        let reconciled = reconcile(&programs, |_| false, "go1.21.5").unwrap();

        assert_eq!(reconciled.locals.len(), 1);
        assert_eq!(reconciled.manifest.module, SYNTHETIC_MODULE);
        assert_eq!(reconciled.manifest.go_version.as_deref(), Some("1.21.5"));
        assert_eq!(reconciled.manifest.requires.len(), 1);
        assert_eq!(reconciled.manifest.requires[0].version, "v0.0.0");

        let rendered = reconciled.manifest.to_string();
        assert!(rendered.contains("replace example.com/mod5 => ../../example.com/mod5"));
    }

    #[test]
    fn replace_directives_root_additional_modules() {
        let temp = tempfile::tempdir().unwrap();
        let mod5 = temp.path().join("mod5");
        let dep = temp.path().join("dep");
        fs_err::create_dir_all(&mod5).unwrap();
        fs_err::create_dir_all(&dep).unwrap();
        fs_err::write(
            mod5.join("go.mod"),
            "module example.com/mod5\n\ngo 1.21\n\nreplace example.com/dep => ../dep\n",
        )
        .unwrap();
        fs_err::write(dep.join("go.mod"), "module example.com/dep\n").unwrap();

        let programs = vec![program("hello", Some(module("example.com/mod5", &mod5)))];
        let reconciled = reconcile(&programs, |_| false, "go1.21.5").unwrap();

        let paths = reconciled
            .locals
            .iter()
            .map(|l| l.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["example.com/dep", "example.com/mod5"]);
    }

    #[test]
    fn duplicate_local_definitions_conflict() {
        let temp = tempfile::tempdir().unwrap();
        let mod5 = temp.path().join("mod5");
        let mod6 = temp.path().join("mod6");
        let fork_a = temp.path().join("fork-a");
        let fork_b = temp.path().join("fork-b");

        for dir in [&mod5, &mod6, &fork_a, &fork_b] {
            fs_err::create_dir_all(dir).unwrap();
        }
        fs_err::write(
            mod5.join("go.mod"),
            "module example.com/mod5\n\nreplace example.com/dep => ../fork-a\n",
        )
        .unwrap();
        fs_err::write(
            mod6.join("go.mod"),
            "module example.com/mod6\n\nreplace example.com/dep => ../fork-b\n",
        )
        .unwrap();
        fs_err::write(fork_a.join("go.mod"), "module example.com/dep\n").unwrap();
        fs_err::write(fork_b.join("go.mod"), "module example.com/dep\n").unwrap();

        let programs = vec![
            program("one", Some(module("example.com/mod5", &mod5))),
            program("two", Some(module("example.com/mod6", &mod6))),
        ];

        let err = reconcile(&programs, |_| false, "go1.21.5").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("example.com/dep"));
        assert!(message.contains("two local directories"));
    }

    #[test]
    fn requested_vs_declared_conflict() {
        let temp = tempfile::tempdir().unwrap();
        let mod5 = temp.path().join("mod5");
        let dep = temp.path().join("dep");
        let fork = temp.path().join("fork");

        for dir in [&mod5, &dep, &fork] {
            fs_err::create_dir_all(dir).unwrap();
        }
        fs_err::write(
            mod5.join("go.mod"),
            "module example.com/mod5\n\nreplace example.com/dep => ../fork\n",
        )
        .unwrap();
        fs_err::write(dep.join("go.mod"), "module example.com/dep\n").unwrap();
        fs_err::write(fork.join("go.mod"), "module example.com/dep\n").unwrap();

        let programs = vec![
            program("one", Some(module("example.com/mod5", &mod5))),
            program("two", Some(module("example.com/dep", &dep))),
        ];

        let err = reconcile(&programs, |_| false, "go1.21.5").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("example.com/dep"));
        assert!(message.contains("replace example.com/dep =>"));
    }

    #[test]
    fn empty_module_set_is_fine() {
        let programs = vec![program("hello", None)];
        let reconciled = reconcile(&programs, |_| false, "go1.21.5").unwrap();

        assert!(reconciled.locals.is_empty());
        assert!(reconciled.manifest.requires.is_empty());
    }
}
