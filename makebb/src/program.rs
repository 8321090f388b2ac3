// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Loading resolved command directories into fully populated [`Program`]
//! records: parsed sources, initialisation order, module identity and the
//! dependency closure needed for type resolution

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io,
    path::{Path, PathBuf},
    rc::Rc,
};

use itertools::Itertools;
use thiserror::Error;

use golist::{ModuleMode, Query};
use gosource::{ApiResolver, File, InitPlan, PackageApi};

use crate::{env::Env, resolve};

/// One command to be embedded into the dispatch binary
#[derive(Debug)]
pub struct Program {
    /// Invocation name: the basename of the source directory
    pub name: String,
    pub import_path: String,
    pub dir: PathBuf,
    /// Compiled sources in lexicographic name order
    pub files: Vec<File>,
    /// Files the compiler consumes without rewriting: assembler, embedded
    /// data, constraint-excluded sources
    pub sidecars: Vec<String>,
    pub module: Option<golist::Module>,
    pub init_plan: InitPlan,
    /// Dependency closure shared by every program of the same query batch
    pub deps: Rc<DepGraph>,
}

impl Program {
    /// Import path of this program inside the generated tree. Module-less
    /// programs (and the `_/abs/path` pseudo paths `go list` invents for
    /// them) are adopted into the synthetic module so both build
    /// disciplines can resolve them.
    pub fn target_import_path(&self) -> String {
        if self.module.is_some() && !self.import_path.starts_with('_') {
            self.import_path.clone()
        } else {
            format!("{}/cmd/{}", crate::modules::SYNTHETIC_MODULE, self.name)
        }
    }
}

/// The transitive package and module tables from one `go list -deps` batch
#[derive(Debug, Default)]
pub struct DepGraph {
    packages: HashMap<String, DepPackage>,
    pub modules: Vec<golist::Module>,
}

#[derive(Debug)]
struct DepPackage {
    dir: PathBuf,
    files: Vec<String>,
    standard: bool,
}

impl DepGraph {
    fn build(packages: &[golist::Package]) -> Self {
        let mut graph = DepGraph::default();
        let mut seen_modules = BTreeSet::new();

        for package in packages {
            graph.packages.insert(
                package.import_path.clone(),
                DepPackage {
                    dir: package.dir.clone(),
                    files: package.compiled_files().cloned().collect(),
                    standard: package.standard,
                },
            );

            if let Some(module) = &package.module {
                let key = (module.path.clone(), module.dir.clone());
                if seen_modules.insert(key) {
                    graph.modules.push(module.clone());
                }
            }
        }

        graph
    }

    pub fn contains(&self, import_path: &str) -> bool {
        self.packages.contains_key(import_path)
    }

    /// (import path, directory, standard-library?) for every package in the
    /// closure
    pub fn packages(&self) -> impl Iterator<Item = (&str, &Path, bool)> {
        self.packages
            .iter()
            .map(|(path, p)| (path.as_str(), p.dir.as_path(), p.standard))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(import_paths: &[&str]) -> Self {
        let packages = import_paths
            .iter()
            .map(|path| {
                (
                    (*path).to_owned(),
                    DepPackage {
                        dir: PathBuf::new(),
                        files: vec![],
                        standard: false,
                    },
                )
            })
            .collect();

        Self {
            packages,
            modules: vec![],
        }
    }

    pub fn dir(&self, import_path: &str) -> Option<&Path> {
        self.packages.get(import_path).map(|p| p.dir.as_path())
    }
}

/// Load every resolved directory, batched per module root
pub fn load(env: &Env, dirs: &[PathBuf]) -> Result<Vec<Program>, Error> {
    let mut programs = vec![];

    for (root, group) in resolve::group_by_module_root(dirs.to_vec())? {
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
            deps: true,
        };

        let packages = golist::list(&env.go, &query)?;
        let graph = Rc::new(DepGraph::build(&packages));

        for package in packages {
            if package.dep_only || !group.contains(&package.dir) {
                continue;
            }
            if let Some(program) = load_program(package, graph.clone())? {
                programs.push(program);
            }
        }
    }

    programs.sort_by(|a, b| a.dir.cmp(&b.dir));

    Ok(programs)
}

fn load_program(package: golist::Package, deps: Rc<DepGraph>) -> Result<Option<Program>, Error> {
    if let Some(error) = &package.error {
        if resolve::constraints_excluded(&error.err) {
            log::warn!(
                "skipping {}: build constraints exclude all Go files",
                package.import_path
            );
            return Ok(None);
        }
        return Err(Error::Package {
            import_path: package.import_path,
            message: error.err.clone(),
        });
    }

    let mut names = package.compiled_files().cloned().collect::<Vec<_>>();
    names.sort();

    if names.is_empty() {
        log::warn!("skipping {}: no buildable Go files", package.import_path);
        return Ok(None);
    }

    let files = names
        .iter()
        .map(|name| {
            let path = package.dir.join(name);
            let source = fs_err::read_to_string(&path)?;
            File::parse(path, source).map_err(Error::from)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let init_plan = gosource::order::plan(&files).map_err(|source| Error::InitOrder {
        import_path: package.import_path.clone(),
        source,
    })?;

    let name = package
        .dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(gosource::base_name(&package.import_path))
        .to_owned();

    let mut sidecars = vec![];
    sidecars.extend(package.s_files.iter().cloned());
    sidecars.extend(package.embed_files.iter().cloned());
    sidecars.extend(package.ignored_go_files.iter().cloned());
    sidecars.sort();
    sidecars.dedup();

    Ok(Some(Program {
        name,
        import_path: package.import_path,
        dir: package.dir,
        files,
        sidecars,
        module: package.module,
        init_plan,
        deps,
    }))
}

/// Enforce short-name uniqueness. When two entries are the local and the
/// fetched copy of the same command, the local copy wins unless `strict`.
pub fn check_collisions(
    programs: Vec<Program>,
    strict: bool,
    in_module_cache: impl Fn(&Path) -> bool,
) -> Result<Vec<Program>, Error> {
    let mut by_name: BTreeMap<String, Vec<usize>> = BTreeMap::new();

    for (idx, program) in programs.iter().enumerate() {
        by_name.entry(program.name.clone()).or_default().push(idx);
    }

    let mut dropped = BTreeSet::new();

    for (name, indexes) in by_name {
        if indexes.len() < 2 {
            continue;
        }

        let same_command = indexes
            .iter()
            .map(|&i| &programs[i].import_path)
            .collect::<BTreeSet<_>>()
            .len()
            == 1;

        let local = indexes
            .iter()
            .copied()
            .filter(|&i| !in_module_cache(&programs[i].dir))
            .collect::<Vec<_>>();

        if !strict && same_command && local.len() == 1 {
            for &idx in &indexes {
                if idx != local[0] {
                    log::warn!(
                        "dropping fetched copy of {name} at {:?} in favour of {:?}",
                        programs[idx].dir,
                        programs[local[0]].dir
                    );
                    dropped.insert(idx);
                }
            }
            continue;
        }

        let dirs = indexes.iter().map(|&i| format!("{:?}", programs[i].dir)).join(", ");

        return Err(Error::DuplicateCommand { name, dirs });
    }

    Ok(programs
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !dropped.contains(idx))
        .map(|(_, p)| p)
        .collect())
}

/// Lazily harvests imported package surfaces from the dependency closure
pub struct DepResolver {
    graph: Rc<DepGraph>,
    cache: HashMap<String, Rc<PackageApi>>,
}

impl DepResolver {
    pub fn new(graph: Rc<DepGraph>) -> Self {
        Self {
            graph,
            cache: HashMap::new(),
        }
    }
}

impl ApiResolver for DepResolver {
    fn api(&mut self, import_path: &str) -> Result<Rc<PackageApi>, gosource::types::Error> {
        if let Some(hit) = self.cache.get(import_path) {
            return Ok(hit.clone());
        }

        let (dir, names) = {
            let dep = self.graph.packages.get(import_path).ok_or_else(|| {
                gosource::types::Error::Api {
                    import_path: import_path.to_owned(),
                    reason: "not in the dependency graph".into(),
                }
            })?;
            (dep.dir.clone(), dep.files.clone())
        };

        let mut sorted = names;
        sorted.sort();

        let files = sorted
            .iter()
            .map(|name| {
                let path = dir.join(name);
                let source =
                    fs_err::read_to_string(&path).map_err(|e| gosource::types::Error::Api {
                        import_path: import_path.to_owned(),
                        reason: e.to_string(),
                    })?;
                File::parse(path, source).map_err(gosource::types::Error::from)
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Import graphs are acyclic, so recursing through `self` terminates.
        let api = Rc::new(PackageApi::harvest(import_path, &files, self)?);
        self.cache.insert(import_path.to_owned(), api.clone());

        Ok(api)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{import_path}: {message}")]
    Package {
        import_path: String,
        message: String,
    },
    #[error(
        "duplicate command name {name:?} from {dirs}; rename one or exclude it with -<pattern>"
    )]
    DuplicateCommand { name: String, dirs: String },
    #[error("{import_path}: initialisation order")]
    InitOrder {
        import_path: String,
        #[source]
        source: gosource::order::Error,
    },
    #[error("io")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] gosource::syntax::Error),
    #[error(transparent)]
    List(#[from] golist::Error),
    #[error(transparent)]
    Resolve(#[from] resolve::Error),
}
