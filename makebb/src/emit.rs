// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Writing the generated source tree
//!
//! The layout is dual-valid on purpose: `src/<import-path>` satisfies the
//! legacy GOPATH discipline (with GOPATH pointed at the scratch root),
//! while the synthesised manifest and its `replace` directives satisfy
//! module-mode builds of the same files.

use std::{io, path::{Path, PathBuf}};

use fs_err as fs;
use thiserror::Error;

use crate::{
    env::Env,
    modules::{registry_import, Reconciled, SYNTHETIC_MODULE},
    program::Program,
    rewrite::Rewritten,
};

/// Paths inside one scratch tree
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn src(&self) -> PathBuf {
        self.root.join("src")
    }

    /// Directory of the dispatcher package
    pub fn bb_dir(&self) -> PathBuf {
        self.package_dir(SYNTHETIC_MODULE)
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.bb_dir().join("pkg").join("bbmain")
    }

    pub fn package_dir(&self, import_path: &str) -> PathBuf {
        import_path
            .split('/')
            .fold(self.src(), |dir, segment| dir.join(segment))
    }

    pub fn module_dir(&self, module_path: &str) -> PathBuf {
        self.package_dir(module_path)
    }
}

/// Write the complete tree: rewritten programs, their sidecar files,
/// locally rooted dependency packages, per-module manifests, the
/// synthesised top-level manifest and the templated dispatcher
pub fn emit(
    layout: &Layout,
    programs: &[(&Program, Rewritten)],
    reconciled: &Reconciled,
) -> Result<(), Error> {
    // Dependency packages first so rewritten files win any overlap
    copy_local_dependencies(layout, programs, reconciled)?;

    for (program, rewritten) in programs {
        let dir = layout.package_dir(&program.target_import_path());
        fs::create_dir_all(&dir)?;

        for file in &rewritten.files {
            fs::write(dir.join(&file.name), &file.content)?;
        }

        for sidecar in &program.sidecars {
            let to = dir.join(sidecar);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(program.dir.join(sidecar), to)?;
        }
    }

    for local in &reconciled.locals {
        if let Some(manifest) = &local.manifest_path {
            let dir = layout.module_dir(&local.path);
            fs::create_dir_all(&dir)?;
            fs::copy(manifest, dir.join("go.mod"))?;
        }
    }

    let bb_dir = layout.bb_dir();
    let registry_dir = layout.registry_dir();
    fs::create_dir_all(&registry_dir)?;

    fs::write(bb_dir.join("go.mod"), reconciled.manifest.to_string())?;
    if !reconciled.checksums.is_empty() {
        fs::write(bb_dir.join("go.sum"), &reconciled.checksums)?;
    }

    fs::write(registry_dir.join("register.go"), REGISTER_GO)?;
    fs::write(
        bb_dir.join("main.go"),
        dispatcher(programs.iter().map(|(p, _)| *p)),
    )?;

    Ok(())
}

/// Packages from the dependency closure that resolve out of locally rooted
/// directories must travel with the tree, or the rebound module paths
/// would dangle.
fn copy_local_dependencies(
    layout: &Layout,
    programs: &[(&Program, Rewritten)],
    reconciled: &Reconciled,
) -> Result<(), Error> {
    let program_paths = programs
        .iter()
        .map(|(p, _)| p.import_path.as_str())
        .collect::<std::collections::BTreeSet<_>>();

    let mut copied = std::collections::BTreeSet::new();

    for (program, _) in programs {
        for (import_path, dir, standard) in program.deps.packages() {
            if standard
                || program_paths.contains(import_path)
                || import_path.starts_with('_')
                || !copied.insert(import_path.to_owned())
            {
                continue;
            }

            let local = reconciled
                .locals
                .iter()
                .any(|local| dir.starts_with(&local.dir));
            if !local {
                continue;
            }

            copy_package_files(dir, &layout.package_dir(import_path))?;
        }
    }

    Ok(())
}

/// Copy the regular files of one package directory; nested directories are
/// other packages (or test data) and are handled by their own entries
fn copy_package_files(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;

    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.metadata()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }

    Ok(())
}

/// Render the dispatcher `main` package
pub fn dispatcher<'a>(programs: impl Iterator<Item = &'a Program>) -> String {
    let mut paths = programs.map(Program::target_import_path).collect::<Vec<_>>();
    paths.sort();
    paths.dedup();

    let imports = paths
        .iter()
        .map(|path| format!("\t_ {path:?}\n"))
        .collect::<String>();

    DISPATCHER_GO
        .replace("\t//makebb:registry\n", &format!("\t{:?}\n", registry_import()))
        .replace("\t//makebb:imports\n", &imports)
}

/// Run the toolchain formatter over the generated sources. Import fix-ups
/// are out of the question (they would undo the rewriter's alias choices),
/// so this is gofmt, never goimports.
pub fn format_tree(env: &Env, layout: &Layout) -> Result<(), Error> {
    let gofmt = env.go.gofmt();

    let output = std::process::Command::new(&gofmt)
        .arg("-w")
        .arg(layout.src())
        .output()
        .map_err(|source| Error::Gofmt {
            gofmt: gofmt.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(Error::Format {
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}

const DISPATCHER_GO: &str = r##"// Command bb is a multicall binary: the command to run is chosen from the
// name it is invoked under, from the symlink pointing at it, or from its
// first argument.
//
// Generated by makebb. DO NOT EDIT.
package main

import (
	"fmt"
	"os"
	"path/filepath"
	"strings"

	//makebb:registry
	//makebb:imports
)

// interpreterMarker supports filesystems without symlinks: a script whose
// interpreter line ends in this marker has the argument vector shifted so
// argv[0] names the script itself.
const interpreterMarker = "#!gobb!#"

func run(name string) {
	if err := bbmain.Run(name); err != nil {
		fmt.Fprintln(os.Stderr, err)
		fmt.Fprintf(os.Stderr, "compiled commands: %s\n", strings.Join(bbmain.ListCmds(), " "))
		os.Exit(1)
	}
}

// lastLink follows a symlink chain up to, but never through, the final
// link, so an alias chain still yields the alias name rather than the
// binary's own.
func lastLink(path string) string {
	for {
		target, err := os.Readlink(path)
		if err != nil {
			return path
		}
		if !filepath.IsAbs(target) {
			target = filepath.Join(filepath.Dir(path), target)
		}
		if _, err := os.Readlink(target); err != nil {
			return path
		}
		path = target
	}
}

func main() {
	if len(os.Args) > 2 && os.Args[1] == interpreterMarker {
		os.Args = os.Args[2:]
	}

	name := filepath.Base(os.Args[0])
	if !bbmain.Registered(name) {
		name = filepath.Base(lastLink(os.Args[0]))
	}

	if !bbmain.Registered(name) && len(os.Args) > 1 {
		// subcommand form: bb <command> [args...]
		os.Args = os.Args[1:]
		name = filepath.Base(os.Args[0])
	}

	run(name)
}
"##;

const REGISTER_GO: &str = r#"// Package bbmain is the runtime registry of the commands compiled into
// this binary.
//
// Generated by makebb. DO NOT EDIT.
package bbmain

import (
	"fmt"
	"os"
	"path/filepath"
	"sort"
)

type command struct {
	init func()
	main func()
}

var commands = map[string]*command{}

// Register records an embedded command under its invocation name. It is
// called from generated init functions during program startup; the table
// is read-only afterwards.
func Register(name string, init func(), main func()) {
	if _, ok := commands[name]; ok {
		panic(fmt.Sprintf("bb: command %q registered twice", name))
	}
	commands[name] = &command{init: init, main: main}
}

// Registered reports whether name is an embedded command.
func Registered(name string) bool {
	_, ok := commands[name]
	return ok
}

// Run replays the named command's package initialisation, then calls its
// entry point.
func Run(name string) error {
	cmd, ok := commands[name]
	if !ok {
		return fmt.Errorf("%q is not an embedded command", name)
	}
	cmd.init()
	cmd.main()
	return nil
}

// ListCmds returns every embedded command name, sorted.
func ListCmds() []string {
	names := make([]string, 0, len(commands))
	for name := range commands {
		names = append(names, name)
	}
	sort.Strings(names)
	return names
}

// diagnose compares the registry against the symlinks that point at the
// binary, for images assembled by hand.
func diagnose() {
	fmt.Printf("%d compiled commands\n", len(commands))
	for _, name := range ListCmds() {
		fmt.Printf("  %s\n", name)
	}

	exe, err := os.Executable()
	if err != nil {
		fmt.Fprintf(os.Stderr, "bbdiagnose: %v\n", err)
		os.Exit(1)
	}
	dir := filepath.Dir(exe)
	entries, err := os.ReadDir(dir)
	if err != nil {
		fmt.Fprintf(os.Stderr, "bbdiagnose: %v\n", err)
		os.Exit(1)
	}
	for _, entry := range entries {
		link := filepath.Join(dir, entry.Name())
		target, err := os.Readlink(link)
		if err != nil {
			continue
		}
		if !filepath.IsAbs(target) {
			target = filepath.Join(dir, target)
		}
		if target == exe && !Registered(entry.Name()) {
			fmt.Printf("MISSING: %s links here but is not compiled in\n", entry.Name())
		}
	}
}

func init() {
	Register("bbdiagnose", func() {}, diagnose)
}
"#;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("failed to run {gofmt:?}: {source}")]
    Gofmt {
        gofmt: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("gofmt failed:\n{stderr}")]
    Format { stderr: String },
}

#[cfg(test)]
mod test {
    use std::{path::PathBuf, rc::Rc};

    use gosource::File;

    use super::{dispatcher, emit, Layout};
    use crate::{
        modules::reconcile,
        program::{DepGraph, Program},
        rewrite::{Rewritten, RewrittenFile},
    };

    fn program(name: &str) -> Program {
        let file = File::parse("main.go", "package main\n\nfunc main() {}\n").unwrap();

        Program {
            name: name.to_owned(),
            import_path: format!("_/abs/{name}"),
            dir: PathBuf::from(format!("/abs/{name}")),
            files: vec![file],
            sidecars: vec![],
            module: None,
            init_plan: Default::default(),
            deps: Rc::new(DepGraph::default()),
        }
    }

    #[test]
    fn dispatcher_imports_sorted() {
        let world = program("world");
        let hello = program("hello");

        let rendered = dispatcher([&world, &hello].into_iter());

        assert!(rendered.contains("\"makebb.invalid/bb/pkg/bbmain\""));
        let hello_at = rendered.find("_ \"makebb.invalid/bb/cmd/hello\"").unwrap();
        let world_at = rendered.find("_ \"makebb.invalid/bb/cmd/world\"").unwrap();
        assert!(hello_at < world_at);
        assert!(rendered.contains("#!gobb!#"));
    }

    #[test]
    fn emitted_tree_layout() {
        let temp = tempfile::tempdir().unwrap();
        let layout = Layout::new(temp.path());

        let hello = program("hello");
        let rewritten = Rewritten {
            files: vec![RewrittenFile {
                name: "main.go".into(),
                content: "package hello\n".into(),
            }],
            package_ident: "hello".into(),
        };

        let reconciled = reconcile(std::slice::from_ref(&hello), |_| false, "go1.21.5").unwrap();

        emit(&layout, &[(&hello, rewritten)], &reconciled).unwrap();

        let bb = temp.path().join("src/makebb.invalid/bb");
        assert!(bb.join("main.go").is_file());
        assert!(bb.join("go.mod").is_file());
        assert!(bb.join("pkg/bbmain/register.go").is_file());

        let program_file = bb.join("cmd/hello/main.go");
        assert_eq!(
            fs_err::read_to_string(program_file).unwrap(),
            "package hello\n"
        );

        let main_go = fs_err::read_to_string(bb.join("main.go")).unwrap();
        assert!(main_go.contains("_ \"makebb.invalid/bb/cmd/hello\""));
        assert!(!main_go.contains("//makebb:"));
    }
}
