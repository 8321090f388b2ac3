// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! End to end scenarios over a real Go toolchain.
//!
//! These run the full pipeline (resolve → load → rewrite → emit → build)
//! against throwaway modules and execute the produced binary. They need
//! `go` on PATH, so they are ignored by default:
//!
//! ```text
//! cargo test -p makebb -- --ignored
//! ```

use std::{path::Path, process::Command};

use makebb::{builder, emit, modules, program, resolve, rewrite, Env, Layout};

fn write_command(module_dir: &Path, name: &str, body: &str) {
    let dir = module_dir.join("cmd").join(name);
    fs_err::create_dir_all(&dir).unwrap();
    fs_err::write(dir.join("main.go"), body).unwrap();
}

fn write_module(root: &Path, name: &str, module_path: &str) -> std::path::PathBuf {
    let dir = root.join(name);
    fs_err::create_dir_all(&dir).unwrap();
    fs_err::write(
        dir.join("go.mod"),
        format!("module {module_path}\n\ngo 1.21\n"),
    )
    .unwrap();
    dir
}

/// The library pipeline, as the CLI drives it
fn build_busybox(patterns: &[String], scratch: &Path, output: &Path) -> Result<(), String> {
    let env = Env::new().map_err(|e| e.to_string())?;

    let dirs = resolve::resolve(&env, patterns).map_err(|e| e.to_string())?;
    let programs = program::load(&env, &dirs).map_err(|e| e.to_string())?;
    let programs = program::check_collisions(programs, false, |dir| env.go.in_module_cache(dir))
        .map_err(|e| e.to_string())?;

    let module_mode = programs.iter().all(|p| p.module.is_some());
    let reconciled =
        modules::reconcile(&programs, |dir| env.go.in_module_cache(dir), &env.go.version)
            .map_err(|e| e.to_string())?;

    let registry = modules::registry_import();
    let mut items = vec![];
    for p in &programs {
        let mut resolver = program::DepResolver::new(p.deps.clone());
        let rewritten = rewrite::rewrite(p, &mut resolver, &registry).map_err(|e| e.to_string())?;
        items.push((p, rewritten));
    }

    let layout = Layout::new(scratch);
    emit::emit(&layout, &items, &reconciled).map_err(|e| e.to_string())?;
    emit::format_tree(&env, &layout).map_err(|e| e.to_string())?;

    let options = builder::Options {
        output,
        go_args: &[],
        module_mode,
    };
    builder::build(&env, &layout, &options).map_err(|e| e.to_string())
}

fn run(binary: &Path, args: &[&str]) -> (String, bool) {
    let output = Command::new(binary).args(args).output().unwrap();
    (
        String::from_utf8_lossy(&output.stdout).into_owned(),
        output.status.success(),
    )
}

#[test]
#[ignore = "requires a Go toolchain"]
fn merged_commands_dispatch_by_name() {
    let temp = tempfile::tempdir().unwrap();
    let module = write_module(temp.path(), "mod", "example.com/mod");

    write_command(
        &module,
        "helloworld",
        "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(\"hello world\")\n}\n",
    );
    write_command(
        &module,
        "getppid",
        "package main\n\nimport (\n\t\"fmt\"\n\t\"os\"\n)\n\nfunc main() {\n\tfmt.Println(os.Getppid())\n}\n",
    );

    let scratch = temp.path().join("scratch");
    let output = temp.path().join("bb");

    build_busybox(
        &[format!("{}/cmd/*", module.display())],
        &scratch,
        &output,
    )
    .unwrap();

    let (stdout, ok) = run(&output, &["helloworld"]);
    assert!(ok);
    assert_eq!(stdout, "hello world\n");

    let (stdout, ok) = run(&output, &["getppid"]);
    assert!(ok);
    assert!(stdout.trim().parse::<u32>().is_ok());

    // unknown commands list the registry and fail
    let failed = Command::new(&output).arg("no-such-cmd").output().unwrap();
    assert!(!failed.status.success());
    let stderr = String::from_utf8_lossy(&failed.stderr);
    assert!(stderr.contains("helloworld"));
    assert!(stderr.contains("getppid"));
}

#[test]
#[ignore = "requires a Go toolchain"]
fn awkward_names_are_sanitised_but_dispatchable() {
    let temp = tempfile::tempdir().unwrap();
    let module = write_module(temp.path(), "mod", "example.com/mod");

    write_command(
        &module,
        "12-fancy-cmd",
        "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(\"12-fancy-cmd\")\n}\n",
    );

    let scratch = temp.path().join("scratch");
    let output = temp.path().join("bb");

    build_busybox(
        &[format!("{}/cmd/12-fancy-cmd", module.display())],
        &scratch,
        &output,
    )
    .unwrap();

    let (stdout, ok) = run(&output, &["12-fancy-cmd"]);
    assert!(ok);
    assert_eq!(stdout, "12-fancy-cmd\n");
}

#[test]
#[ignore = "requires a Go toolchain"]
fn initialisation_order_is_preserved() {
    let temp = tempfile::tempdir().unwrap();
    let module = write_module(temp.path(), "mod", "example.com/mod");

    // b's initialiser depends on a's, and init comes last
    write_command(
        &module,
        "order",
        r#"package main

import "fmt"

var trace []string

var b = record("b", a+1)

var a = record("a", 1)

func record(name string, v int) int {
	trace = append(trace, name)
	return v
}

func init() {
	trace = append(trace, "init")
}

func main() {
	fmt.Println(trace, a, b)
}
"#,
    );

    let scratch = temp.path().join("scratch");
    let output = temp.path().join("bb");

    build_busybox(
        &[format!("{}/cmd/order", module.display())],
        &scratch,
        &output,
    )
    .unwrap();

    let (stdout, ok) = run(&output, &["order"]);
    assert!(ok);
    assert_eq!(stdout, "[a b init] 1 2\n");
}

#[test]
#[ignore = "requires a Go toolchain"]
fn duplicate_short_names_are_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let mod5 = write_module(temp.path(), "mod5", "example.com/mod5");
    let mod6 = write_module(temp.path(), "mod6", "example.com/mod6");

    let body = "package main\n\nfunc main() {}\n";
    write_command(&mod5, "hello", body);
    write_command(&mod6, "hello", body);

    let scratch = temp.path().join("scratch");
    let output = temp.path().join("bb");

    let err = build_busybox(
        &[
            format!("{}/cmd/hello", mod5.display()),
            format!("{}/cmd/hello", mod6.display()),
        ],
        &scratch,
        &output,
    )
    .unwrap_err();

    assert!(err.contains("duplicate command name"), "{err}");
}

#[test]
#[ignore = "requires a Go toolchain"]
fn exclusions_subtract_from_the_resolved_set() {
    let temp = tempfile::tempdir().unwrap();
    let module = write_module(temp.path(), "mod", "example.com/mod");

    write_command(
        &module,
        "keep",
        "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(\"keep\")\n}\n",
    );
    write_command(&module, "drop", "package main\n\nfunc main() {}\n");

    let scratch = temp.path().join("scratch");
    let output = temp.path().join("bb");

    build_busybox(
        &[
            format!("{}/cmd/*", module.display()),
            format!("-{}/cmd/drop", module.display()),
        ],
        &scratch,
        &output,
    )
    .unwrap();

    let (stdout, ok) = run(&output, &["keep"]);
    assert!(ok);
    assert_eq!(stdout, "keep\n");

    let failed = Command::new(&output).arg("drop").output().unwrap();
    assert!(!failed.status.success());
}
