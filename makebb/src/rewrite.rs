// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The source rewrite: one `main` package in, one library package out
//!
//! Each file is rewritten as a set of span edits over the original text:
//! the package clause takes the command's (sanitised) name, the entry
//! point and every `init` function are renamed, and every initialised
//! package-level `var` is split into a bare declaration plus a numbered
//! helper function carrying the assignment. A synthesised aggregate
//! initialiser replays the helpers in the package's original
//! initialisation order, and a fresh `init` registers the command with
//! the dispatch registry.

use std::{collections::HashMap, ops::Range};

use itertools::Itertools;
use thiserror::Error;

use gosource::{
    types::{self, PkgRef, TypeText},
    ApiResolver, Decl, File, Patch, Scope, Types,
};

use crate::{names::Names, program::Program};

#[derive(Debug)]
pub struct Rewritten {
    pub files: Vec<RewrittenFile>,
    /// The identifier the package now declares
    pub package_ident: String,
}

#[derive(Debug)]
pub struct RewrittenFile {
    pub name: String,
    pub content: String,
}

/// Rewrite `program` into a self-registering library package.
/// `registry_import` is the import path of the dispatch registry package.
pub fn rewrite(
    program: &Program,
    resolver: &mut dyn ApiResolver,
    registry_import: &str,
) -> Result<Rewritten, Error> {
    let mut names = Names::new(&program.files);
    let package_ident = gosource::sanitize_ident(&program.name);

    let entry = locate_entry_point(program)?;

    let main_name = names.package_ident("registeredMain");
    let aggregate_name = names.package_ident("busyboxInit");

    let scope = Scope::build(&program.import_path, &program.files)?;
    let mut types = Types::new(&scope, resolver);

    let mut patches = vec![];
    let mut tails = vec![];
    let mut value_calls: HashMap<(usize, Range<usize>), String> = HashMap::new();
    let mut init_renames: HashMap<(usize, Range<usize>), String> = HashMap::new();

    for (index, file) in program.files.iter().enumerate() {
        let mut patch = Patch::new();
        let mut tail = String::new();
        let mut qualifier = Qualifier::new(file);

        let clause = file.package_clause()?;
        patch.replace(clause.name_range, &package_ident);

        for decl in file.decls() {
            match decl {
                Decl::Func(func) => {
                    if func.name == "main" {
                        patch.replace(func.name_range.clone(), &main_name);
                    } else if func.name == "init" {
                        let helper = names.package_ident("busyboxInit");
                        patch.replace(func.name_range.clone(), &helper);
                        init_renames.insert((index, func.node.byte_range()), helper);
                    }
                }
                Decl::Var(decl) => {
                    let grouped = {
                        let mut cursor = decl.node.walk();
                        let grouped = decl
                            .node
                            .named_children(&mut cursor)
                            .any(|c| c.kind() == "var_spec_list");
                        grouped
                    };

                    for spec in &decl.specs {
                        if spec.values.is_empty() {
                            continue;
                        }

                        lift_var_spec(
                            program,
                            file,
                            index,
                            spec,
                            grouped,
                            decl.node.byte_range(),
                            &mut names,
                            &mut types,
                            &mut qualifier,
                            &mut patch,
                            &mut tail,
                            &mut value_calls,
                        )?;
                    }
                }
                _ => {}
            }
        }

        if !qualifier.pending.is_empty() {
            patch.insert(file.import_insert_offset()?, qualifier.pending_imports());
        }

        patches.push(patch);
        tails.push(tail);
    }

    // Aggregate initialiser: lifted assignments in initialisation order,
    // then the renamed init functions.
    let mut calls = vec![];

    for entry_init in &program.init_plan.entries {
        let key = (entry_init.file, entry_init.value.clone());
        let call = value_calls.get(&key).ok_or_else(|| Error::InitOrder {
            program: program.import_path.clone(),
            target: entry_init.targets.join(", "),
        })?;
        calls.push(call.clone());
    }

    for init in &program.init_plan.init_funcs {
        let call = init_renames
            .get(&(init.file, init.decl.clone()))
            .ok_or_else(|| Error::InitOrder {
                program: program.import_path.clone(),
                target: "init".into(),
            })?;
        calls.push(call.clone());
    }

    let entry_file = &program.files[entry];
    let mut aggregate = format!("\n\nfunc {aggregate_name}() {{\n");
    for call in &calls {
        aggregate.push_str(&format!("\t{call}()\n"));
    }
    aggregate.push('}');
    tails[entry].push_str(&aggregate);

    let alias = names.file_alias(entry_file.file_name(), "bb");
    patches[entry].insert(
        entry_file.import_insert_offset()?,
        format!("\n\nimport {alias} {registry_import:?}"),
    );
    tails[entry].push_str(&format!(
        "\n\nfunc init() {{\n\t{alias}.Register({:?}, {aggregate_name}, {main_name})\n}}",
        program.name
    ));

    let files = program
        .files
        .iter()
        .zip(patches.iter_mut())
        .zip(&tails)
        .map(|((file, patch), tail)| {
            if !tail.is_empty() {
                patch.insert(file.source.len(), format!("{}\n", tail.trim_end()));
            }
            Ok(RewrittenFile {
                name: file.file_name().to_owned(),
                content: patch.apply(&file.source)?,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(Rewritten {
        files,
        package_ident,
    })
}

fn locate_entry_point(program: &Program) -> Result<usize, Error> {
    let mut entry = None;

    for (index, file) in program.files.iter().enumerate() {
        for decl in file.decls() {
            if let Decl::Func(func) = decl {
                if func.name == "main" {
                    if entry.is_some() {
                        return Err(Error::MultipleEntryPoints {
                            program: program.import_path.clone(),
                        });
                    }
                    entry = Some(index);
                }
            }
        }
    }

    entry.ok_or_else(|| Error::NoEntryPoint {
        program: program.import_path.clone(),
    })
}

/// Split one initialised var spec into declarations and helper functions
#[allow(clippy::too_many_arguments)]
fn lift_var_spec(
    program: &Program,
    file: &File,
    index: usize,
    spec: &gosource::syntax::ValueSpec<'_>,
    grouped: bool,
    decl_range: Range<usize>,
    names: &mut Names,
    types: &mut Types<'_, '_>,
    qualifier: &mut Qualifier,
    patch: &mut Patch,
    tail: &mut String,
    value_calls: &mut HashMap<(usize, Range<usize>), String>,
) -> Result<(), Error> {
    let mut decl_specs = vec![];

    if let Some(ty) = spec.ty {
        // The written type survives; every name keeps sharing it.
        let written = file.text(ty);
        let all = spec.names.iter().map(|i| i.name.as_str()).join(", ");
        decl_specs.push(format!("{all} {written}"));
    } else {
        for (position, ident) in spec.names.iter().enumerate() {
            if ident.name == "_" {
                continue;
            }

            let inferred =
                types
                    .infer_spec_name(file, spec, position)
                    .map_err(|source| Error::Lift {
                        program: program.import_path.clone(),
                        name: ident.name.clone(),
                        source,
                    })?;

            let rendered = render_type(&inferred, program, file, names, qualifier)?;
            decl_specs.push(format!("{} {rendered}", ident.name));
        }
    }

    // Helper functions carrying the assignments
    if spec.values.len() == spec.names.len() {
        for (ident, value) in spec.names.iter().zip(&spec.values) {
            let helper = names.package_ident("busyboxInit");
            tail.push_str(&format!(
                "\n\nfunc {helper}() {{\n\t{} = {}\n}}",
                ident.name,
                file.text(*value)
            ));
            value_calls.insert((index, value.byte_range()), helper);
        }
    } else if let Some(value) = spec.values.first() {
        let helper = names.package_ident("busyboxInit");
        let targets = spec.names.iter().map(|i| i.name.as_str()).join(", ");
        tail.push_str(&format!(
            "\n\nfunc {helper}() {{\n\t{targets} = {}\n}}",
            file.text(*value)
        ));
        value_calls.insert((index, value.byte_range()), helper);
    }

    // Replace the spec (inside a block) or the whole declaration
    if grouped {
        if decl_specs.is_empty() {
            patch.delete(spec.node.byte_range());
        } else {
            patch.replace(spec.node.byte_range(), decl_specs.join("\n\t"));
        }
    } else if decl_specs.is_empty() {
        patch.delete(decl_range);
    } else {
        patch.replace(decl_range, format!("var {}", decl_specs.join("\nvar ")));
    }

    Ok(())
}

fn render_type(
    ty: &TypeText,
    program: &Program,
    file: &File,
    names: &mut Names,
    qualifier: &mut Qualifier,
) -> Result<String, Error> {
    let mut resolved = Vec::with_capacity(ty.refs.len());

    for r in &ty.refs {
        resolved.push(qualifier.qualify(names, program, file, r)?);
    }

    Ok(ty.render_with(&resolved))
}

/// Rewrites package references in lifted types to whatever qualifier is
/// visible in the file under rewrite, adding imports when nothing is
#[derive(Debug, Default)]
struct Qualifier {
    file_name: String,
    /// import path → usable qualifier, from the file's own imports
    bound: HashMap<String, String>,
    /// import path → alias introduced by this rewrite
    introduced: HashMap<String, String>,
    pending: Vec<(String, String)>,
}

impl Qualifier {
    fn new(file: &File) -> Self {
        let mut bound = HashMap::new();

        for spec in file.imports() {
            if let Some(name) = spec.bound_name() {
                bound.entry(spec.path.clone()).or_insert_with(|| name.to_owned());
            }
        }

        Self {
            file_name: file.file_name().to_owned(),
            bound,
            ..Default::default()
        }
    }

    fn qualify(
        &mut self,
        names: &mut Names,
        program: &Program,
        file: &File,
        r: &PkgRef,
    ) -> Result<String, Error> {
        if r.import_path == program.import_path {
            return Ok(r.name.clone());
        }

        if let Some(qualifier) = self.bound.get(&r.import_path) {
            return Ok(format!("{qualifier}.{}", r.name));
        }

        if let Some(alias) = self.introduced.get(&r.import_path) {
            return Ok(format!("{alias}.{}", r.name));
        }

        if !program.deps.contains(&r.import_path) {
            return Err(Error::Unimported {
                program: program.import_path.clone(),
                import_path: r.import_path.clone(),
            });
        }

        let prefix = gosource::sanitize_ident(gosource::base_name(&r.import_path));
        let alias = names.file_alias(&self.file_name, &prefix);

        log::debug!(
            "{}: importing {} as {alias} for a lifted type",
            file.file_name(),
            r.import_path
        );

        self.introduced.insert(r.import_path.clone(), alias.clone());
        self.pending.push((alias.clone(), r.import_path.clone()));

        Ok(format!("{alias}.{}", r.name))
    }

    fn pending_imports(&self) -> String {
        self.pending
            .iter()
            .map(|(alias, path)| format!("\n\nimport {alias} {path:?}"))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{program}: no entry point found")]
    NoEntryPoint { program: String },
    #[error("{program}: multiple entry points found")]
    MultipleEntryPoints { program: String },
    #[error("{program}: cannot lift initialiser of `{name}`")]
    Lift {
        program: String,
        name: String,
        #[source]
        source: types::Error,
    },
    #[error("{program}: lifted type refers to {import_path}, which is not in the import graph")]
    Unimported {
        program: String,
        import_path: String,
    },
    #[error("{program}: no lifted initialiser matches the ordering entry for `{target}`")]
    InitOrder { program: String, target: String },
    #[error(transparent)]
    Syntax(#[from] gosource::syntax::Error),
    #[error(transparent)]
    Types(#[from] types::Error),
    #[error(transparent)]
    Edit(#[from] gosource::edit::Error),
}

#[cfg(test)]
mod test {
    use std::{path::PathBuf, rc::Rc};

    use gosource::{types, ApiResolver, File, PackageApi, TypeText};

    use super::rewrite;
    use crate::program::{DepGraph, Program};

    struct Canned;

    impl ApiResolver for Canned {
        fn api(&mut self, import_path: &str) -> Result<Rc<PackageApi>, types::Error> {
            let mut api = PackageApi {
                import_path: import_path.to_owned(),
                ..Default::default()
            };

            match import_path {
                "flag" => {
                    api.name = "flag".into();
                    api.funcs.insert(
                        "Bool".into(),
                        types::FuncSig {
                            results: vec![TypeText::pointer(TypeText::basic("bool"))],
                            value_type: TypeText::basic("func(string, bool, string) *bool"),
                        },
                    );
                }
                _ => {
                    return Err(types::Error::Api {
                        import_path: import_path.to_owned(),
                        reason: "not canned".into(),
                    })
                }
            }

            Ok(Rc::new(api))
        }
    }

    fn program(name: &str, sources: &[(&str, &str)], deps: &[&str]) -> Program {
        let mut files = sources
            .iter()
            .map(|(file, source)| File::parse(*file, *source).unwrap())
            .collect::<Vec<_>>();
        files.sort_by(|a, b| a.file_name().to_owned().cmp(&b.file_name().to_owned()));

        let init_plan = gosource::order::plan(&files).unwrap();

        Program {
            name: name.to_owned(),
            import_path: format!("example.com/cmds/{name}"),
            dir: PathBuf::from(format!("/src/cmds/{name}")),
            files,
            sidecars: vec![],
            module: None,
            init_plan,
            deps: Rc::new(DepGraph::for_tests(deps)),
        }
    }

    const HELLO: &str = r#"package main

import (
	"flag"
	"fmt"
)

var verbose = flag.Bool("v", false, "verbose output")

var greeting, count = "hello", 3

func init() {
	fmt.Println("starting")
}

func main() {
	fmt.Println(greeting, count, *verbose)
}
"#;

    #[test]
    fn full_rewrite() {
        let program = program("hello", &[("main.go", HELLO)], &["flag", "fmt"]);
        let rewritten = rewrite(&program, &mut Canned, "test.invalid/bb/pkg/bbmain").unwrap();

        assert_eq!(rewritten.package_ident, "hello");
        let content = &rewritten.files[0].content;

        assert!(content.starts_with("package hello\n"));
        assert!(content.contains("func registeredMain() {"));
        assert!(!content.contains("func main()"));

        // lifted declarations keep their types
        assert!(content.contains("var verbose *bool"));
        assert!(content.contains("var greeting string"));
        assert!(content.contains("var count int"));

        // helpers carry the original initialiser expressions
        assert!(content.contains("verbose = flag.Bool(\"v\", false, \"verbose output\")"));
        assert!(content.contains("greeting = \"hello\""));
        assert!(content.contains("count = 3"));

        // the aggregate initialiser replays declaration order, then init
        let aggregate =
            "func busyboxInit() {\n\tbusyboxInit0()\n\tbusyboxInit1()\n\tbusyboxInit2()\n\tbusyboxInit3()\n}";
        assert!(content.contains(aggregate), "missing aggregate in:\n{content}");

        // self-registration with an arbiter-chosen alias
        assert!(content.contains("import bb \"test.invalid/bb/pkg/bbmain\""));
        assert!(content.contains("bb.Register(\"hello\", busyboxInit, registeredMain)"));
    }

    #[test]
    fn sanitised_package_name() {
        let source = "package main\n\nfunc main() {}\n";
        let program = program("12-fancy-cmd", &[("main.go", source)], &[]);
        let rewritten = rewrite(&program, &mut Canned, "test.invalid/bb/pkg/bbmain").unwrap();

        assert_eq!(rewritten.package_ident, "_12_fancy_cmd");
        assert!(rewritten.files[0].content.starts_with("package _12_fancy_cmd\n"));
        assert!(rewritten.files[0]
            .content
            .contains("bb.Register(\"12-fancy-cmd\","));
    }

    #[test]
    fn qualifier_synthesises_missing_import() {
        let a = r#"package main

var srv = makeServer()

func main() {}
"#;
        let b = r#"package main

import xlib "example.com/xlib"

func makeServer() *xlib.Server {
	return nil
}
"#;

        let program = program(
            "serve",
            &[("a.go", a), ("b.go", b)],
            &["example.com/xlib"],
        );
        let rewritten = rewrite(&program, &mut Canned, "test.invalid/bb/pkg/bbmain").unwrap();

        let a_out = &rewritten.files[0].content;
        assert!(a_out.contains("import xlib \"example.com/xlib\""));
        assert!(a_out.contains("var srv *xlib.Server"));
    }

    #[test]
    fn missing_entry_point_is_fatal() {
        let source = "package main\n\nfunc run() {}\n";
        let program = program("broken", &[("main.go", source)], &[]);

        let err = rewrite(&program, &mut Canned, "test.invalid/bb/pkg/bbmain").unwrap_err();
        assert!(err.to_string().contains("no entry point"));
    }

    #[test]
    fn duplicate_entry_points_are_fatal() {
        let a = "package main\n\nfunc main() {}\n";
        let b = "package main\n\nfunc main() {}\n";
        let program = program("twice", &[("a.go", a), ("b.go", b)], &[]);

        let err = rewrite(&program, &mut Canned, "test.invalid/bb/pkg/bbmain").unwrap_err();
        assert!(err.to_string().contains("multiple entry points"));
    }

    #[test]
    fn grouped_declarations_rewritten_in_place() {
        let source = r#"package main

var (
	first  = 1
	second = "two"
	third  int
)

func main() {}
"#;

        let program = program("grouped", &[("main.go", source)], &[]);
        let rewritten = rewrite(&program, &mut Canned, "test.invalid/bb/pkg/bbmain").unwrap();
        let content = &rewritten.files[0].content;

        assert!(content.contains("first int"));
        assert!(content.contains("second string"));
        // untouched zero-valued spec survives
        assert!(content.contains("third  int"));
        assert!(content.contains("first = 1"));
        assert!(content.contains("second = \"two\""));
    }

    #[test]
    fn blank_assignments_keep_side_effects() {
        let source = r#"package main

var _ = register()

func register() int {
	return 1
}

func main() {}
"#;

        let program = program("blank", &[("main.go", source)], &[]);
        let rewritten = rewrite(&program, &mut Canned, "test.invalid/bb/pkg/bbmain").unwrap();
        let content = &rewritten.files[0].content;

        assert!(!content.contains("var _ ="));
        assert!(content.contains("_ = register()"));
    }
}
