// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Go source front-end: parsing, a typed top-level view, span edits,
//! package-scope type resolution and initialisation order

use std::collections::BTreeSet;

pub use self::edit::Patch;
pub use self::order::{InitEntry, InitFunc, InitPlan};
pub use self::syntax::{base_name, Decl, File, ImportSpec};
pub use self::types::{ApiResolver, Inferred, PackageApi, Scope, TypeText, Types};

pub mod edit;
pub mod order;
pub mod syntax;
pub mod types;

/// Every identifier declared at package scope across `files`: functions,
/// variables, constants and type names. Blank identifiers are omitted.
pub fn package_scope(files: &[File]) -> BTreeSet<String> {
    let mut idents = BTreeSet::new();

    for file in files {
        for decl in file.decls() {
            match decl {
                Decl::Func(func) => {
                    idents.insert(func.name);
                }
                Decl::Method(_) => {}
                Decl::Var(decl) | Decl::Const(decl) => {
                    for spec in &decl.specs {
                        idents.extend(spec.names.iter().map(|i| i.name.clone()));
                    }
                }
                Decl::Type(decl) => {
                    idents.extend(decl.specs.into_iter().map(|s| s.name));
                }
            }
        }
    }

    idents.remove("_");

    idents
}

/// Sanitise a command name into a legal Go package identifier: hyphens
/// become underscores and a leading digit gains an underscore prefix.
pub fn sanitize_ident(name: &str) -> String {
    let mut ident = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>();

    if ident.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }

    if ident.is_empty() {
        ident.push('_');
    }

    ident
}

#[cfg(test)]
mod test {
    use super::{package_scope, sanitize_ident, File};

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_ident("ls"), "ls");
        assert_eq!(sanitize_ident("12-fancy-cmd"), "_12_fancy_cmd");
        assert_eq!(sanitize_ident("go-sh"), "go_sh");
    }

    #[test]
    fn scope_collects_all_files() {
        let a = File::parse(
            "a.go",
            "package demo\n\nvar x = 1\n\nfunc run() {}\n",
        )
        .unwrap();
        let b = File::parse(
            "b.go",
            "package demo\n\ntype thing struct{}\n\nconst y = 2\n\nfunc (t thing) m() {}\n",
        )
        .unwrap();

        let scope = package_scope(&[a, b]);
        let names = scope.iter().map(String::as_str).collect::<Vec<_>>();

        assert_eq!(names, vec!["run", "thing", "x", "y"]);
    }
}
