// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Identifier bookkeeping for one program rewrite
//!
//! Tracks every name already taken at package scope and, per file, every
//! import alias, so the rewriter never introduces a colliding identifier.
//! Proposals walk the deterministic suffix sequence `P`, `P0`, `P1`, …
//! which keeps generated trees reproducible.

use std::collections::{BTreeMap, BTreeSet};

use gosource::File;

#[derive(Debug, Default)]
pub struct Names {
    package_scope: BTreeSet<String>,
    file_aliases: BTreeMap<String, BTreeSet<String>>,
}

impl Names {
    pub fn new(files: &[File]) -> Self {
        let package_scope = gosource::package_scope(files);

        let file_aliases = files
            .iter()
            .map(|file| {
                let aliases = file
                    .imports()
                    .iter()
                    .filter_map(|spec| spec.bound_name().map(ToOwned::to_owned))
                    .collect();
                (file.file_name().to_owned(), aliases)
            })
            .collect();

        Self {
            package_scope,
            file_aliases,
        }
    }

    /// Reserve a fresh package-scope identifier starting from `prefix`
    pub fn package_ident(&mut self, prefix: &str) -> String {
        let name = self.first_free(prefix, |name, names| {
            !names.package_scope.contains(name)
                && !names.file_aliases.values().any(|aliases| aliases.contains(name))
        });

        self.package_scope.insert(name.clone());

        name
    }

    /// Reserve a fresh import alias for `file`, avoiding both the file's
    /// existing aliases and every package-scope identifier
    pub fn file_alias(&mut self, file: &str, prefix: &str) -> String {
        let name = self.first_free(prefix, |name, names| {
            !names.package_scope.contains(name)
                && !names
                    .file_aliases
                    .get(file)
                    .is_some_and(|aliases| aliases.contains(name))
        });

        self.file_aliases
            .entry(file.to_owned())
            .or_default()
            .insert(name.clone());

        name
    }

    fn first_free(&self, prefix: &str, free: impl Fn(&str, &Self) -> bool) -> String {
        if free(prefix, self) {
            return prefix.to_owned();
        }

        (0..)
            .map(|n| format!("{prefix}{n}"))
            .find(|candidate| free(candidate, self))
            .unwrap_or_else(|| prefix.to_owned())
    }
}

#[cfg(test)]
mod test {
    use gosource::File;

    use super::Names;

    fn names() -> Names {
        let file = File::parse(
            "main.go",
            r#"package main

import (
	bb "fmt"
	"log"
)

var busyboxInit = 1

func busyboxInit0() {}

func main() {}
"#,
        )
        .unwrap();

        Names::new(&[file])
    }

    #[test]
    fn deterministic_suffix_walk() {
        let mut names = names();

        // `busyboxInit` and `busyboxInit0` are taken
        assert_eq!(names.package_ident("busyboxInit"), "busyboxInit1");
        assert_eq!(names.package_ident("busyboxInit"), "busyboxInit2");
        assert_eq!(names.package_ident("registeredMain"), "registeredMain");
        assert_eq!(names.package_ident("registeredMain"), "registeredMain0");
    }

    #[test]
    fn package_idents_avoid_file_aliases() {
        let mut names = names();

        // `bb` and `log` are import aliases in main.go
        assert_eq!(names.package_ident("bb"), "bb0");
        assert_eq!(names.package_ident("log"), "log0");
    }

    #[test]
    fn file_aliases_avoid_package_scope() {
        let mut names = names();

        assert_eq!(names.file_alias("main.go", "bb"), "bb0");
        // reserved above, so the walk continues
        assert_eq!(names.file_alias("main.go", "bb"), "bb1");
        // aliases are file scoped; a different file starts the walk fresh
        assert_eq!(names.file_alias("other.go", "bb"), "bb");
    }

    #[test]
    fn main_is_reserved() {
        let mut names = names();

        assert_eq!(names.package_ident("main"), "main0");
    }
}
