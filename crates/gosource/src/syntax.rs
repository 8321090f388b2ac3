// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Typed view over a parsed Go source file
//!
//! Only the top level is modelled as structured data. Everything below a
//! declaration stays a raw [`Node`] so callers can walk expressions and
//! types without this module committing to a full AST.

use std::{
    ops::Range,
    path::PathBuf,
};

use thiserror::Error;
use tree_sitter::{Node, Parser, Tree};

/// One parsed Go source file. Owns the source text and the syntax tree.
pub struct File {
    pub path: PathBuf,
    pub source: String,
    tree: Tree,
}

impl File {
    pub fn parse(path: impl Into<PathBuf>, source: impl ToString) -> Result<Self, Error> {
        let path = path.into();
        let source = source.to_string();

        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_go::LANGUAGE.into())
            .map_err(|_| Error::Language)?;

        let tree = parser.parse(&source, None).ok_or(Error::Language)?;

        if tree.root_node().has_error() {
            let row = first_error_row(tree.root_node()).unwrap_or_default();
            return Err(Error::Syntax {
                path,
                line: row + 1,
            });
        }

        Ok(Self { path, source, tree })
    }

    pub fn file_name(&self) -> &str {
        self.path.file_name().and_then(|s| s.to_str()).unwrap_or_default()
    }

    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    /// Source text of `node`
    pub fn text(&self, node: Node<'_>) -> &str {
        node.utf8_text(self.source.as_bytes()).unwrap_or_default()
    }

    pub fn package_clause(&self) -> Result<PackageClause, Error> {
        let mut cursor = self.root().walk();

        for child in self.root().named_children(&mut cursor) {
            if child.kind() == "package_clause" {
                let mut inner = child.walk();
                let ident = child
                    .named_children(&mut inner)
                    .find(|n| n.kind() == "package_identifier");
                if let Some(ident) = ident {
                    return Ok(PackageClause {
                        name: self.text(ident).to_owned(),
                        name_range: ident.byte_range(),
                        end: child.end_byte(),
                    });
                }
            }
        }

        Err(Error::MissingPackageClause(self.path.clone()))
    }

    /// All imports of the file, in source order. The alias is `None` for a
    /// plain import, otherwise the literal spelling (including `_` and `.`).
    pub fn imports(&self) -> Vec<ImportSpec> {
        let mut specs = vec![];
        let mut cursor = self.root().walk();

        for child in self.root().named_children(&mut cursor) {
            if child.kind() != "import_declaration" {
                continue;
            }

            let mut inner = child.walk();
            for node in child.named_children(&mut inner) {
                match node.kind() {
                    "import_spec" => specs.extend(self.import_spec(node)),
                    "import_spec_list" => {
                        let mut list = node.walk();
                        for spec in node.named_children(&mut list) {
                            if spec.kind() == "import_spec" {
                                specs.extend(self.import_spec(spec));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        specs
    }

    fn import_spec(&self, node: Node<'_>) -> Option<ImportSpec> {
        let path_node = node.child_by_field_name("path")?;
        let alias = node.child_by_field_name("name").map(|n| self.text(n).to_owned());

        Some(ImportSpec {
            alias,
            path: unquote(self.text(path_node)),
            range: node.byte_range(),
        })
    }

    /// Byte offset where a fresh import declaration can be spliced in: after
    /// the final existing import declaration, or after the package clause.
    pub fn import_insert_offset(&self) -> Result<usize, Error> {
        let mut cursor = self.root().walk();
        let last_import = self
            .root()
            .named_children(&mut cursor)
            .filter(|n| n.kind() == "import_declaration")
            .last();

        match last_import {
            Some(node) => Ok(node.end_byte()),
            None => Ok(self.package_clause()?.end),
        }
    }

    /// Top level declarations in source order
    pub fn decls(&self) -> Vec<Decl<'_>> {
        let mut decls = vec![];
        let mut cursor = self.root().walk();

        for child in self.root().named_children(&mut cursor) {
            match child.kind() {
                "function_declaration" => {
                    if let Some(func) = self.func_decl(child, false) {
                        decls.push(Decl::Func(func));
                    }
                }
                "method_declaration" => {
                    if let Some(func) = self.func_decl(child, true) {
                        decls.push(Decl::Method(func));
                    }
                }
                "var_declaration" => decls.push(Decl::Var(self.value_decl(child, "var_spec"))),
                "const_declaration" => decls.push(Decl::Const(self.value_decl(child, "const_spec"))),
                "type_declaration" => decls.push(Decl::Type(self.type_decl(child))),
                _ => {}
            }
        }

        decls
    }

    fn func_decl<'a>(&self, node: Node<'a>, method: bool) -> Option<FuncDecl<'a>> {
        let name = node.child_by_field_name("name")?;

        Some(FuncDecl {
            name: self.text(name).to_owned(),
            name_range: name.byte_range(),
            node,
            receiver: node.child_by_field_name("receiver"),
            parameters: node.child_by_field_name("parameters"),
            result: node.child_by_field_name("result"),
            body: node.child_by_field_name("body"),
            method,
        })
    }

    fn value_decl<'a>(&self, node: Node<'a>, spec_kind: &str) -> ValueDecl<'a> {
        let mut specs = vec![];

        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let mut cursor = current.walk();
            for child in current.named_children(&mut cursor) {
                if child.kind() == spec_kind {
                    specs.push(self.value_spec(child));
                } else if child.kind().ends_with("_spec_list") {
                    stack.push(child);
                }
            }
        }

        specs.sort_by_key(|spec| spec.node.start_byte());

        ValueDecl { node, specs }
    }

    fn value_spec<'a>(&self, node: Node<'a>) -> ValueSpec<'a> {
        let mut cursor = node.walk();
        let names = node
            .children_by_field_name("name", &mut cursor)
            .map(|n| Ident {
                name: self.text(n).to_owned(),
                range: n.byte_range(),
            })
            .collect();

        let values = node
            .child_by_field_name("value")
            .map(|list| {
                let mut inner = list.walk();
                list.named_children(&mut inner).collect()
            })
            .unwrap_or_default();

        ValueSpec {
            node,
            names,
            ty: node.child_by_field_name("type"),
            values,
        }
    }

    fn type_decl<'a>(&self, node: Node<'a>) -> TypeDecl<'a> {
        let mut specs = vec![];
        let mut cursor = node.walk();

        for child in node.named_children(&mut cursor) {
            if matches!(child.kind(), "type_spec" | "type_alias") {
                if let Some(name) = child.child_by_field_name("name") {
                    specs.push(TypeSpec {
                        name: self.text(name).to_owned(),
                        node: child,
                        ty: child.child_by_field_name("type"),
                    });
                }
            }
        }

        TypeDecl { node, specs }
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File").field("path", &self.path).finish()
    }
}

#[derive(Debug, Clone)]
pub struct PackageClause {
    pub name: String,
    pub name_range: Range<usize>,
    /// Byte offset just past the clause
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    pub alias: Option<String>,
    pub path: String,
    pub range: Range<usize>,
}

impl ImportSpec {
    /// The package identifier this import binds in file scope, `None` for
    /// blank and dot imports. A plain import binds the final path element,
    /// which matches the declared package name for all conventional layouts.
    pub fn bound_name(&self) -> Option<&str> {
        match self.alias.as_deref() {
            Some("_") | Some(".") => None,
            Some(alias) => Some(alias),
            None => Some(base_name(&self.path)),
        }
    }
}

/// Final element of an import path
pub fn base_name(import_path: &str) -> &str {
    import_path.rsplit('/').next().unwrap_or(import_path)
}

pub enum Decl<'a> {
    Func(FuncDecl<'a>),
    Method(FuncDecl<'a>),
    Var(ValueDecl<'a>),
    Const(ValueDecl<'a>),
    Type(TypeDecl<'a>),
}

pub struct FuncDecl<'a> {
    pub name: String,
    pub name_range: Range<usize>,
    pub node: Node<'a>,
    pub receiver: Option<Node<'a>>,
    pub parameters: Option<Node<'a>>,
    pub result: Option<Node<'a>>,
    pub body: Option<Node<'a>>,
    pub method: bool,
}

pub struct ValueDecl<'a> {
    pub node: Node<'a>,
    pub specs: Vec<ValueSpec<'a>>,
}

pub struct ValueSpec<'a> {
    pub node: Node<'a>,
    pub names: Vec<Ident>,
    pub ty: Option<Node<'a>>,
    pub values: Vec<Node<'a>>,
}

#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub range: Range<usize>,
}

pub struct TypeDecl<'a> {
    pub node: Node<'a>,
    pub specs: Vec<TypeSpec<'a>>,
}

pub struct TypeSpec<'a> {
    pub name: String,
    pub node: Node<'a>,
    pub ty: Option<Node<'a>>,
}

/// Strip the quotes from an import path literal
fn unquote(literal: &str) -> String {
    literal
        .trim_matches('"')
        .trim_matches('`')
        .to_owned()
}

fn first_error_row(node: Node<'_>) -> Option<usize> {
    if node.is_error() || node.is_missing() {
        return Some(node.start_position().row);
    }

    let mut cursor = node.walk();
    let children = node.children(&mut cursor).collect::<Vec<_>>();

    children.into_iter().find_map(first_error_row)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("go grammar unavailable")]
    Language,
    #[error("syntax error in {path:?} at line {line}")]
    Syntax { path: PathBuf, line: usize },
    #[error("missing package clause in {0:?}")]
    MissingPackageClause(PathBuf),
}

#[cfg(test)]
mod test {
    use super::{Decl, File};

    const SOURCE: &str = r#"package main

import (
	"fmt"
	xlog "log"
	_ "embed"
)

var greeting = fmt.Sprintf("hello %s", "world")

var a, b = 1, 2

const answer = 42

type pair struct {
	left, right int
}

func helper() int { return 3 }

func main() {
	xlog.Println(greeting, a, b, answer, helper(), pair{})
}
"#;

    #[test]
    fn package_clause() {
        let file = File::parse("main.go", SOURCE).unwrap();
        let clause = file.package_clause().unwrap();

        assert_eq!(clause.name, "main");
        assert_eq!(&SOURCE[clause.name_range.clone()], "main");
    }

    #[test]
    fn imports() {
        let file = File::parse("main.go", SOURCE).unwrap();
        let imports = file.imports();

        assert_eq!(imports.len(), 3);
        assert_eq!(imports[0].path, "fmt");
        assert_eq!(imports[0].alias, None);
        assert_eq!(imports[0].bound_name(), Some("fmt"));
        assert_eq!(imports[1].alias.as_deref(), Some("xlog"));
        assert_eq!(imports[1].bound_name(), Some("xlog"));
        assert_eq!(imports[2].alias.as_deref(), Some("_"));
        assert_eq!(imports[2].bound_name(), None);
    }

    #[test]
    fn top_level_decls() {
        let file = File::parse("main.go", SOURCE).unwrap();
        let decls = file.decls();

        let mut vars = 0;
        let mut consts = 0;
        let mut funcs = vec![];
        let mut types = 0;

        for decl in &decls {
            match decl {
                Decl::Var(v) => vars += v.specs.len(),
                Decl::Const(c) => consts += c.specs.len(),
                Decl::Func(f) => funcs.push(f.name.clone()),
                Decl::Type(_) => types += 1,
                Decl::Method(_) => {}
            }
        }

        assert_eq!(vars, 2);
        assert_eq!(consts, 1);
        assert_eq!(types, 1);
        assert_eq!(funcs, vec!["helper".to_owned(), "main".to_owned()]);
    }

    #[test]
    fn multi_name_spec() {
        let file = File::parse("main.go", SOURCE).unwrap();
        let decls = file.decls();

        let Some(Decl::Var(decl)) = decls.get(1) else {
            panic!("expected var decl");
        };

        let spec = &decl.specs[0];
        let names = spec.names.iter().map(|i| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(spec.values.len(), 2);
        assert!(spec.ty.is_none());
    }

    #[test]
    fn syntax_error_reported() {
        let err = File::parse("broken.go", "package main\n\nfunc {").unwrap_err();
        assert!(err.to_string().contains("broken.go"));
    }
}
