// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Package initialisation order
//!
//! Reproduces the Go rule: repeatedly initialise the declaration-order
//! earliest package-level variable whose dependencies are all initialised,
//! where an initialiser depends on every package-level variable it
//! references, directly or through calls to package-level functions.
//! `init` functions run after all variables, in file then source order.
//!
//! Files must be supplied in lexicographic name order; that is what makes
//! the output stable across runs and operating systems.

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
};

use thiserror::Error;
use tree_sitter::Node;

use crate::syntax::{Decl, File};

/// One initialisation unit: a single `name = value` pair, or one
/// multi-target tuple assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitEntry {
    /// Index into the file list
    pub file: usize,
    pub targets: Vec<String>,
    /// Byte range of the initialiser expression; with `file`, the identity
    /// the rewriter keys generated calls on
    pub value: Range<usize>,
}

/// An `init` function declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitFunc {
    pub file: usize,
    /// Byte range of the whole declaration
    pub decl: Range<usize>,
}

#[derive(Debug, Default)]
pub struct InitPlan {
    /// Variable initialisers, in execution order
    pub entries: Vec<InitEntry>,
    /// `init` functions, in execution order
    pub init_funcs: Vec<InitFunc>,
}

pub fn plan(files: &[File]) -> Result<InitPlan, Error> {
    let mut units = vec![];
    let mut zero_valued = HashSet::new();
    let mut func_refs: HashMap<String, HashSet<String>> = HashMap::new();
    let mut init_funcs = vec![];

    for (index, file) in files.iter().enumerate() {
        let aliases = import_aliases(file);

        for decl in file.decls() {
            match decl {
                Decl::Var(decl) => {
                    for spec in &decl.specs {
                        if spec.values.is_empty() {
                            zero_valued.extend(spec.names.iter().map(|i| i.name.clone()));
                        } else if spec.values.len() == spec.names.len() {
                            for (ident, value) in spec.names.iter().zip(&spec.values) {
                                units.push(Unit {
                                    file: index,
                                    targets: vec![ident.name.clone()],
                                    value: value.byte_range(),
                                    refs: references(file, *value, &aliases),
                                });
                            }
                        } else if let Some(value) = spec.values.first() {
                            units.push(Unit {
                                file: index,
                                targets: spec.names.iter().map(|i| i.name.clone()).collect(),
                                value: value.byte_range(),
                                refs: references(file, *value, &aliases),
                            });
                        }
                    }
                }
                Decl::Func(func) => {
                    let refs = func
                        .body
                        .map(|body| references(file, body, &aliases))
                        .unwrap_or_default();

                    if func.name == "init" {
                        init_funcs.push(InitFunc {
                            file: index,
                            decl: func.node.byte_range(),
                        });
                        // init bodies cannot be referenced by initialisers
                        continue;
                    }

                    func_refs.entry(func.name.clone()).or_default().extend(refs);
                }
                _ => {}
            }
        }
    }

    let var_names = units
        .iter()
        .flat_map(|u| u.targets.iter().cloned())
        .filter(|name| name != "_")
        .collect::<HashSet<_>>();

    // Close each unit's references over package functions, keeping only
    // names that are initialised variables.
    for unit in &mut units {
        unit.refs = close_over_funcs(&unit.refs, &func_refs)
            .into_iter()
            .filter(|name| var_names.contains(name))
            .collect();
        for target in &unit.targets {
            unit.refs.remove(target);
        }
    }

    let mut initialized = zero_valued;
    let mut done = vec![false; units.len()];
    let mut entries = vec![];

    while entries.len() < units.len() {
        let ready = units
            .iter()
            .enumerate()
            .find(|(i, unit)| !done[*i] && unit.refs.iter().all(|r| initialized.contains(r)));

        match ready {
            Some((i, unit)) => {
                done[i] = true;
                initialized.extend(unit.targets.iter().filter(|t| *t != "_").cloned());
                entries.push(InitEntry {
                    file: unit.file,
                    targets: unit.targets.clone(),
                    value: unit.value.clone(),
                });
            }
            None => {
                let mut stuck = units
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !done[*i])
                    .flat_map(|(_, u)| u.targets.clone())
                    .collect::<Vec<_>>();
                stuck.sort();
                return Err(Error::Cycle { names: stuck.join(", ") });
            }
        }
    }

    Ok(InitPlan { entries, init_funcs })
}

struct Unit {
    file: usize,
    targets: Vec<String>,
    value: Range<usize>,
    refs: HashSet<String>,
}

fn import_aliases(file: &File) -> HashSet<String> {
    file.imports()
        .iter()
        .filter_map(|spec| spec.bound_name().map(ToOwned::to_owned))
        .collect()
}

/// Identifiers referenced below `node` that can name package-level
/// declarations. Struct-literal keys and selector fields are spelled as
/// `field_identifier` and fall out naturally; import qualifiers are dropped
/// via the alias set. Shadowing inside nested function literals is not
/// tracked, which can only add spurious ordering edges, never drop one.
fn references(file: &File, node: Node<'_>, aliases: &HashSet<String>) -> HashSet<String> {
    let mut refs = HashSet::new();
    collect_references(file, node, aliases, &mut refs);
    refs
}

fn collect_references(
    file: &File,
    node: Node<'_>,
    aliases: &HashSet<String>,
    refs: &mut HashSet<String>,
) {
    if node.kind() == "identifier" {
        let name = file.text(node);

        let qualifier = node
            .parent()
            .map(|p| p.kind() == "selector_expression" && aliases.contains(name))
            .unwrap_or_default();

        if !qualifier && name != "_" {
            refs.insert(name.to_owned());
        }
        return;
    }

    let mut cursor = node.walk();
    let children = node.children(&mut cursor).collect::<Vec<_>>();
    for child in children {
        collect_references(file, child, aliases, refs);
    }
}

fn close_over_funcs(
    refs: &HashSet<String>,
    func_refs: &HashMap<String, HashSet<String>>,
) -> HashSet<String> {
    let mut closed = HashSet::new();
    let mut queue = refs.iter().cloned().collect::<Vec<_>>();

    while let Some(name) = queue.pop() {
        if !closed.insert(name.clone()) {
            continue;
        }
        if let Some(nested) = func_refs.get(&name) {
            queue.extend(nested.iter().cloned());
        }
    }

    closed
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("initialisation cycle involving {names}")]
    Cycle { names: String },
}
