// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Package-scope type resolution
//!
//! Answers one question for the rewriter: when a package-level `var` has no
//! written type, what type does its initialiser produce, spelled as Go
//! source? Types are kept textual ([`TypeText`]) with every named-type
//! occurrence annotated by its declaring package, so the rewriter can
//! re-qualify them for whichever file they land in.

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    rc::Rc,
};

use thiserror::Error;
use tree_sitter::Node;

use crate::syntax::{Decl, File, FuncDecl};

/// A Go type spelled as source text. `refs` mark the named types inside
/// `text` (byte ranges relative to `text`) together with the import path of
/// the package declaring them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeText {
    pub text: String,
    pub refs: Vec<PkgRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgRef {
    /// Range of the full named-type token inside `text`, e.g. `flag.Bool`
    pub range: Range<usize>,
    pub import_path: String,
    pub name: String,
}

impl TypeText {
    pub fn basic(name: &str) -> Self {
        Self {
            text: name.to_owned(),
            refs: vec![],
        }
    }

    pub fn named(import_path: &str, name: &str) -> Self {
        Self {
            text: name.to_owned(),
            refs: vec![PkgRef {
                range: 0..name.len(),
                import_path: import_path.to_owned(),
                name: name.to_owned(),
            }],
        }
    }

    pub fn pointer(elem: Self) -> Self {
        elem.prefixed("*")
    }

    pub fn slice(elem: Self) -> Self {
        elem.prefixed("[]")
    }

    fn prefixed(mut self, prefix: &str) -> Self {
        for r in &mut self.refs {
            r.range = r.range.start + prefix.len()..r.range.end + prefix.len();
        }
        self.text.insert_str(0, prefix);
        self
    }

    /// Rebuild the type with each `refs[i]` token replaced by `resolved[i]`
    pub fn render_with(&self, resolved: &[String]) -> String {
        let mut refs = self.refs.iter().zip(resolved).collect::<Vec<_>>();
        refs.sort_by_key(|(r, _)| r.range.start);

        let mut out = String::with_capacity(self.text.len());
        let mut cursor = 0;

        for (r, replacement) in refs {
            out.push_str(&self.text[cursor..r.range.start]);
            out.push_str(replacement);
            cursor = r.range.end;
        }
        out.push_str(&self.text[cursor..]);

        out
    }

    fn sub_range(&self, range: Range<usize>) -> Self {
        let refs = self
            .refs
            .iter()
            .filter(|r| r.range.start >= range.start && r.range.end <= range.end)
            .map(|r| PkgRef {
                range: r.range.start - range.start..r.range.end - range.start,
                import_path: r.import_path.clone(),
                name: r.name.clone(),
            })
            .collect();

        Self {
            text: self.text[range].to_owned(),
            refs,
        }
    }

    /// `*E` → `E`
    pub fn peel_pointer(&self) -> Option<Self> {
        self.text
            .starts_with('*')
            .then(|| self.sub_range(1..self.text.len()))
    }

    /// `[]E`, `[N]E` → `E`; `map[K]V` → `V`
    pub fn peel_element(&self) -> Option<Self> {
        if let Some(rest) = self.text.strip_prefix("map") {
            let close = matching_bracket(rest)?;
            let start = self.text.len() - rest.len() + close + 1;
            return Some(self.sub_range(start..self.text.len()));
        }
        if self.text.starts_with('[') {
            let close = matching_bracket(&self.text)?;
            return Some(self.sub_range(close + 1..self.text.len()));
        }
        None
    }

    /// `chan E`, `<-chan E` → `E`
    pub fn peel_chan(&self) -> Option<Self> {
        let rest = self
            .text
            .strip_prefix("<-chan")
            .or_else(|| self.text.strip_prefix("chan"))?;
        let trimmed = rest.trim_start();
        let start = self.text.len() - trimmed.len();
        Some(self.sub_range(start..self.text.len()))
    }

    /// `[N]E` → `[]E`, leaves slices untouched
    pub fn array_to_slice(&self) -> Option<Self> {
        if self.text.starts_with("[]") {
            return Some(self.clone());
        }
        self.peel_element().map(TypeText::slice)
    }
}

/// Byte offset of the `]` closing the first `[` of `text`
fn matching_bracket(text: &str) -> Option<usize> {
    let open = text.find('[')?;
    let mut depth = 0;

    for (idx, c) in text[open..].char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + idx);
                }
            }
            _ => {}
        }
    }

    None
}

/// Result of inferring one expression
#[derive(Debug, Clone)]
pub enum Inferred {
    Single(TypeText),
    Tuple(Vec<TypeText>),
}

impl Inferred {
    pub fn into_single(self) -> Result<TypeText, Error> {
        match self {
            Inferred::Single(t) => Ok(t),
            Inferred::Tuple(_) => Err(Error::CannotInfer {
                expr: "multi-value expression in single-value context".into(),
            }),
        }
    }

    pub fn into_tuple(self) -> Vec<TypeText> {
        match self {
            Inferred::Single(t) => vec![t],
            Inferred::Tuple(ts) => ts,
        }
    }
}

const PREDECLARED_TYPES: &[&str] = &[
    "any", "bool", "byte", "comparable", "complex64", "complex128", "error", "float32", "float64",
    "int", "int8", "int16", "int32", "int64", "rune", "string", "uint", "uint8", "uint16",
    "uint32", "uint64", "uintptr",
];

pub fn is_predeclared_type(name: &str) -> bool {
    PREDECLARED_TYPES.contains(&name)
}

/// Spell the type written at `node` as a [`TypeText`], resolving package
/// qualifiers through `file`'s import table. `self_path` is the import path
/// of the package `file` belongs to.
pub fn resolve_type(file: &File, node: Node<'_>, self_path: &str) -> Result<TypeText, Error> {
    let base = node.start_byte();
    let text = file.text(node).to_owned();
    let mut refs = vec![];

    collect_type_refs(file, node, self_path, base, &mut refs)?;

    Ok(TypeText { text, refs })
}

fn collect_type_refs(
    file: &File,
    node: Node<'_>,
    self_path: &str,
    base: usize,
    refs: &mut Vec<PkgRef>,
) -> Result<(), Error> {
    match node.kind() {
        "qualified_type" => {
            let package = node
                .child_by_field_name("package")
                .map(|n| file.text(n).to_owned())
                .unwrap_or_default();
            let name = node
                .child_by_field_name("name")
                .map(|n| file.text(n).to_owned())
                .unwrap_or_default();

            let import_path = imported_path(file, &package).ok_or(Error::UnknownQualifier {
                qualifier: package,
                file: file.file_name().to_owned(),
            })?;

            refs.push(PkgRef {
                range: node.start_byte() - base..node.end_byte() - base,
                import_path,
                name,
            });
        }
        "type_identifier" => {
            let name = file.text(node);

            if !is_predeclared_type(name) {
                refs.push(PkgRef {
                    range: node.start_byte() - base..node.end_byte() - base,
                    import_path: self_path.to_owned(),
                    name: name.to_owned(),
                });
            }
        }
        _ => {
            let mut cursor = node.walk();
            let children = node.named_children(&mut cursor).collect::<Vec<_>>();
            for child in children {
                collect_type_refs(file, child, self_path, base, refs)?;
            }
        }
    }

    Ok(())
}

/// Import path bound to `qualifier` in `file`'s scope
fn imported_path(file: &File, qualifier: &str) -> Option<String> {
    file.imports()
        .into_iter()
        .find(|spec| spec.bound_name() == Some(qualifier))
        .map(|spec| spec.path)
}

/// The exported (and, for the package under rewrite, unexported) surface of
/// one package, as harvested from its parsed sources.
#[derive(Debug, Default)]
pub struct PackageApi {
    pub import_path: String,
    pub name: String,
    pub funcs: HashMap<String, FuncSig>,
    pub vars: HashMap<String, Option<TypeText>>,
    pub consts: HashMap<String, Option<TypeText>>,
    pub types: HashMap<String, TypeApi>,
}

#[derive(Debug, Clone)]
pub struct FuncSig {
    pub results: Vec<TypeText>,
    /// The function's own type, for when it is used as a value
    pub value_type: TypeText,
}

#[derive(Debug, Default)]
pub struct TypeApi {
    pub methods: HashMap<String, FuncSig>,
    pub fields: HashMap<String, TypeText>,
}

impl PackageApi {
    /// Harvest the declared surface of a package from its sources. Types of
    /// initialiser-only `var`s are inferred where possible; failures leave a
    /// `None` entry rather than aborting the harvest.
    pub fn harvest(
        import_path: &str,
        files: &[File],
        resolver: &mut dyn ApiResolver,
    ) -> Result<Self, Error> {
        let mut api = PackageApi {
            import_path: import_path.to_owned(),
            ..Default::default()
        };

        if let Some(file) = files.first() {
            api.name = file.package_clause()?.name;
        }

        // Declared surface first, inference afterwards so that vars may
        // reference anything in the package.
        for file in files {
            for decl in file.decls() {
                match decl {
                    Decl::Func(func) => {
                        if let Ok(sig) = func_sig(file, &func, import_path) {
                            api.funcs.insert(func.name.clone(), sig);
                        }
                    }
                    Decl::Method(func) => {
                        let Some(receiver) = receiver_base(file, &func) else {
                            continue;
                        };
                        if let Ok(sig) = func_sig(file, &func, import_path) {
                            api.types.entry(receiver).or_default().methods.insert(func.name.clone(), sig);
                        }
                    }
                    Decl::Var(decl) => {
                        for spec in &decl.specs {
                            let ty = spec
                                .ty
                                .and_then(|node| resolve_type(file, node, import_path).ok());
                            for ident in &spec.names {
                                api.vars.insert(ident.name.clone(), ty.clone());
                            }
                        }
                    }
                    Decl::Const(decl) => {
                        for spec in &decl.specs {
                            let ty = spec
                                .ty
                                .and_then(|node| resolve_type(file, node, import_path).ok());
                            for ident in &spec.names {
                                api.consts.insert(ident.name.clone(), ty.clone());
                            }
                        }
                    }
                    Decl::Type(decl) => {
                        for spec in decl.specs {
                            let entry = api.types.entry(spec.name.clone()).or_default();
                            if let Some(ty) = spec.ty {
                                if ty.kind() == "struct_type" {
                                    harvest_struct_fields(file, ty, import_path, &mut entry.fields);
                                }
                            }
                        }
                    }
                }
            }
        }

        let scope = Scope::build(import_path, files)?;
        let mut types = Types::new(&scope, resolver);

        for file in files {
            for decl in file.decls() {
                if let Decl::Var(ref decl) = decl {
                    for spec in &decl.specs {
                        if spec.ty.is_some() {
                            continue;
                        }
                        for (idx, ident) in spec.names.iter().enumerate() {
                            let inferred = types.infer_spec_name(file, spec, idx);
                            if let Ok(ty) = inferred {
                                api.vars.insert(ident.name.clone(), Some(ty));
                            } else {
                                log::debug!(
                                    "{}: no inferred type for var {}",
                                    import_path,
                                    ident.name
                                );
                            }
                        }
                    }
                }
                if let Decl::Const(decl) = decl {
                    for spec in &decl.specs {
                        if spec.ty.is_some() {
                            continue;
                        }
                        for (idx, ident) in spec.names.iter().enumerate() {
                            if let Some(value) = spec.values.get(idx) {
                                if let Ok(ty) =
                                    types.infer(file, *value).and_then(Inferred::into_single)
                                {
                                    api.consts.insert(ident.name.clone(), Some(ty));
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(api)
    }
}

fn harvest_struct_fields(
    file: &File,
    struct_node: Node<'_>,
    self_path: &str,
    fields: &mut HashMap<String, TypeText>,
) {
    let mut cursor = struct_node.walk();
    let Some(list) = struct_node
        .named_children(&mut cursor)
        .find(|n| n.kind() == "field_declaration_list")
    else {
        return;
    };

    let mut inner = list.walk();
    for field in list.named_children(&mut inner) {
        if field.kind() != "field_declaration" {
            continue;
        }
        let Some(ty) = field.child_by_field_name("type") else {
            continue;
        };
        let Ok(resolved) = resolve_type(file, ty, self_path) else {
            continue;
        };
        let mut names = field.walk();
        for name in field.children_by_field_name("name", &mut names) {
            fields.insert(file.text(name).to_owned(), resolved.clone());
        }
    }
}

fn func_sig(file: &File, func: &FuncDecl<'_>, self_path: &str) -> Result<FuncSig, Error> {
    let results = match func.result {
        None => vec![],
        Some(result) => result_types(file, result, self_path)?,
    };

    Ok(FuncSig {
        results,
        value_type: func_type_text(file, func.parameters, func.result, self_path)?,
    })
}

fn result_types(file: &File, result: Node<'_>, self_path: &str) -> Result<Vec<TypeText>, Error> {
    if result.kind() != "parameter_list" {
        return Ok(vec![resolve_type(file, result, self_path)?]);
    }

    let mut types = vec![];
    let mut cursor = result.walk();

    for decl in result.named_children(&mut cursor) {
        if decl.kind() != "parameter_declaration" && decl.kind() != "variadic_parameter_declaration" {
            continue;
        }
        let Some(ty) = decl.child_by_field_name("type") else {
            continue;
        };
        let resolved = resolve_type(file, ty, self_path)?;

        let mut names = decl.walk();
        let count = decl.children_by_field_name("name", &mut names).count().max(1);
        types.extend(std::iter::repeat(resolved).take(count));
    }

    Ok(types)
}

fn func_type_text(
    file: &File,
    parameters: Option<Node<'_>>,
    result: Option<Node<'_>>,
    self_path: &str,
) -> Result<TypeText, Error> {
    let mut text = String::from("func");
    let mut refs = vec![];

    if let Some(params) = parameters {
        let offset = text.len();
        text.push_str(file.text(params));
        append_refs(file, params, self_path, offset, &mut refs)?;
    } else {
        text.push_str("()");
    }

    if let Some(result) = result {
        text.push(' ');
        let offset = text.len();
        text.push_str(file.text(result));
        append_refs(file, result, self_path, offset, &mut refs)?;
    }

    Ok(TypeText { text, refs })
}

fn append_refs(
    file: &File,
    node: Node<'_>,
    self_path: &str,
    offset: usize,
    refs: &mut Vec<PkgRef>,
) -> Result<(), Error> {
    let mut local = vec![];
    collect_type_refs(file, node, self_path, node.start_byte(), &mut local)?;

    refs.extend(local.into_iter().map(|mut r| {
        r.range = r.range.start + offset..r.range.end + offset;
        r
    }));

    Ok(())
}

fn receiver_base(file: &File, func: &FuncDecl<'_>) -> Option<String> {
    let receiver = func.receiver?;
    let mut cursor = receiver.walk();
    let decl = receiver
        .named_children(&mut cursor)
        .find(|n| n.kind() == "parameter_declaration")?;
    let mut ty = decl.child_by_field_name("type")?;

    loop {
        match ty.kind() {
            "pointer_type" => {
                let mut inner = ty.walk();
                ty = ty.named_children(&mut inner).next()?;
            }
            "generic_type" => {
                ty = ty.child_by_field_name("type")?;
            }
            "type_identifier" => return Some(file.text(ty).to_owned()),
            _ => return None,
        }
    }
}

/// Supplies the harvested surface of an imported package. Implemented by the
/// loader on top of `go list`; tests supply canned tables.
pub trait ApiResolver {
    fn api(&mut self, import_path: &str) -> Result<Rc<PackageApi>, Error>;
}

/// Package-level declarations of the package under inference
pub struct Scope<'a> {
    pub import_path: String,
    funcs: HashMap<String, FuncEntry<'a>>,
    methods: HashMap<String, HashMap<String, FuncEntry<'a>>>,
    vars: HashMap<String, VarEntry<'a>>,
    consts: HashMap<String, VarEntry<'a>>,
    types: HashMap<String, TypeEntry<'a>>,
}

struct FuncEntry<'a> {
    file: &'a File,
    parameters: Option<Node<'a>>,
    result: Option<Node<'a>>,
}

struct VarEntry<'a> {
    file: &'a File,
    ty: Option<Node<'a>>,
    /// (value expression, position of this name, total names in the spec)
    value: Option<(Node<'a>, usize, usize)>,
}

struct TypeEntry<'a> {
    file: &'a File,
    ty: Option<Node<'a>>,
}

impl<'a> Scope<'a> {
    pub fn build(import_path: &str, files: &'a [File]) -> Result<Self, Error> {
        let mut scope = Scope {
            import_path: import_path.to_owned(),
            funcs: HashMap::new(),
            methods: HashMap::new(),
            vars: HashMap::new(),
            consts: HashMap::new(),
            types: HashMap::new(),
        };

        for file in files {
            for decl in file.decls() {
                match decl {
                    Decl::Func(func) => {
                        scope.funcs.insert(
                            func.name.clone(),
                            FuncEntry {
                                file,
                                parameters: func.parameters,
                                result: func.result,
                            },
                        );
                    }
                    Decl::Method(func) => {
                        if let Some(receiver) = receiver_base(file, &func) {
                            scope.methods.entry(receiver).or_default().insert(
                                func.name.clone(),
                                FuncEntry {
                                    file,
                                    parameters: func.parameters,
                                    result: func.result,
                                },
                            );
                        }
                    }
                    Decl::Var(decl) => scope.add_values(file, &decl.specs, false),
                    Decl::Const(decl) => scope.add_values(file, &decl.specs, true),
                    Decl::Type(decl) => {
                        for spec in decl.specs {
                            scope.types.insert(spec.name.clone(), TypeEntry { file, ty: spec.ty });
                        }
                    }
                }
            }
        }

        Ok(scope)
    }

    fn add_values(&mut self, file: &'a File, specs: &[crate::syntax::ValueSpec<'a>], consts: bool) {
        for spec in specs {
            let total = spec.names.len();
            for (idx, ident) in spec.names.iter().enumerate() {
                let value = if spec.values.len() == total {
                    spec.values.get(idx).map(|v| (*v, idx, total))
                } else {
                    spec.values.first().map(|v| (*v, idx, total))
                };

                let entry = VarEntry {
                    file,
                    ty: spec.ty,
                    value,
                };

                if consts {
                    self.consts.insert(ident.name.clone(), entry);
                } else {
                    self.vars.insert(ident.name.clone(), entry);
                }
            }
        }
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }
}

/// Expression type inference over a [`Scope`], pulling imported surfaces
/// through an [`ApiResolver`]
pub struct Types<'a, 'r> {
    scope: &'a Scope<'a>,
    resolver: &'r mut dyn ApiResolver,
    in_flight: HashSet<String>,
}

impl<'a, 'r> Types<'a, 'r> {
    pub fn new(scope: &'a Scope<'a>, resolver: &'r mut dyn ApiResolver) -> Self {
        Self {
            scope,
            resolver,
            in_flight: HashSet::new(),
        }
    }

    /// Type of name `idx` of a var spec, honouring tuple assignment
    pub fn infer_spec_name(
        &mut self,
        file: &File,
        spec: &crate::syntax::ValueSpec<'_>,
        idx: usize,
    ) -> Result<TypeText, Error> {
        if let Some(ty) = spec.ty {
            return resolve_type(file, ty, &self.scope.import_path);
        }

        if spec.values.len() == spec.names.len() {
            let value = spec.values.get(idx).ok_or_else(|| cannot(file, spec.node))?;
            return self.infer(file, *value)?.into_single();
        }

        // n names, one multi-value expression
        let value = spec.values.first().ok_or_else(|| cannot(file, spec.node))?;
        let tuple = self.infer(file, *value)?.into_tuple();
        tuple.get(idx).cloned().ok_or_else(|| cannot(file, *value))
    }

    pub fn infer(&mut self, file: &File, node: Node<'_>) -> Result<Inferred, Error> {
        let single = |t: TypeText| Ok(Inferred::Single(t));

        match node.kind() {
            "int_literal" | "iota" => single(TypeText::basic("int")),
            "float_literal" => single(TypeText::basic("float64")),
            "imaginary_literal" => single(TypeText::basic("complex128")),
            "rune_literal" => single(TypeText::basic("rune")),
            "interpreted_string_literal" | "raw_string_literal" => {
                single(TypeText::basic("string"))
            }
            "true" | "false" => single(TypeText::basic("bool")),
            "parenthesized_expression" => {
                let inner = node.named_child(0).ok_or_else(|| cannot(file, node))?;
                self.infer(file, inner)
            }
            "identifier" => self.infer_ident(file, node),
            "selector_expression" => self.infer_selector(file, node),
            "call_expression" => self.infer_call(file, node),
            "composite_literal" => {
                let ty = node
                    .child_by_field_name("type")
                    .ok_or_else(|| cannot(file, node))?;
                single(resolve_type(file, ty, &self.scope.import_path)?)
            }
            "type_conversion_expression" => {
                let ty = node
                    .child_by_field_name("type")
                    .ok_or_else(|| cannot(file, node))?;
                single(resolve_type(file, ty, &self.scope.import_path)?)
            }
            "type_assertion_expression" => {
                let ty = node
                    .child_by_field_name("type")
                    .ok_or_else(|| cannot(file, node))?;
                single(resolve_type(file, ty, &self.scope.import_path)?)
            }
            "unary_expression" => self.infer_unary(file, node),
            "binary_expression" => self.infer_binary(file, node),
            "index_expression" => {
                let operand = node
                    .child_by_field_name("operand")
                    .ok_or_else(|| cannot(file, node))?;
                let base = self.infer(file, operand)?.into_single()?;
                let base = base.peel_pointer().unwrap_or(base);
                base.peel_element()
                    .map(Inferred::Single)
                    .ok_or_else(|| cannot(file, node))
            }
            "slice_expression" => {
                let operand = node
                    .child_by_field_name("operand")
                    .ok_or_else(|| cannot(file, node))?;
                let base = self.infer(file, operand)?.into_single()?;
                if base.text == "string" {
                    return single(base);
                }
                base.array_to_slice()
                    .map(Inferred::Single)
                    .ok_or_else(|| cannot(file, node))
            }
            "func_literal" => single(func_type_text(
                file,
                node.child_by_field_name("parameters"),
                node.child_by_field_name("result"),
                &self.scope.import_path,
            )?),
            _ => Err(cannot(file, node)),
        }
    }

    fn infer_ident(&mut self, file: &File, node: Node<'_>) -> Result<Inferred, Error> {
        let name = file.text(node).to_owned();

        if let Some(entry) = self.scope.vars.get(&name).or_else(|| self.scope.consts.get(&name)) {
            return self.infer_entry(&name, entry).map(Inferred::Single);
        }

        if let Some(func) = self.scope.funcs.get(&name) {
            return Ok(Inferred::Single(func_type_text(
                func.file,
                func.parameters,
                func.result,
                &self.scope.import_path,
            )?));
        }

        Err(cannot(file, node))
    }

    fn infer_entry(&mut self, name: &str, entry: &VarEntry<'a>) -> Result<TypeText, Error> {
        if let Some(ty) = entry.ty {
            return resolve_type(entry.file, ty, &self.scope.import_path);
        }

        let Some((value, idx, total)) = entry.value else {
            return Err(Error::CannotInfer {
                expr: name.to_owned(),
            });
        };

        // Initialiser cycles are rejected by the Go compiler; guard anyway.
        if !self.in_flight.insert(name.to_owned()) {
            return Err(Error::CannotInfer {
                expr: name.to_owned(),
            });
        }

        let result = (|| {
            let inferred = self.infer(entry.file, value)?;
            if total == 1 {
                inferred.into_single()
            } else {
                match inferred {
                    Inferred::Single(t) => Ok(t),
                    Inferred::Tuple(ts) => ts.get(idx).cloned().ok_or(Error::CannotInfer {
                        expr: name.to_owned(),
                    }),
                }
            }
        })();

        self.in_flight.remove(name);

        result
    }

    fn infer_selector(&mut self, file: &File, node: Node<'_>) -> Result<Inferred, Error> {
        let operand = node
            .child_by_field_name("operand")
            .ok_or_else(|| cannot(file, node))?;
        let field = node
            .child_by_field_name("field")
            .map(|n| file.text(n).to_owned())
            .ok_or_else(|| cannot(file, node))?;

        // pkg.Member
        if operand.kind() == "identifier" {
            let qualifier = file.text(operand);
            if let Some(path) = imported_path(file, qualifier) {
                let api = self.resolver.api(&path)?;

                if let Some(Some(ty)) = api.vars.get(&field).or_else(|| api.consts.get(&field)) {
                    return Ok(Inferred::Single(ty.clone()));
                }
                if let Some(sig) = api.funcs.get(&field) {
                    return Ok(Inferred::Single(sig.value_type.clone()));
                }
                return Err(cannot(file, node));
            }
        }

        // value.Field
        let base = self.infer(file, operand)?.into_single()?;
        let base = base.peel_pointer().unwrap_or(base);
        let field_ty = self
            .named_ref(&base)
            .and_then(|r| self.field_type(&r, &field))
            .ok_or_else(|| cannot(file, node))?;

        Ok(Inferred::Single(field_ty))
    }

    fn infer_call(&mut self, file: &File, node: Node<'_>) -> Result<Inferred, Error> {
        let function = node
            .child_by_field_name("function")
            .ok_or_else(|| cannot(file, node))?;
        let arguments = node.child_by_field_name("arguments");

        match function.kind() {
            "identifier" => {
                let name = file.text(function).to_owned();

                if let Some(result) = self.builtin_call(file, &name, arguments)? {
                    return Ok(result);
                }

                if is_predeclared_type(&name) {
                    return Ok(Inferred::Single(TypeText::basic(&name)));
                }

                if self.scope.has_type(&name) {
                    return Ok(Inferred::Single(TypeText::named(&self.scope.import_path, &name)));
                }

                if let Some(func) = self.scope.funcs.get(&name) {
                    let results = match func.result {
                        None => vec![],
                        Some(result) => {
                            result_types(func.file, result, &self.scope.import_path)?
                        }
                    };
                    return results_to_inferred(results, file, node);
                }

                Err(cannot(file, node))
            }
            "selector_expression" => {
                let operand = function
                    .child_by_field_name("operand")
                    .ok_or_else(|| cannot(file, node))?;
                let field = function
                    .child_by_field_name("field")
                    .map(|n| file.text(n).to_owned())
                    .ok_or_else(|| cannot(file, node))?;

                // pkg.Func(...) / pkg.Type(...)
                if operand.kind() == "identifier" {
                    let qualifier = file.text(operand);
                    if let Some(path) = imported_path(file, qualifier) {
                        let api = self.resolver.api(&path)?;

                        if let Some(sig) = api.funcs.get(&field) {
                            return results_to_inferred(sig.results.clone(), file, node);
                        }
                        if api.types.contains_key(&field) {
                            return Ok(Inferred::Single(TypeText::named(&path, &field)));
                        }
                        return Err(cannot(file, node));
                    }
                }

                // value.Method(...)
                let base = self.infer(file, operand)?.into_single()?;
                let base = base.peel_pointer().unwrap_or(base);
                let named = self.named_ref(&base).ok_or_else(|| cannot(file, node))?;
                let results = self
                    .method_results(&named, &field)
                    .ok_or_else(|| cannot(file, node))??;

                results_to_inferred(results, file, node)
            }
            "parenthesized_expression" | "func_literal" => {
                let callee = if function.kind() == "func_literal" {
                    function
                } else {
                    function.named_child(0).ok_or_else(|| cannot(file, node))?
                };
                if callee.kind() == "func_literal" {
                    let results = match callee.child_by_field_name("result") {
                        None => vec![],
                        Some(result) => result_types(file, result, &self.scope.import_path)?,
                    };
                    return results_to_inferred(results, file, node);
                }
                Err(cannot(file, node))
            }
            // []byte(x) and friends
            _ if is_type_node(function.kind()) => Ok(Inferred::Single(resolve_type(
                file,
                function,
                &self.scope.import_path,
            )?)),
            _ => Err(cannot(file, node)),
        }
    }

    fn builtin_call(
        &mut self,
        file: &File,
        name: &str,
        arguments: Option<Node<'_>>,
    ) -> Result<Option<Inferred>, Error> {
        let first_arg = || {
            arguments
                .and_then(|args| {
                    let mut cursor = args.walk();
                    let first = args.named_children(&mut cursor).next();
                    first
                })
                .ok_or(Error::CannotInfer {
                    expr: name.to_owned(),
                })
        };

        let result = match name {
            "len" | "cap" | "copy" => Inferred::Single(TypeText::basic("int")),
            "make" => Inferred::Single(resolve_type(file, first_arg()?, &self.scope.import_path)?),
            "new" => Inferred::Single(TypeText::pointer(resolve_type(
                file,
                first_arg()?,
                &self.scope.import_path,
            )?)),
            "append" | "min" | "max" => self.infer(file, first_arg()?)?,
            "complex" => Inferred::Single(TypeText::basic("complex128")),
            "real" | "imag" => Inferred::Single(TypeText::basic("float64")),
            "recover" => Inferred::Single(TypeText::basic("any")),
            _ => return Ok(None),
        };

        Ok(Some(result))
    }

    fn infer_unary(&mut self, file: &File, node: Node<'_>) -> Result<Inferred, Error> {
        let operator = node
            .child_by_field_name("operator")
            .map(|n| file.text(n).to_owned())
            .unwrap_or_default();
        let operand = node
            .child_by_field_name("operand")
            .ok_or_else(|| cannot(file, node))?;

        match operator.as_str() {
            "&" => Ok(Inferred::Single(TypeText::pointer(
                self.infer(file, operand)?.into_single()?,
            ))),
            "!" => Ok(Inferred::Single(TypeText::basic("bool"))),
            "-" | "+" | "^" => self.infer(file, operand),
            "*" => {
                let base = self.infer(file, operand)?.into_single()?;
                base.peel_pointer()
                    .map(Inferred::Single)
                    .ok_or_else(|| cannot(file, node))
            }
            "<-" => {
                let base = self.infer(file, operand)?.into_single()?;
                base.peel_chan()
                    .map(Inferred::Single)
                    .ok_or_else(|| cannot(file, node))
            }
            _ => Err(cannot(file, node)),
        }
    }

    fn infer_binary(&mut self, file: &File, node: Node<'_>) -> Result<Inferred, Error> {
        let operator = node
            .child_by_field_name("operator")
            .map(|n| file.text(n).to_owned())
            .unwrap_or_default();
        let left = node
            .child_by_field_name("left")
            .ok_or_else(|| cannot(file, node))?;
        let right = node
            .child_by_field_name("right")
            .ok_or_else(|| cannot(file, node))?;

        match operator.as_str() {
            "==" | "!=" | "<" | "<=" | ">" | ">=" | "&&" | "||" => {
                Ok(Inferred::Single(TypeText::basic("bool")))
            }
            "<<" | ">>" => self.infer(file, left),
            _ => {
                // Untyped literals take the type of the other operand.
                let (first, second) = if is_literal(left.kind()) && !is_literal(right.kind()) {
                    (right, left)
                } else {
                    (left, right)
                };
                self.infer(file, first).or_else(|_| self.infer(file, second))
            }
        }
    }

    fn named_ref(&self, ty: &TypeText) -> Option<PkgRef> {
        ty.refs
            .iter()
            .find(|r| r.range == (0..ty.text.len()))
            .cloned()
    }

    fn field_type(&mut self, named: &PkgRef, field: &str) -> Option<TypeText> {
        if named.import_path == self.scope.import_path {
            let entry = self.scope.types.get(&named.name)?;
            let ty = entry.ty?;
            if ty.kind() != "struct_type" {
                return None;
            }
            let mut fields = HashMap::new();
            harvest_struct_fields(entry.file, ty, &self.scope.import_path, &mut fields);
            return fields.get(field).cloned();
        }

        let api = self.resolver.api(&named.import_path).ok()?;
        api.types.get(&named.name)?.fields.get(field).cloned()
    }

    #[allow(clippy::type_complexity)]
    fn method_results(
        &mut self,
        named: &PkgRef,
        method: &str,
    ) -> Option<Result<Vec<TypeText>, Error>> {
        if named.import_path == self.scope.import_path {
            let entry = self.scope.methods.get(&named.name)?.get(method)?;
            return Some(match entry.result {
                None => Ok(vec![]),
                Some(result) => result_types(entry.file, result, &self.scope.import_path),
            });
        }

        let api = self.resolver.api(&named.import_path).ok()?;
        let sig = api.types.get(&named.name)?.methods.get(method)?;
        Some(Ok(sig.results.clone()))
    }
}

fn results_to_inferred(
    results: Vec<TypeText>,
    file: &File,
    node: Node<'_>,
) -> Result<Inferred, Error> {
    match results.len() {
        0 => Err(cannot(file, node)),
        1 => Ok(Inferred::Single(results.into_iter().next().unwrap())),
        _ => Ok(Inferred::Tuple(results)),
    }
}

fn is_type_node(kind: &str) -> bool {
    matches!(
        kind,
        "slice_type"
            | "array_type"
            | "map_type"
            | "channel_type"
            | "pointer_type"
            | "function_type"
            | "qualified_type"
            | "struct_type"
            | "interface_type"
    )
}

fn is_literal(kind: &str) -> bool {
    matches!(
        kind,
        "int_literal"
            | "float_literal"
            | "imaginary_literal"
            | "rune_literal"
            | "interpreted_string_literal"
            | "raw_string_literal"
    )
}

fn cannot(file: &File, node: Node<'_>) -> Error {
    let text = file.text(node);
    let mut expr = text.chars().take(60).collect::<String>();
    if expr.len() < text.len() {
        expr.push('…');
    }
    Error::CannotInfer { expr }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot determine the type of `{expr}`")]
    CannotInfer { expr: String },
    #[error("`{qualifier}` is not imported in {file}")]
    UnknownQualifier { qualifier: String, file: String },
    #[error("no sources available for package {import_path}: {reason}")]
    Api { import_path: String, reason: String },
    #[error(transparent)]
    Syntax(#[from] crate::syntax::Error),
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::{ApiResolver, Error, FuncSig, PackageApi, Scope, TypeApi, TypeText, Types};
    use crate::syntax::{Decl, File};

    /// Canned stand-ins for `flag` and `strings`
    struct Canned;

    impl ApiResolver for Canned {
        fn api(&mut self, import_path: &str) -> Result<Rc<PackageApi>, Error> {
            let mut api = PackageApi {
                import_path: import_path.to_owned(),
                ..Default::default()
            };

            match import_path {
                "flag" => {
                    api.name = "flag".into();
                    api.funcs.insert(
                        "Bool".into(),
                        FuncSig {
                            results: vec![TypeText::pointer(TypeText::basic("bool"))],
                            value_type: TypeText::basic("func(string, bool, string) *bool"),
                        },
                    );
                    api.types.insert("FlagSet".into(), TypeApi::default());
                }
                "strings" => {
                    api.name = "strings".into();
                    api.types.insert(
                        "Builder".into(),
                        TypeApi {
                            methods: [(
                                "String".to_owned(),
                                FuncSig {
                                    results: vec![TypeText::basic("string")],
                                    value_type: TypeText::basic("func() string"),
                                },
                            )]
                            .into(),
                            fields: Default::default(),
                        },
                    );
                }
                _ => {
                    return Err(Error::Api {
                        import_path: import_path.to_owned(),
                        reason: "not canned".into(),
                    })
                }
            }

            Ok(Rc::new(api))
        }
    }

    const SOURCE: &str = r#"package main

import (
	"flag"
	"strings"
)

type server struct {
	addr string
}

var verbose = flag.Bool("v", false, "verbose")

var banner = "hello"

var count, limit = 1, measure()

var srv = &server{addr: "::1"}

var sb strings.Builder

var rendered = sb.String()

var ports = make(map[string]int)

var callback = measure

func measure() int { return 0 }

func main() {}
"#;

    fn infer_var(name: &str) -> Result<TypeText, Error> {
        let file = File::parse("main.go", SOURCE).unwrap();
        let files = vec![file];
        let scope = Scope::build("example.com/demo", &files).unwrap();
        let mut resolver = Canned;
        let mut types = Types::new(&scope, &mut resolver);

        let file = &files[0];
        for decl in file.decls() {
            if let Decl::Var(decl) = decl {
                for spec in &decl.specs {
                    for (idx, ident) in spec.names.iter().enumerate() {
                        if ident.name == name {
                            return types.infer_spec_name(file, spec, idx);
                        }
                    }
                }
            }
        }

        panic!("var {name} not found");
    }

    #[test]
    fn literal_types() {
        assert_eq!(infer_var("banner").unwrap().text, "string");
        assert_eq!(infer_var("count").unwrap().text, "int");
    }

    #[test]
    fn imported_function_result() {
        let ty = infer_var("verbose").unwrap();
        assert_eq!(ty.text, "*bool");
        assert!(ty.refs.is_empty());
    }

    #[test]
    fn local_function_result() {
        assert_eq!(infer_var("limit").unwrap().text, "int");
    }

    #[test]
    fn composite_literal_pointer() {
        let ty = infer_var("srv").unwrap();
        assert_eq!(ty.text, "*server");
        assert_eq!(ty.refs.len(), 1);
        assert_eq!(ty.refs[0].import_path, "example.com/demo");
        assert_eq!(ty.refs[0].name, "server");
        assert_eq!(&ty.text[ty.refs[0].range.clone()], "server");
    }

    #[test]
    fn method_call_result() {
        assert_eq!(infer_var("rendered").unwrap().text, "string");
    }

    #[test]
    fn make_builtin() {
        assert_eq!(infer_var("ports").unwrap().text, "map[string]int");
    }

    #[test]
    fn function_value() {
        assert_eq!(infer_var("callback").unwrap().text, "func() int");
    }

    #[test]
    fn render_with_substitutes_refs() {
        let ty = infer_var("srv").unwrap();
        let rendered = ty.render_with(&["server".to_owned()]);
        assert_eq!(rendered, "*server");
    }

    #[test]
    fn peeling() {
        let slice = TypeText::basic("[]byte");
        assert_eq!(slice.peel_element().unwrap().text, "byte");

        let map = TypeText::basic("map[string][]int");
        assert_eq!(map.peel_element().unwrap().text, "[]int");

        let array = TypeText::basic("[4]rune");
        assert_eq!(array.array_to_slice().unwrap().text, "[]rune");

        let chan = TypeText::basic("<-chan error");
        assert_eq!(chan.peel_chan().unwrap().text, "error");
    }
}
