//! Recipe compilation.
//!
//! A [`Converger`] brings a node to the state its recipes describe. The
//! built-in [`RecipeCompiler`] reads recipes from cookbook directories and
//! compiles them into an ordered list of resource declarations:
//!
//! - `attributes/*.rb` lines such as `default["ntp"]["servers"] = ["a"]` set
//!   the node's default and override layers
//! - `definitions/*.rb` are macros expanded at their call site
//! - `resources/*.rb` and `providers/*.rb` declare cookbook resource types,
//!   invoked as `<cookbook>_<name>`
//! - recipes are evaluated one statement at a time: `include_recipe "x::y"`
//!   or `kind "name"` with an optional `do ... end` property block
//!
//! Applying resources to the system is left to whoever consumes the report.

use crate::error::{Error, Result};
use depot::Node;
use manifest::{cookbook_of, recipe_of};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Resource types every recipe may use without declaring them.
pub const BUILTIN_RESOURCES: &[&str] = &[
    "cookbook_file",
    "cron",
    "directory",
    "execute",
    "file",
    "group",
    "link",
    "package",
    "remote_file",
    "script",
    "service",
    "template",
    "user",
];

/// Deepest nesting of recipes and definitions before evaluation gives up.
const MAX_DEPTH: usize = 64;

/// Converges a node against the cookbooks available locally.
pub trait Converger {
    /// Apply `recipes` (already expanded, `cookbook::recipe` form) using the
    /// cookbooks found under `cookbook_roots`.
    fn converge(&mut self, node: &mut Node, recipes: &[String], cookbook_roots: &[PathBuf]) -> Result<ConvergeReport>;
}

/// One resource a recipe declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDecl {
    pub kind: String,
    pub name: String,
    pub properties: BTreeMap<String, String>,
    /// `cookbook::recipe` that declared it
    pub source: String,
}

impl ResourceDecl {
    pub fn id(&self) -> String {
        format!("{}[{}]", self.kind, self.name)
    }
}

/// Result of a convergence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Recipes evaluated, in order, each once
    pub recipes: Vec<String>,
    pub resources: Vec<ResourceDecl>,
}

// ============================================================================
// Evaluation context
// ============================================================================

/// Where evaluation currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalContext {
    pub cookbook: String,
    pub recipe: String,
    /// Definition being expanded, if any
    pub definition: Option<String>,
}

impl EvalContext {
    pub fn recipe(cookbook: &str, recipe: &str) -> Self {
        Self {
            cookbook: cookbook.to_string(),
            recipe: recipe.to_string(),
            definition: None,
        }
    }

    pub fn qualifier(&self) -> String {
        format!("{}::{}", self.cookbook, self.recipe)
    }
}

/// Explicit stack of evaluation contexts.
///
/// Every `push` is paired with a `restore` on the way out, whether the nested
/// evaluation succeeded or not.
#[derive(Debug, Default)]
pub struct ContextStack {
    frames: Vec<EvalContext>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, context: EvalContext) -> Result<()> {
        if self.frames.len() >= MAX_DEPTH {
            return Err(Error::Convergence(format!(
                "recipes nested more than {MAX_DEPTH} deep at {}",
                context.qualifier()
            )));
        }
        self.frames.push(context);
        Ok(())
    }

    /// Return to the context active before the last `push`.
    pub fn restore(&mut self) -> Option<EvalContext> {
        self.frames.pop()
    }

    pub fn current(&self) -> Option<&EvalContext> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

// ============================================================================
// Definition registry
// ============================================================================

/// Actions a provider implements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub actions: Vec<String>,
    pub source: PathBuf,
}

/// Something a cookbook defines for recipes to invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Definition {
    /// Recipe text expanded where it is invoked; `{name}` and `{property}`
    /// placeholders are filled from the call site
    Macro { body: String, source: PathBuf },
    /// Resource type invoked as `<cookbook>_<name>`
    Resource {
        actions: Vec<String>,
        provider: Option<Provider>,
        source: PathBuf,
    },
}

/// Definitions of every loaded cookbook, keyed by `(cookbook, name)`.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    entries: BTreeMap<(String, String), Definition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register everything under a cookbook's `definitions/`, `resources/`
    /// and `providers/` directories.
    pub fn load_cookbook(&mut self, cookbook: &str, dir: &Path) -> Result<()> {
        for (name, path) in rb_files(&dir.join("definitions"))? {
            let body = read(&path)?;
            self.register(cookbook, &name, Definition::Macro { body, source: path })?;
        }

        for (name, path) in rb_files(&dir.join("resources"))? {
            let actions = parse_symbols(&read(&path)?, "actions");
            self.register(
                cookbook,
                &name,
                Definition::Resource {
                    actions,
                    provider: None,
                    source: path,
                },
            )?;
        }

        for (name, path) in rb_files(&dir.join("providers"))? {
            let implemented = parse_symbols(&read(&path)?, "action");
            match self.entries.get_mut(&(cookbook.to_string(), name.clone())) {
                Some(Definition::Resource { provider, .. }) => {
                    *provider = Some(Provider {
                        actions: implemented,
                        source: path,
                    });
                }
                _ => log::debug!(
                    "Ignoring provider {} without a matching resource",
                    path.display()
                ),
            }
        }
        Ok(())
    }

    pub fn register(&mut self, cookbook: &str, name: &str, definition: Definition) -> Result<()> {
        let key = (cookbook.to_string(), name.to_string());
        if self.entries.contains_key(&key) {
            return Err(Error::Convergence(format!(
                "'{name}' is defined twice in cookbook {cookbook}"
            )));
        }
        self.entries.insert(key, definition);
        Ok(())
    }

    pub fn get(&self, cookbook: &str, name: &str) -> Option<&Definition> {
        self.entries.get(&(cookbook.to_string(), name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The definition a recipe reaches by writing `kind`.
    ///
    /// Macros are invoked by their bare name, resources by
    /// `<cookbook>_<name>`. Earlier cookbooks win.
    pub fn resolve(&self, kind: &str) -> Option<(&str, &Definition)> {
        self.entries.iter().find_map(|((cookbook, name), definition)| {
            let matches = match definition {
                Definition::Macro { .. } => name == kind,
                Definition::Resource { .. } => {
                    kind.strip_prefix(cookbook.as_str())
                        .and_then(|rest| rest.strip_prefix('_'))
                        == Some(name.as_str())
                }
            };
            matches.then_some((cookbook.as_str(), definition))
        })
    }
}

// ============================================================================
// Recipe compiler
// ============================================================================

/// The built-in converger.
#[derive(Debug, Default)]
pub struct RecipeCompiler {
    last_report: Option<ConvergeReport>,
}

impl RecipeCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_report(&self) -> Option<&ConvergeReport> {
        self.last_report.as_ref()
    }
}

impl Converger for RecipeCompiler {
    fn converge(&mut self, node: &mut Node, recipes: &[String], cookbook_roots: &[PathBuf]) -> Result<ConvergeReport> {
        let cookbooks = index_cookbooks(cookbook_roots)?;
        log::debug!(
            "Compiling {} recipe(s) against {} cookbook(s)",
            recipes.len(),
            cookbooks.len()
        );

        let mut registry = DefinitionRegistry::new();
        for (name, dir) in &cookbooks {
            registry.load_cookbook(name, dir)?;
            load_attributes(node, dir)?;
        }

        let mut compilation = Compilation {
            cookbooks: &cookbooks,
            registry: &registry,
            stack: ContextStack::new(),
            report: ConvergeReport::default(),
            included: BTreeSet::new(),
        };
        for recipe in recipes {
            compilation.include(recipe)?;
        }

        let report = compilation.report;
        for resource in &report.resources {
            log::info!("Converging {} from {}", resource.id(), resource.source);
        }
        self.last_report = Some(report.clone());
        Ok(report)
    }
}

struct Compilation<'a> {
    cookbooks: &'a BTreeMap<String, PathBuf>,
    registry: &'a DefinitionRegistry,
    stack: ContextStack,
    report: ConvergeReport,
    included: BTreeSet<String>,
}

impl Compilation<'_> {
    fn include(&mut self, qualifier: &str) -> Result<()> {
        let cookbook = cookbook_of(qualifier);
        let recipe = recipe_of(qualifier);
        let full = format!("{cookbook}::{recipe}");
        if !self.included.insert(full.clone()) {
            return Ok(());
        }

        let path = self
            .cookbooks
            .get(cookbook)
            .map(|dir| dir.join("recipes").join(format!("{recipe}.rb")))
            .filter(|path| path.is_file())
            .ok_or_else(|| Error::RecipeNotFound(full.clone()))?;

        log::debug!("Evaluating {full}");
        let statements = parse_statements(&read(&path)?, &full)?;
        self.report.recipes.push(full);

        self.stack.push(EvalContext::recipe(cookbook, recipe))?;
        let result = self.evaluate(statements);
        self.stack.restore();
        result
    }

    fn evaluate(&mut self, statements: Vec<Statement>) -> Result<()> {
        for statement in statements {
            match statement {
                Statement::Include(qualifier) => self.include(&qualifier)?,
                Statement::Resource {
                    kind,
                    name,
                    properties,
                } => self.declare(kind, name, properties)?,
            }
        }
        Ok(())
    }

    fn declare(&mut self, kind: String, name: String, properties: BTreeMap<String, String>) -> Result<()> {
        let context = self
            .stack
            .current()
            .cloned()
            .ok_or_else(|| Error::Convergence(format!("{kind}[{name}] declared outside a recipe")))?;
        let source = context.qualifier();

        if BUILTIN_RESOURCES.contains(&kind.as_str()) {
            self.report.resources.push(ResourceDecl {
                kind,
                name,
                properties,
                source,
            });
            return Ok(());
        }

        let registry = self.registry;
        match registry.resolve(&kind) {
            Some((_, Definition::Macro { body, .. })) => {
                let expanded = substitute(body, &name, &properties);
                let statements = parse_statements(&expanded, &format!("{source} ({kind})"))?;
                self.stack.push(EvalContext {
                    definition: Some(kind),
                    ..context
                })?;
                let result = self.evaluate(statements);
                self.stack.restore();
                result
            }
            Some((_, Definition::Resource { actions, provider, .. })) => {
                let provider = provider.as_ref().ok_or_else(|| {
                    Error::Convergence(format!("{kind}[{name}] in {source}: no provider for {kind}"))
                })?;
                let action = properties
                    .get("action")
                    .cloned()
                    .or_else(|| actions.first().cloned());
                if let Some(action) = action {
                    if !actions.contains(&action) {
                        return Err(Error::Convergence(format!(
                            "{kind}[{name}] in {source}: {kind} has no action '{action}'"
                        )));
                    }
                    if !provider.actions.contains(&action) {
                        return Err(Error::Convergence(format!(
                            "{kind}[{name}] in {source}: provider does not implement '{action}'"
                        )));
                    }
                }
                self.report.resources.push(ResourceDecl {
                    kind,
                    name,
                    properties,
                    source,
                });
                Ok(())
            }
            None => Err(Error::Convergence(format!(
                "{source}: unknown resource type '{kind}'"
            ))),
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Statement {
    Include(String),
    Resource {
        kind: String,
        name: String,
        properties: BTreeMap<String, String>,
    },
}

fn parse_statements(text: &str, source: &str) -> Result<Vec<Statement>> {
    let syntax = |line: usize, message: &str| Error::Convergence(format!("{source}:{line}: {message}"));

    let mut statements = Vec::new();
    let mut open: Option<(usize, String, String, BTreeMap<String, String>)> = None;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((_, kind, name, mut properties)) = open.take() {
            if line == "end" {
                statements.push(Statement::Resource {
                    kind,
                    name,
                    properties,
                });
                continue;
            }
            let (key, value) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| syntax(line_no, "expected 'property value'"))?;
            if value.trim_end().ends_with(" do") {
                return Err(syntax(line_no, "nested blocks are not supported"));
            }
            properties.insert(key.to_string(), unquote(value.trim()).to_string());
            open = Some((line_no, kind, name, properties));
            continue;
        }

        let (head, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| syntax(line_no, &format!("'{line}' needs a name")))?;
        let rest = rest.trim();
        let (rest, block) = match rest.strip_suffix(" do") {
            Some(before) => (before.trim(), true),
            None => (rest, false),
        };
        let name = unquote(rest).to_string();

        if head == "include_recipe" {
            if block {
                return Err(syntax(line_no, "include_recipe takes no block"));
            }
            statements.push(Statement::Include(name));
        } else if block {
            open = Some((line_no, head.to_string(), name, BTreeMap::new()));
        } else {
            statements.push(Statement::Resource {
                kind: head.to_string(),
                name,
                properties: BTreeMap::new(),
            });
        }
    }

    if let Some((line_no, kind, name, _)) = open {
        return Err(syntax(line_no, &format!("{kind}[{name}] block is never closed")));
    }
    Ok(statements)
}

fn unquote(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Symbols following `keyword` on its lines: `actions :a, :b` → `[a, b]`.
fn parse_symbols(text: &str, keyword: &str) -> Vec<String> {
    let mut symbols = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix(keyword) else {
            continue;
        };
        if !rest.starts_with(char::is_whitespace) {
            continue;
        }
        for token in rest.split(|c: char| c == ',' || c.is_whitespace()) {
            if let Some(symbol) = token.strip_prefix(':')
                && !symbol.is_empty()
                && !symbols.iter().any(|s| s == symbol)
            {
                symbols.push(symbol.to_string());
            }
        }
    }
    symbols
}

fn substitute(body: &str, name: &str, properties: &BTreeMap<String, String>) -> String {
    let mut text = body.replace("{name}", name);
    for (key, value) in properties {
        text = text.replace(&format!("{{{key}}}"), value);
    }
    text
}

/// Which attribute layer an attributes file line writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precedence {
    Default,
    Override,
}

fn parse_attribute(line: &str) -> Option<(Precedence, Vec<String>, Value)> {
    let (precedence, mut rest) = if let Some(rest) = line.strip_prefix("default") {
        (Precedence::Default, rest)
    } else {
        (Precedence::Override, line.strip_prefix("override")?)
    };

    let mut keys = Vec::new();
    while let Some(after) = rest.trim_start().strip_prefix('[') {
        let (inner, tail) = after.split_once(']')?;
        keys.push(unquote(inner.trim()).to_string());
        rest = tail;
    }
    if keys.is_empty() {
        return None;
    }

    let raw = rest.trim_start().strip_prefix('=')?.trim();
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(unquote(raw).to_string()));
    Some((precedence, keys, value))
}

fn set_path(map: &mut Map<String, Value>, keys: &[String], value: Value) {
    let Some((last, parents)) = keys.split_last() else {
        return;
    };
    let mut current = map;
    for key in parents {
        let entry = current
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Some(next) = entry.as_object_mut() else {
            return;
        };
        current = next;
    }
    current.insert(last.clone(), value);
}

fn load_attributes(node: &mut Node, dir: &Path) -> Result<()> {
    for (_, path) in rb_files(&dir.join("attributes"))? {
        for (index, raw) in read(&path)?.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (precedence, keys, value) = parse_attribute(line).ok_or_else(|| {
                Error::Convergence(format!(
                    "{}:{}: expected default[...] or override[...] assignment",
                    path.display(),
                    index + 1
                ))
            })?;
            let layer = match precedence {
                Precedence::Default => &mut node.default,
                Precedence::Override => &mut node.override_,
            };
            set_path(layer, &keys, value);
        }
    }
    Ok(())
}

// ============================================================================
// Filesystem
// ============================================================================

/// Cookbook directories by name; a cookbook in an earlier root shadows later
/// ones.
fn index_cookbooks(roots: &[PathBuf]) -> Result<BTreeMap<String, PathBuf>> {
    let mut cookbooks = BTreeMap::new();
    for root in roots {
        if !root.is_dir() {
            log::debug!("Skipping missing cookbook root {}", root.display());
            continue;
        }
        let entries = fs::read_dir(root).map_err(|e| Error::io(root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(root, e))?;
            let path = entry.path();
            if path.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                cookbooks.entry(name).or_insert(path);
            }
        }
    }
    Ok(cookbooks)
}

/// `(stem, path)` of every `.rb` file directly in `dir`, sorted by name.
fn rb_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "rb")
            && let Some(stem) = path.file_stem()
        {
            files.push((stem.to_string_lossy().to_string(), path));
        }
    }
    files.sort();
    Ok(files)
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io(path, e))
}
