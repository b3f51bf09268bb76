//! Node and role records, and run-list expansion.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Document kind for node records.
pub const NODE_KIND: &str = "node";
/// Document kind for role records.
pub const ROLE_KIND: &str = "role";

/// One run-list entry: `recipe[name]`, `role[name]`, or a bare recipe name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RunListItem {
    Recipe(String),
    Role(String),
}

impl RunListItem {
    pub fn name(&self) -> &str {
        match self {
            Self::Recipe(name) | Self::Role(name) => name,
        }
    }
}

impl fmt::Display for RunListItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recipe(name) => write!(f, "recipe[{name}]"),
            Self::Role(name) => write!(f, "role[{name}]"),
        }
    }
}

impl FromStr for RunListItem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bracketed = |prefix: &str| {
            s.strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(']'))
                .map(str::to_string)
        };

        let item = if let Some(name) = bracketed("recipe[") {
            Self::Recipe(name)
        } else if let Some(name) = bracketed("role[") {
            Self::Role(name)
        } else if s.contains('[') || s.contains(']') {
            return Err(Error::bad_request(format!("malformed run list item '{s}'")));
        } else {
            Self::Recipe(s.to_string())
        };

        if item.name().is_empty() {
            return Err(Error::bad_request(format!("empty run list item '{s}'")));
        }
        Ok(item)
    }
}

impl TryFrom<String> for RunListItem {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<RunListItem> for String {
    fn from(item: RunListItem) -> Self {
        item.to_string()
    }
}

/// A managed machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Gathered facts, replaced on every run
    #[serde(default)]
    pub automatic: Map<String, Value>,
    #[serde(default)]
    pub default: Map<String, Value>,
    /// Attributes that persist across runs
    #[serde(default)]
    pub normal: Map<String, Value>,
    #[serde(default, rename = "override")]
    pub override_: Map<String, Value>,
    #[serde(default)]
    pub run_list: Vec<RunListItem>,
    /// Whether the depot already holds a record for this node
    #[serde(skip)]
    pub exists_remotely: bool,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Apply a JSON attribute document: `run_list` replaces the run list,
    /// everything else is deep-merged into the normal attributes.
    pub fn consume_attributes(&mut self, attrs: &Map<String, Value>) -> Result<()> {
        for (key, value) in attrs {
            if key == "run_list" {
                let items = value
                    .as_array()
                    .ok_or_else(|| Error::bad_request("run_list must be an array"))?;
                self.run_list = items
                    .iter()
                    .map(|item| {
                        item.as_str()
                            .ok_or_else(|| Error::bad_request("run_list items must be strings"))?
                            .parse()
                    })
                    .collect::<Result<_>>()?;
            } else {
                merge_value(self.normal.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        Ok(())
    }

    /// Drop the layers that are rebuilt from scratch on every run.
    pub fn reset_transient_attributes(&mut self) {
        self.default.clear();
        self.override_.clear();
    }

    /// Look up an attribute by precedence: override, normal, default, automatic.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        [&self.override_, &self.normal, &self.default, &self.automatic]
            .into_iter()
            .find_map(|layer| layer.get(key))
    }
}

/// A named run list shared by many nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub run_list: Vec<RunListItem>,
    #[serde(default)]
    pub default_attributes: Map<String, Value>,
    #[serde(default)]
    pub override_attributes: Map<String, Value>,
}

/// Flatten a run list into recipe names, expanding roles recursively.
///
/// Recipes keep their first-seen order and appear once. A role already being
/// expanded is skipped, so role cycles terminate. Lookup errors are passed
/// through unchanged.
pub fn expand_run_list<F, E>(items: &[RunListItem], mut lookup_role: F) -> std::result::Result<Vec<String>, E>
where
    F: FnMut(&str) -> std::result::Result<Role, E>,
{
    let mut recipes = Vec::new();
    let mut seen_recipes = BTreeSet::new();
    let mut seen_roles = BTreeSet::new();
    expand_into(
        items,
        &mut lookup_role,
        &mut recipes,
        &mut seen_recipes,
        &mut seen_roles,
    )?;
    Ok(recipes)
}

fn expand_into<F, E>(
    items: &[RunListItem],
    lookup_role: &mut F,
    recipes: &mut Vec<String>,
    seen_recipes: &mut BTreeSet<String>,
    seen_roles: &mut BTreeSet<String>,
) -> std::result::Result<(), E>
where
    F: FnMut(&str) -> std::result::Result<Role, E>,
{
    for item in items {
        match item {
            RunListItem::Recipe(name) => {
                if seen_recipes.insert(name.clone()) {
                    recipes.push(name.clone());
                }
            }
            RunListItem::Role(name) => {
                if !seen_roles.insert(name.clone()) {
                    continue;
                }
                let role = lookup_role(name)?;
                expand_into(&role.run_list, lookup_role, recipes, seen_recipes, seen_roles)?;
            }
        }
    }
    Ok(())
}

/// Deep-merge `src` into `dst`; objects merge key by key, anything else replaces.
pub fn merge_value(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                merge_value(dst.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}
