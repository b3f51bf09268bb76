//! Cookbook dependency graph and run-list closure.

use crate::error::{Error, Result};
use crate::types::CookbookMetadata;
use std::collections::{BTreeMap, BTreeSet};

/// Edges from each cookbook to its declared dependencies.
///
/// Built from per-cookbook metadata; nothing guarantees it is acyclic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// cookbook → (dependency → version constraint)
    edges: BTreeMap<String, BTreeMap<String, String>>,
}

impl DependencyGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a set of cookbook metadata records.
    pub fn from_metadata<'a>(metadata: impl IntoIterator<Item = &'a CookbookMetadata>) -> Self {
        let mut graph = Self::new();
        for m in metadata {
            graph.insert(&m.name, m.dependencies.clone());
        }
        graph
    }

    /// Add or replace one cookbook's dependencies.
    pub fn insert(&mut self, cookbook: impl Into<String>, deps: BTreeMap<String, String>) {
        self.edges.insert(cookbook.into(), deps);
    }

    /// Whether metadata for a cookbook is known.
    pub fn contains(&self, cookbook: &str) -> bool {
        self.edges.contains_key(cookbook)
    }

    /// Declared dependencies of a cookbook.
    pub fn dependencies_of(&self, cookbook: &str) -> Result<&BTreeMap<String, String>> {
        self.edges
            .get(cookbook)
            .ok_or_else(|| Error::CookbookNotFound(cookbook.to_string()))
    }

    /// Transitive closure of the cookbooks needed by a set of recipes.
    ///
    /// Each qualifier is `cookbook::recipe` or a bare `cookbook`. Fails if
    /// any cookbook reached has no metadata.
    pub fn expand<I, S>(&self, qualifiers: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut visited = BTreeSet::new();
        for qualifier in qualifiers {
            let cookbook = cookbook_of(qualifier.as_ref());
            if !visited.contains(cookbook) {
                self.visit(cookbook, &mut visited)?;
            }
        }
        Ok(visited)
    }

    fn visit(&self, cookbook: &str, visited: &mut BTreeSet<String>) -> Result<()> {
        log::debug!("Node requires {cookbook}");
        // Marked before recursing so cycles terminate.
        visited.insert(cookbook.to_string());

        for dep in self.dependencies_of(cookbook)?.keys() {
            if !visited.contains(dep) {
                self.visit(dep, visited)?;
            }
        }
        Ok(())
    }
}

/// The cookbook owning a recipe qualifier (`apache2::mod_ssl` → `apache2`).
pub fn cookbook_of(qualifier: &str) -> &str {
    qualifier
        .split_once("::")
        .map_or(qualifier, |(cookbook, _)| cookbook)
}

/// The recipe part of a qualifier; a bare cookbook means `default`.
pub fn recipe_of(qualifier: &str) -> &str {
    qualifier
        .split_once("::")
        .map_or("default", |(_, recipe)| recipe)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `("A", "B C")` declares A depends on B and C.
    fn graph(edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for (cookbook, deps) in edges {
            g.insert(
                *cookbook,
                deps.split_whitespace()
                    .map(|d| (d.to_string(), ">= 0.0.0".to_string()))
                    .collect(),
            );
        }
        g
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diamond_expands_each_once() {
        let g = graph(&[("A", "B C"), ("B", "D"), ("C", "D"), ("D", "")]);
        assert_eq!(g.expand(["A"]).unwrap(), set(&["A", "B", "C", "D"]));
    }

    #[test]
    fn test_cycle_terminates() {
        let g = graph(&[("A", "B"), ("B", "A")]);
        assert_eq!(g.expand(["A"]).unwrap(), set(&["A", "B"]));
    }

    #[test]
    fn test_self_dependency_terminates() {
        let g = graph(&[("A", "A")]);
        assert_eq!(g.expand(["A::default"]).unwrap(), set(&["A"]));
    }

    #[test]
    fn test_qualifiers_map_to_cookbooks() {
        let g = graph(&[("apache2", ""), ("ntp", "")]);
        let result = g.expand(["apache2::mod_ssl", "apache2", "ntp::server"]).unwrap();
        assert_eq!(result, set(&["apache2", "ntp"]));
    }

    #[test]
    fn test_unknown_dependency_is_not_found() {
        let g = graph(&[("A", "missing")]);
        let err = g.expand(["A"]).unwrap_err();
        assert!(matches!(err, Error::CookbookNotFound(ref name) if name == "missing"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_from_metadata() {
        let metadata = [
            CookbookMetadata::bare("rails").depends("ruby", ">= 1.0"),
            CookbookMetadata::bare("ruby"),
        ];
        let g = DependencyGraph::from_metadata(&metadata);
        assert_eq!(g.expand(["rails"]).unwrap(), set(&["rails", "ruby"]));
    }

    #[test]
    fn test_cookbook_and_recipe_of() {
        assert_eq!(cookbook_of("apache2::mod_ssl"), "apache2");
        assert_eq!(cookbook_of("apache2"), "apache2");
        assert_eq!(recipe_of("apache2::mod_ssl"), "mod_ssl");
        assert_eq!(recipe_of("apache2"), "default");
    }
}
