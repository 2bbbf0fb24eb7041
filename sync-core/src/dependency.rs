//! Bidirectional entity/dependency bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

/// Tracks which entities are blocked on which dependencies.
///
/// An entity is blocked while at least one dependency is recorded for it.
#[derive(Debug, Clone)]
pub struct DependentObjects<E: Ord + Clone, D: Ord + Clone> {
    dependants: BTreeMap<D, BTreeSet<E>>,
    dependencies: BTreeMap<E, BTreeSet<D>>,
}

impl<E: Ord + Clone, D: Ord + Clone> DependentObjects<E, D> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            dependants: BTreeMap::new(),
            dependencies: BTreeMap::new(),
        }
    }

    /// Record that `dependent` cannot proceed before `dependency` resolves.
    pub fn add(&mut self, dependent: E, dependency: D) {
        self.dependants
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        self.dependencies
            .entry(dependent)
            .or_default()
            .insert(dependency);
    }

    /// Any dependency still blocking `dependent`.
    pub fn any_dependency(&self, dependent: &E) -> Option<&D> {
        self.dependencies.get(dependent)?.iter().next()
    }

    /// Whether `dependent` is blocked.
    pub fn is_blocked(&self, dependent: &E) -> bool {
        self.dependencies.contains_key(dependent)
    }

    /// Entities waiting on `dependency`.
    pub fn dependants(&self, dependency: &D) -> impl Iterator<Item = &E> {
        self.dependants.get(dependency).into_iter().flatten()
    }

    /// Mark `dependency` as resolved.
    ///
    /// Returns the entities that have no remaining dependency.
    pub fn resolve(&mut self, dependency: &D) -> Vec<E> {
        let Some(dependants) = self.dependants.remove(dependency) else {
            return Vec::new();
        };
        let mut unblocked = Vec::new();
        for dependent in dependants {
            if let Some(deps) = self.dependencies.get_mut(&dependent) {
                deps.remove(dependency);
                if deps.is_empty() {
                    self.dependencies.remove(&dependent);
                    unblocked.push(dependent);
                }
            }
        }
        unblocked
    }

    /// Remove every entity waiting on `dependency`, along with all of its
    /// other dependencies.
    pub fn detach(&mut self, dependency: &D) -> Vec<E> {
        let dependants: Vec<E> = self.dependants(dependency).cloned().collect();
        for dependent in &dependants {
            self.remove(dependent);
        }
        dependants
    }

    /// Forget `dependent` entirely.
    pub fn remove(&mut self, dependent: &E) {
        let Some(deps) = self.dependencies.remove(dependent) else {
            return;
        };
        for dependency in deps {
            if let Some(set) = self.dependants.get_mut(&dependency) {
                set.remove(dependent);
                if set.is_empty() {
                    self.dependants.remove(&dependency);
                }
            }
        }
    }

    /// Whether nothing is blocked.
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

impl<E: Ord + Clone, D: Ord + Clone> Default for DependentObjects<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_blocks_entity() {
        let mut objects = DependentObjects::new();
        objects.add("msg-1", "conv-a");
        assert!(objects.is_blocked(&"msg-1"));
        assert_eq!(objects.any_dependency(&"msg-1"), Some(&"conv-a"));
        assert!(!objects.is_blocked(&"msg-2"));
    }

    #[test]
    fn resolve_unblocks_only_fully_resolved_entities() {
        let mut objects = DependentObjects::new();
        objects.add("msg-1", "conv-a");
        objects.add("msg-2", "conv-a");
        objects.add("msg-2", "client-x");

        let unblocked = objects.resolve(&"conv-a");
        assert_eq!(unblocked, vec!["msg-1"]);
        assert!(objects.is_blocked(&"msg-2"));
        assert_eq!(objects.any_dependency(&"msg-2"), Some(&"client-x"));

        assert_eq!(objects.resolve(&"client-x"), vec!["msg-2"]);
        assert!(objects.is_empty());
    }

    #[test]
    fn resolve_unknown_dependency_is_noop() {
        let mut objects: DependentObjects<u32, u32> = DependentObjects::new();
        assert!(objects.resolve(&1).is_empty());
    }

    #[test]
    fn detach_removes_all_dependencies_of_dependants() {
        let mut objects = DependentObjects::new();
        objects.add(1, "conv-a");
        objects.add(1, "conv-b");
        objects.add(2, "conv-b");

        let mut detached = objects.detach(&"conv-a");
        detached.sort();
        assert_eq!(detached, vec![1]);
        assert!(!objects.is_blocked(&1));
        assert_eq!(objects.dependants(&"conv-b").collect::<Vec<_>>(), vec![&2]);
    }

    #[test]
    fn remove_forgets_entity() {
        let mut objects = DependentObjects::new();
        objects.add(1, 10);
        objects.remove(&1);
        assert!(objects.is_empty());
        assert_eq!(objects.dependants(&10).count(), 0);
    }
}
