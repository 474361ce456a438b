use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, error, info};

use crate::component::{Component, ComponentContext};

/// Problems found in the dependency graph at construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogDefect {
    #[error("component {0} declared more than once")]
    Duplicate(String),
    #[error("component {component} depends on unknown component {dependency}")]
    Dangling { component: String, dependency: String },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Ordered component list plus the dependency graph over it.
///
/// Edges point from a component to its dependencies; a `None` edge is a
/// reference to a name the catalog does not contain.
pub struct Catalog {
    components: Vec<Arc<dyn Component>>,
    index: FxHashMap<String, usize>,
    edges: Vec<SmallVec<[Option<usize>; 4]>>,
    defects: Vec<CatalogDefect>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    OnPath,
    Done,
}

impl Catalog {
    pub fn new(components: Vec<Arc<dyn Component>>) -> Self {
        let mut index = FxHashMap::default();
        let mut defects = Vec::new();
        for (i, c) in components.iter().enumerate() {
            if index.insert(c.name().to_string(), i).is_some() {
                defects.push(CatalogDefect::Duplicate(c.name().to_string()));
            }
        }
        let mut edges = Vec::with_capacity(components.len());
        for c in &components {
            let mut out: SmallVec<[Option<usize>; 4]> = SmallVec::new();
            for dep in c.dependencies() {
                let target = index.get(dep.as_str()).copied();
                if target.is_none() {
                    defects.push(CatalogDefect::Dangling { component: c.name().to_string(), dependency: dep.clone() });
                }
                out.push(target);
            }
            edges.push(out);
        }
        let mut catalog = Self { components, index, edges, defects };
        catalog.defects.extend(catalog.find_cycles());
        for d in &catalog.defects {
            error!(defect = %d, "catalog: invalid component graph");
        }
        info!(components = catalog.components.len(), defects = catalog.defects.len(), "catalog: built");
        catalog
    }

    /// Components in declaration order.
    pub fn components(&self) -> &[Arc<dyn Component>] {
        &self.components
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Component>> {
        self.index.get(name).map(|&i| &self.components[i])
    }

    pub fn defects(&self) -> &[CatalogDefect] {
        &self.defects
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    fn find_cycles(&self) -> Vec<CatalogDefect> {
        let mut marks = vec![Mark::New; self.components.len()];
        let mut path = Vec::new();
        let mut found = Vec::new();
        for start in 0..self.components.len() {
            if marks[start] == Mark::New {
                self.visit(start, &mut marks, &mut path, &mut found);
            }
        }
        found
    }

    fn visit(&self, at: usize, marks: &mut [Mark], path: &mut Vec<usize>, found: &mut Vec<CatalogDefect>) {
        marks[at] = Mark::OnPath;
        path.push(at);
        for next in self.edges[at].iter().flatten().copied() {
            match marks[next] {
                Mark::New => self.visit(next, marks, path, found),
                Mark::OnPath => {
                    let from = path.iter().position(|&i| i == next).unwrap_or(0);
                    let mut names: Vec<String> =
                        path[from..].iter().map(|&i| self.components[i].name().to_string()).collect();
                    names.push(self.components[next].name().to_string());
                    found.push(CatalogDefect::Cycle(names));
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[at] = Mark::Done;
    }

    /// Structural check: every transitive dependency of `name` exists and none
    /// of them leads back onto the current path. Unknown names fail closed.
    pub fn check_dependencies(&self, name: &str) -> bool {
        let Some(&start) = self.index.get(name) else { return false };
        let mut path = FxHashSet::default();
        let mut verified = FxHashSet::default();
        self.walk(start, &mut path, &mut verified)
    }

    fn walk(&self, at: usize, path: &mut FxHashSet<usize>, verified: &mut FxHashSet<usize>) -> bool {
        if verified.contains(&at) {
            return true;
        }
        if !path.insert(at) {
            return false;
        }
        for edge in &self.edges[at] {
            match edge {
                Some(next) if self.walk(*next, path, verified) => {}
                _ => return false,
            }
        }
        path.remove(&at);
        verified.insert(at);
        true
    }

    /// Whether `component` may proceed past its pre-install gate: the graph
    /// below it is sound and every direct dependency reports ready.
    pub async fn dependencies_met(&self, component: &dyn Component, ctx: &ComponentContext<'_>) -> bool {
        if !self.check_dependencies(component.name()) {
            debug!(component = %component.name(), "dependencies: graph check failed");
            return false;
        }
        for dep in component.dependencies() {
            let Some(d) = self.find(dep) else { return false };
            if !d.is_ready(ctx).await {
                debug!(component = %component.name(), dependency = %dep, "dependencies: waiting for dependency");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockComponent;

    fn catalog(specs: &[(&str, Vec<&str>)]) -> Catalog {
        Catalog::new(
            specs
                .iter()
                .map(|(n, deps)| Arc::new(MockComponent::new(n).depends_on(deps)) as Arc<dyn Component>)
                .collect(),
        )
    }

    #[test]
    fn no_dependencies_is_sound() {
        let c = catalog(&[("a", vec![])]);
        assert!(c.check_dependencies("a"));
        assert!(c.defects().is_empty());
    }

    #[test]
    fn direct_and_indirect_cycles_fail() {
        let c = catalog(&[("a", vec!["b"]), ("b", vec!["a"]), ("x", vec!["y"]), ("y", vec!["z"]), ("z", vec!["x"]), ("s", vec!["s"])]);
        for n in ["a", "b", "x", "y", "z", "s"] {
            assert!(!c.check_dependencies(n), "{n}");
        }
        assert_eq!(c.defects().iter().filter(|d| matches!(d, CatalogDefect::Cycle(_))).count(), 3);
    }

    #[test]
    fn dependent_of_a_cycle_fails() {
        let c = catalog(&[("top", vec!["a"]), ("a", vec!["b"]), ("b", vec!["a"])]);
        assert!(!c.check_dependencies("top"));
    }

    #[test]
    fn dangling_reference_fails() {
        let c = catalog(&[("a", vec!["ghost"])]);
        assert!(!c.check_dependencies("a"));
        assert_eq!(
            c.defects(),
            &[CatalogDefect::Dangling { component: "a".into(), dependency: "ghost".into() }]
        );
        assert!(!c.check_dependencies("ghost"));
    }

    #[test]
    fn shared_dependency_is_not_a_cycle() {
        let c = catalog(&[("f1", vec![]), ("f5", vec!["f1"]), ("f6", vec!["f5"]), ("top", vec!["f6", "f5", "f5"])]);
        assert!(c.check_dependencies("top"));
        assert!(c.defects().is_empty());
    }

    #[test]
    fn duplicates_are_reported() {
        let c = catalog(&[("a", vec![]), ("a", vec![])]);
        assert_eq!(c.defects(), &[CatalogDefect::Duplicate("a".into())]);
    }

    #[test]
    fn walk_terminates_on_dense_graphs() {
        let names: Vec<String> = (0..40).map(|i| format!("c{i}")).collect();
        let comps: Vec<Arc<dyn Component>> = (0..40)
            .map(|i| {
                let deps: Vec<&str> = names[..i].iter().map(String::as_str).collect();
                Arc::new(MockComponent::new(&names[i]).depends_on(&deps)) as Arc<dyn Component>
            })
            .collect();
        let c = Catalog::new(comps);
        assert!(c.check_dependencies("c39"));
    }

    #[test]
    fn declaration_order_is_kept() {
        let c = catalog(&[("z", vec![]), ("a", vec![]), ("m", vec![])]);
        let names: Vec<&str> = c.components().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["z", "a", "m"]);
        assert!(c.find("m").is_some());
        assert!(c.find("q").is_none());
    }
}
