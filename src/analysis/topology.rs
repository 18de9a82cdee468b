use super::dependencies::{DependencyMap, NameSet};
use crate::error::{ModelError, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, VecDeque};

/// Orders `names` so that every name appears after all of its dependencies.
///
/// Names in `basis`, and dependencies that are not in `names` at all, are
/// leaves: they are available from the start and impose no constraint.
///
/// Two phases over a `petgraph` graph with edges dependency -> dependent:
/// 1. A three-colour DFS, so that a cycle is reported with its full path.
/// 2. Kahn's queue for the order itself, seeded in input order, which keeps
///    the result deterministic for a fixed input.
pub fn schedule<B>(names: &[String], dependency_map: &DependencyMap, basis: &B) -> Result<Vec<String>>
where
    B: NameSet + ?Sized,
{
    let graph = DependencyGraph::build(names, dependency_map, basis);
    graph.check_acyclic()?;
    graph.kahn_order()
}

struct DependencyGraph<'a> {
    graph: DiGraph<&'a str, ()>,
}

impl<'a> DependencyGraph<'a> {
    fn build<B: NameSet + ?Sized>(names: &'a [String], dependency_map: &'a DependencyMap, basis: &B) -> Self {
        let mut graph = DiGraph::with_capacity(names.len(), names.len() * 2);
        let mut index: HashMap<&str, NodeIndex> = HashMap::with_capacity(names.len());
        for name in names {
            index.entry(name.as_str()).or_insert_with(|| graph.add_node(name.as_str()));
        }

        for name in names {
            if basis.has(name) {
                continue;
            }
            let Some(deps) = dependency_map.get(name) else { continue };
            let target = index[name.as_str()];
            // BTreeSet iteration keeps edge insertion sorted by name.
            for dep in deps {
                if basis.has(dep) {
                    continue;
                }
                if let Some(&source) = index.get(dep.as_str()) {
                    graph.update_edge(source, target, ());
                }
            }
        }
        Self { graph }
    }

    /// Dependencies of `node` in name order.
    fn upstream(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut parents: Vec<NodeIndex> = self.graph.neighbors_directed(node, Direction::Incoming).collect();
        parents.sort_by_key(|&p| self.graph[p]);
        parents
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut state = vec![VisitState::None; self.graph.node_count()];
        let mut path = Vec::new();
        for node in self.graph.node_indices() {
            if state[node.index()] == VisitState::None {
                self.visit(node, &mut state, &mut path)?;
            }
        }
        Ok(())
    }

    fn visit(&self, node: NodeIndex, state: &mut [VisitState], path: &mut Vec<NodeIndex>) -> Result<()> {
        match state[node.index()] {
            VisitState::Visited => return Ok(()),
            VisitState::Visiting => {
                let start = path.iter().position(|&n| n == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|&n| self.graph[n].to_string()).collect();
                cycle.push(self.graph[node].to_string());
                return Err(ModelError::CircularDependency { path: cycle });
            }
            VisitState::None => state[node.index()] = VisitState::Visiting,
        }

        path.push(node);
        for parent in self.upstream(node) {
            self.visit(parent, state, path)?;
        }
        path.pop();

        state[node.index()] = VisitState::Visited;
        Ok(())
    }

    fn kahn_order(&self) -> Result<Vec<String>> {
        let count = self.graph.node_count();
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut queue: VecDeque<NodeIndex> = self.graph.node_indices().filter(|n| in_degree[n.index()] == 0).collect();
        let mut order = Vec::with_capacity(count);

        while let Some(node) = queue.pop_front() {
            order.push(self.graph[node].to_string());

            let mut children: Vec<NodeIndex> = self.graph.neighbors_directed(node, Direction::Outgoing).collect();
            children.sort_by_key(|c| c.index());
            for child in children {
                in_degree[child.index()] -= 1;
                if in_degree[child.index()] == 0 {
                    queue.push_back(child);
                }
            }
        }

        if order.len() != count {
            let stuck = self
                .graph
                .node_indices()
                .filter(|n| in_degree[n.index()] > 0)
                .map(|n| self.graph[n].to_string())
                .collect();
            return Err(ModelError::CircularDependency { path: stuck });
        }
        Ok(order)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    None,
    Visiting,
    Visited,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn deps(entries: &[(&str, &[&str])]) -> (Vec<String>, DependencyMap) {
        let names = entries.iter().map(|(n, _)| n.to_string()).collect();
        let map = entries
            .iter()
            .map(|(n, d)| (n.to_string(), d.iter().map(|s| s.to_string()).collect()))
            .collect();
        (names, map)
    }

    fn no_basis() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn test_schedule_diamond_dependency() {
        // Shape: A -> B, A -> C, B+C -> D
        let (names, map) = deps(&[("D", &["B", "C"]), ("C", &["A"]), ("B", &["A"]), ("A", &[])]);
        let order = schedule(&names, &map, &no_basis()).expect("Schedule failed");

        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("A") < pos("B"));
        assert!(pos("A") < pos("C"));
        assert!(pos("B") < pos("D"));
        assert!(pos("C") < pos("D"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_schedule_is_deterministic() {
        let (names, map) = deps(&[("x", &["k"]), ("y", &["k"]), ("k", &[]), ("z", &[])]);
        let first = schedule(&names, &map, &no_basis()).unwrap();
        let second = schedule(&names, &map, &no_basis()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec!["k", "z", "x", "y"]);
    }

    #[test]
    fn test_two_node_cycle_reports_path() {
        let (names, map) = deps(&[("a", &["b"]), ("b", &["a"])]);
        let err = schedule(&names, &map, &no_basis()).unwrap_err();
        match err {
            ModelError::CircularDependency { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
            }
            other => panic!("Wrong error type: {other:?}"),
        }
    }

    #[test]
    fn test_long_cycle_path_is_complete() {
        let (names, map) = deps(&[("entry", &["a"]), ("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let err = schedule(&names, &map, &no_basis()).unwrap_err();
        assert_eq!(err.to_string(), "Circular dependency detected: a -> b -> c -> a");
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let (names, map) = deps(&[("x", &["x"])]);
        let err = schedule(&names, &map, &no_basis()).unwrap_err();
        assert_eq!(err, ModelError::CircularDependency { path: vec!["x".into(), "x".into()] });
    }

    #[test]
    fn test_basis_edges_do_not_constrain() {
        // y is a state whose derivative reads v; v reads y. Not a cycle.
        let (names, map) = deps(&[("y", &["v"]), ("v", &["y"])]);
        let basis: BTreeSet<String> = ["y".to_string()].into();
        let order = schedule(&names, &map, &basis).unwrap();
        assert_eq!(order, vec!["y", "v"]);
    }

    #[test]
    fn test_unknown_dependencies_are_leaves() {
        let (names, map) = deps(&[("q", &["outside"])]);
        assert_eq!(schedule(&names, &map, &no_basis()).unwrap(), vec!["q"]);
    }
}
