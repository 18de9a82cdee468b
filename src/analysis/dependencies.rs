//! Direct dependency extraction.

use super::expr::Expr;
use super::inline::FunctionTable;
use indexmap::IndexMap;
use std::collections::BTreeSet;

pub type DependencyMap = IndexMap<String, BTreeSet<String>>;

/// Names in `known_names` that `expr` reads as values, minus `ignore_names`.
///
/// Matching is by whole identifier token. Call heads are not dependencies.
pub fn dependencies<K, I>(expr: &Expr, known_names: &K, ignore_names: &I) -> BTreeSet<String>
where
    K: NameSet + ?Sized,
    I: NameSet + ?Sized,
{
    expr.identifiers()
        .filter(|name| known_names.has(name) && !ignore_names.has(name))
        .map(str::to_string)
        .collect()
}

/// Builds the dependency map for every entry of `expressions`.
///
/// A variable whose definition is exactly its own name has no dependencies.
/// When `functions` is given (calls left in place), the free names of every
/// called function body count as dependencies of the caller.
pub fn dependency_map<I>(
    expressions: &IndexMap<String, Expr>,
    ignore_names: &I,
    functions: Option<&FunctionTable>,
) -> DependencyMap
where
    I: NameSet + ?Sized,
{
    let mut map = DependencyMap::with_capacity(expressions.len());
    for (name, expr) in expressions {
        if expr.is_name(name) {
            map.insert(name.clone(), BTreeSet::new());
            continue;
        }
        let mut deps = dependencies(expr, expressions, ignore_names);
        if let Some(table) = functions {
            for callee in expr.call_names() {
                deps.extend(
                    table
                        .free_names(callee)
                        .into_iter()
                        .filter(|n| expressions.contains_key(n.as_str()) && !ignore_names.has(n)),
                );
            }
        }
        map.insert(name.clone(), deps);
    }
    map
}

/// Membership test shared by the name collections used across the pipeline.
pub trait NameSet {
    fn has(&self, name: &str) -> bool;
}

impl NameSet for BTreeSet<String> {
    fn has(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl NameSet for indexmap::IndexSet<String> {
    fn has(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl<V> NameSet for IndexMap<String, V> {
    fn has(&self, name: &str) -> bool {
        self.contains_key(name)
    }
}

impl NameSet for [&str] {
    fn has(&self, name: &str) -> bool {
        self.contains(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exprs(entries: &[(&str, &str)]) -> IndexMap<String, Expr> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Expr::parse(v).unwrap()))
            .collect()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_basis_names_are_ignored() {
        let all = exprs(&[("v1", "v2 + y1"), ("v2", "y2*y3"), ("y1", "v1"), ("y2", "0"), ("y3", "0")]);
        let basis = set(&["y1", "y2", "y3"]);
        let map = dependency_map(&all, &basis, None);
        assert_eq!(map["v1"], set(&["v2"]));
        assert_eq!(map["v2"], set(&[]));
    }

    #[test]
    fn test_self_named_definition_has_no_dependencies() {
        let all = exprs(&[("T_out", "T_out"), ("q", "T_out * 2")]);
        let map = dependency_map(&all, &BTreeSet::<String>::new(), None);
        assert!(map["T_out"].is_empty());
        assert_eq!(map["q"], set(&["T_out"]));
    }

    #[test]
    fn test_prefix_names_do_not_collide() {
        let all = exprs(&[("co2", "co2Out * 0.9"), ("co2Out", "400")]);
        let deps = dependencies(&all["co2"], &all, &BTreeSet::<String>::new());
        assert_eq!(deps, set(&["co2Out"]));
    }

    #[test]
    fn test_builtin_calls_are_not_dependencies() {
        let all = exprs(&[("x", "exp(k) + sin(k)"), ("k", "2")]);
        let deps = dependencies(&all["x"], &all, &["exp", "sin"][..]);
        assert_eq!(deps, set(&["k"]));
    }

    #[test]
    fn test_called_function_free_names_count_when_not_inlined() {
        let functions = FunctionTable::from_signatures([("scale(v)", "v * gain")]).unwrap();
        let all = exprs(&[("out", "scale(x)"), ("x", "3"), ("gain", "0.5")]);
        let map = dependency_map(&all, &BTreeSet::<String>::new(), Some(&functions));
        assert_eq!(map["out"], set(&["gain", "x"]));
    }
}
