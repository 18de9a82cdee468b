//! Definition fragments: nested trees of named nodes.
//!
//! Grouping carries no meaning; a node is a variable leaf when it has a
//! `type` or `definition` child, wherever it sits in the tree. Keys are kept
//! in document order and duplicates are preserved long enough to be reported.

use super::types::{VariableEntry, VariableKind};
use crate::error::{ModelError, Result};
use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use std::fmt;
use std::io::Read;

const TYPE_KEY: &str = "type";
const DEFINITION_KEY: &str = "definition";
const UNIT_KEY: &str = "unit";
const DESCRIPTION_KEY: &str = "description";
const REFERENCE_KEY: &str = "reference";
const INIT_KEY: &str = "init";
const OPTIONS_KEY: &str = "options";

#[derive(Debug, Clone, PartialEq)]
pub enum FragmentNode {
    Text(String),
    List(Vec<FragmentNode>),
    Group(Vec<(String, FragmentNode)>),
}

impl FragmentNode {
    fn text(&self) -> Option<&str> {
        match self {
            FragmentNode::Text(s) => Some(s),
            _ => None,
        }
    }

    fn child(&self, key: &str) -> Option<&FragmentNode> {
        match self {
            FragmentNode::Group(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    fn child_text(&self, key: &str) -> Option<String> {
        self.child(key).and_then(|n| n.text()).map(str::to_string)
    }

    fn is_variable(&self) -> bool {
        self.child(TYPE_KEY).and_then(|n| n.text()).is_some()
            || self.child(DEFINITION_KEY).and_then(|n| n.text()).is_some()
    }

    /// Short rendering used in error messages.
    fn summary(&self) -> String {
        match self {
            FragmentNode::Text(s) => s.clone(),
            FragmentNode::List(items) => format!("[{} item(s)]", items.len()),
            FragmentNode::Group(_) => self
                .child_text(DEFINITION_KEY)
                .unwrap_or_else(|| "{...}".to_string()),
        }
    }

    fn from_value(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FragmentNode::Text(String::new()),
            Value::Bool(b) => FragmentNode::Text(bool_text(*b).to_string()),
            Value::Number(n) => FragmentNode::Text(n.to_string()),
            Value::String(s) => FragmentNode::Text(s.clone()),
            Value::Array(items) => FragmentNode::List(items.iter().map(Self::from_value).collect()),
            Value::Object(map) => {
                FragmentNode::Group(map.iter().map(|(k, v)| (k.clone(), Self::from_value(v))).collect())
            }
        }
    }
}

fn bool_text(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

impl<'de> Deserialize<'de> for FragmentNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = FragmentNode;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a fragment node (object, array, string, number or boolean)")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Self::Value, E> {
        Ok(FragmentNode::Text(bool_text(v).to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
        Ok(FragmentNode::Text(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
        Ok(FragmentNode::Text(v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
        Ok(FragmentNode::Text(v.to_string()))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
        Ok(FragmentNode::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Self::Value, E> {
        Ok(FragmentNode::Text(v))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(FragmentNode::Text(String::new()))
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(FragmentNode::Text(String::new()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(FragmentNode::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<String, FragmentNode>()? {
            entries.push((key, value));
        }
        Ok(FragmentNode::Group(entries))
    }
}

/// One definition source: a tree of groups and variable leaves.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    root: FragmentNode,
}

impl Fragment {
    pub fn new(root: FragmentNode) -> Self {
        Self { root }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str::<FragmentNode>(text)
            .map(Self::new)
            .map_err(|e| ModelError::MalformedFragment(e.to_string()))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        serde_json::from_reader::<_, FragmentNode>(reader)
            .map(Self::new)
            .map_err(|e| ModelError::MalformedFragment(e.to_string()))
    }

    /// Converts an already-parsed JSON value. Duplicate keys were collapsed by
    /// the JSON parser and cannot be reported from here.
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self::new(FragmentNode::from_value(value))
    }

    pub fn root(&self) -> &FragmentNode {
        &self.root
    }

    /// Every variable leaf in the tree, in document order.
    pub fn variables(&self) -> Result<IndexMap<String, VariableEntry>> {
        let mut out = IndexMap::new();
        collect_variables("", &self.root, &mut out)?;
        Ok(out)
    }

    /// `init` values of every node carrying one.
    pub fn initial_values(&self) -> Result<IndexMap<String, String>> {
        let mut out: IndexMap<String, String> = IndexMap::new();
        walk("", &self.root, &mut |name, node| {
            let Some(init) = node.child(INIT_KEY) else { return Ok(()) };
            let text = init.summary();
            if let Some(first) = out.get(name) {
                return Err(duplicate(name, first, &text));
            }
            out.insert(name.to_string(), text);
            Ok(())
        })?;
        Ok(out)
    }

    /// Settings from every node named `options` (any letter case).
    pub fn options(&self) -> Result<IndexMap<String, String>> {
        let mut out: IndexMap<String, String> = IndexMap::new();
        walk("", &self.root, &mut |name, node| {
            if !name.eq_ignore_ascii_case(OPTIONS_KEY) {
                return Ok(());
            }
            let FragmentNode::Group(entries) = node else { return Ok(()) };
            for (key, value) in entries {
                let text = value.summary();
                if let Some(first) = out.get(key) {
                    return Err(duplicate(key, first, &text));
                }
                out.insert(key.clone(), text);
            }
            Ok(())
        })?;
        Ok(out)
    }
}

fn duplicate(name: &str, first: &str, second: &str) -> ModelError {
    ModelError::DuplicateDefinition {
        name: name.to_string(),
        first: first.to_string(),
        second: second.to_string(),
    }
}

/// Depth-first visit of every named node. Fails on a key repeated inside one
/// group.
fn walk<F>(name: &str, node: &FragmentNode, visit: &mut F) -> Result<()>
where
    F: FnMut(&str, &FragmentNode) -> Result<()>,
{
    match node {
        FragmentNode::Group(entries) => {
            if !name.is_empty() {
                visit(name, node)?;
            }
            for (i, (key, child)) in entries.iter().enumerate() {
                if let Some((_, earlier)) = entries[..i].iter().find(|(k, _)| k == key) {
                    return Err(duplicate(key, &earlier.summary(), &child.summary()));
                }
                walk(key, child, visit)?;
            }
            Ok(())
        }
        FragmentNode::List(items) => {
            for item in items {
                walk("", item, visit)?;
            }
            Ok(())
        }
        FragmentNode::Text(_) => Ok(()),
    }
}

fn collect_variables(name: &str, node: &FragmentNode, out: &mut IndexMap<String, VariableEntry>) -> Result<()> {
    walk(name, node, &mut |name, node| {
        if !node.is_variable() {
            return Ok(());
        }
        let entry = VariableEntry {
            name: name.to_string(),
            kind: node.child_text(TYPE_KEY).map(|t| t.parse()).transpose()?,
            definition: node.child_text(DEFINITION_KEY),
            unit: node.child_text(UNIT_KEY),
            description: node.child_text(DESCRIPTION_KEY),
            reference: node.child_text(REFERENCE_KEY),
        };
        if let Some(first) = out.get(name) {
            let render = |e: &VariableEntry| e.definition.clone().unwrap_or_else(|| e.name.clone());
            return Err(duplicate(name, &render(first), &render(&entry)));
        }
        out.insert(name.to_string(), entry);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const GREENHOUSE: &str = r#"{
        "Constants": {
            "cap_air": {"type": "const", "definition": "3.8", "unit": "m"},
            "eta": {"type": "const", "definition": "0.5"}
        },
        "States": {
            "t_air": {"type": "state", "definition": "(q_in - q_out) / cap_air", "unit": "C", "init": 20}
        },
        "Aux": {
            "Heat": {
                "q_in": {"type": "aux", "definition": "eta * 100", "description": "heating"},
                "q_out": {"definition": "t_air - t_out", "reference": "Vanthoor 2011"}
            }
        },
        "Options": {"formatting_mode": "numexpr", "expand_functions": true}
    }"#;

    #[test]
    fn test_variables_found_at_any_depth() {
        let fragment = Fragment::from_json_str(GREENHOUSE).unwrap();
        let vars = fragment.variables().unwrap();
        let names: Vec<_> = vars.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["cap_air", "eta", "t_air", "q_in", "q_out"]);

        let q_out = &vars["q_out"];
        assert_eq!(q_out.kind, None);
        assert_eq!(q_out.reference.as_deref(), Some("Vanthoor 2011"));
        assert_eq!(vars["cap_air"].kind, Some(VariableKind::Constant));
        assert_eq!(vars["cap_air"].unit.as_deref(), Some("m"));
    }

    #[test]
    fn test_initial_values_and_options() {
        let fragment = Fragment::from_json_str(GREENHOUSE).unwrap();
        assert_eq!(fragment.initial_values().unwrap()["t_air"], "20");

        let options = fragment.options().unwrap();
        assert_eq!(options["formatting_mode"], "numexpr");
        assert_eq!(options["expand_functions"], "True");
    }

    #[test]
    fn test_initial_value_in_two_groups_is_duplicate() {
        let text = r#"{"A": {"x": {"type": "state", "init": 1}}, "B": {"x": {"init": 2}}}"#;
        let err = Fragment::from_json_str(text).unwrap().initial_values().unwrap_err();
        assert_eq!(
            err,
            ModelError::DuplicateDefinition { name: "x".into(), first: "1".into(), second: "2".into() }
        );
    }

    #[test]
    fn test_same_name_in_two_groups_is_duplicate() {
        let text = r#"{"A": {"c": {"definition": "5"}}, "B": {"c": {"definition": "6"}}}"#;
        let err = Fragment::from_json_str(text).unwrap().variables().unwrap_err();
        assert_eq!(
            err,
            ModelError::DuplicateDefinition { name: "c".into(), first: "5".into(), second: "6".into() }
        );
    }

    #[test]
    fn test_repeated_json_key_is_duplicate() {
        let text = r#"{"c": {"definition": "5"}, "c": {"definition": "6"}}"#;
        let err = Fragment::from_json_str(text).unwrap().variables().unwrap_err();
        assert!(matches!(err, ModelError::DuplicateDefinition { ref name, .. } if name == "c"));
    }

    #[test]
    fn test_duplicate_option_in_one_fragment() {
        let text = r#"{"options": {"t_end": "10"}, "more": {"OPTIONS": {"t_end": "20"}}}"#;
        let err = Fragment::from_json_str(text).unwrap().options().unwrap_err();
        assert!(matches!(err, ModelError::DuplicateDefinition { ref name, .. } if name == "t_end"));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let text = r#"{"x": {"type": "parameter", "definition": "1"}}"#;
        let err = Fragment::from_json_str(text).unwrap().variables().unwrap_err();
        assert!(matches!(err, ModelError::MalformedFragment(_)));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(Fragment::from_json_str("{\"x\": "), Err(ModelError::MalformedFragment(_))));
    }

    #[test]
    fn test_from_value_and_reader_agree() {
        let value: serde_json::Value = serde_json::from_str(GREENHOUSE).unwrap();
        let from_value = Fragment::from_value(&value);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(GREENHOUSE.as_bytes()).unwrap();
        let from_reader = Fragment::from_reader(std::fs::File::open(file.path()).unwrap()).unwrap();

        assert_eq!(from_value.variables().unwrap(), from_reader.variables().unwrap());
    }
}
