use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unit recorded for a variable whose fragments never gave one.
pub const UNDEFINED_UNIT: &str = "undefined";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    Constant,
    Input,
    Function,
    Auxiliary,
    State,
}

impl VariableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableKind::Constant => "const",
            VariableKind::Input => "input",
            VariableKind::Function => "function",
            VariableKind::Auxiliary => "aux",
            VariableKind::State => "state",
        }
    }
}

impl FromStr for VariableKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "const" => Ok(VariableKind::Constant),
            "input" => Ok(VariableKind::Input),
            "function" => Ok(VariableKind::Function),
            "aux" => Ok(VariableKind::Auxiliary),
            "state" => Ok(VariableKind::State),
            other => Err(ModelError::MalformedFragment(format!("unknown variable type '{}'", other))),
        }
    }
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    /// Raw expression text. Equal to `name` for an uninterpreted input.
    pub definition: String,
    pub unit: String,
    pub description: String,
    pub reference: String,
    pub kind: VariableKind,
}

impl Variable {
    /// A variable holding only defaults.
    pub fn new(name: impl Into<String>, kind: VariableKind) -> Self {
        let name = name.into();
        Self {
            definition: name.clone(),
            name,
            unit: UNDEFINED_UNIT.to_string(),
            description: String::new(),
            reference: String::new(),
            kind,
        }
    }

    pub fn is_self_defined(&self) -> bool {
        self.definition.trim() == self.name
    }
}

/// One variable leaf as written in a fragment. Absent fields are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableEntry {
    pub name: String,
    pub kind: Option<VariableKind>,
    pub definition: Option<String>,
    pub unit: Option<String>,
    pub description: Option<String>,
    pub reference: Option<String>,
}
