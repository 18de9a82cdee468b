//! Expression formatting for a target backend.
//!
//! Runs inlining, dependency analysis and scheduling, then substitutes
//! dependencies (when variables are expanded) and rewrites built-in names to
//! the naming convention of the backend.

use super::builtins::{self, Builtin};
use super::dependencies::{dependency_map, DependencyMap, NameSet};
use super::expr::{is_call_head, parenthesized, Expr, Token, TokenKind};
use super::inline::{inline, FunctionTable};
use super::topology::schedule;
use crate::error::{ModelError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Naming convention for built-in functions in formatted expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Every built-in is qualified as `np.name`.
    #[default]
    Numpy,
    /// Only the math subset is available, qualified as `math.name`.
    Math,
    /// Names stay bare.
    Numexpr,
}

const QUALIFIERS: &[&str] = &["np.", "math."];

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Numpy => "numpy",
            Backend::Math => "math",
            Backend::Numexpr => "numexpr",
        }
    }

    /// Spelling of `builtin` under this backend.
    pub fn qualify(&self, builtin: &Builtin) -> Result<String> {
        match self {
            Backend::Numpy => Ok(format!("np.{}", builtin.name)),
            Backend::Math if builtin.in_math_subset => Ok(format!("math.{}", builtin.name)),
            Backend::Math => Err(ModelError::UnsupportedBackend {
                backend: self.name().to_string(),
                reason: format!("built-in '{}' is not available", builtin.name),
            }),
            Backend::Numexpr => Ok(builtin.name.to_string()),
        }
    }

    /// Removes a backend qualifier (`np.`, `math.`) from a name.
    pub fn strip_qualifier(name: &str) -> &str {
        QUALIFIERS
            .iter()
            .find_map(|q| name.strip_prefix(q))
            .unwrap_or(name)
    }
}

impl FromStr for Backend {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "numpy" => Ok(Backend::Numpy),
            "math" => Ok(Backend::Math),
            "numexpr" => Ok(Backend::Numexpr),
            _ => Err(ModelError::UnsupportedBackend {
                backend: s.to_string(),
                reason: "unknown backend".into(),
            }),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of formatting a full expression set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formatted {
    /// Formatted definition of every non-function variable, basis included.
    pub expressions: IndexMap<String, Expr>,
    /// Direct dependencies, computed before variable substitution.
    pub dependencies: DependencyMap,
    /// Evaluation order with basis names removed.
    pub order: Vec<String>,
    /// Function bodies rewritten for the backend. Empty when calls were inlined.
    pub functions: FunctionTable,
    pub backend: Backend,
}

impl Formatted {
    pub fn text(&self, name: &str) -> Option<String> {
        self.expressions.get(name).map(|e| e.to_string())
    }
}

/// Formats every expression in `all_exprs` for `backend`.
pub fn format<B>(
    all_exprs: &IndexMap<String, Expr>,
    basis: &B,
    functions: &FunctionTable,
    backend: Backend,
    inline_functions: bool,
    inline_variables: bool,
) -> Result<Formatted>
where
    B: NameSet + ?Sized,
{
    let builtin_names: Vec<&str> = builtins::names().collect();

    // 1. Function calls: inline them, or check they can be called at runtime
    let mut working: IndexMap<String, Expr> = IndexMap::with_capacity(all_exprs.len());
    if inline_functions {
        for (name, expr) in all_exprs {
            working.insert(name.clone(), inline(expr, functions, &builtin_names)?);
        }
    } else {
        functions.check_acyclic()?;
        for def in functions.iter() {
            check_calls(&def.body, functions)?;
        }
        for (name, expr) in all_exprs {
            check_calls(expr, functions)?;
            working.insert(name.clone(), expr.clone());
        }
    }

    // 2. Dependencies and order
    let runtime_functions = (!inline_functions).then_some(functions);
    let dependencies = dependency_map(&working, basis, runtime_functions);
    let names: Vec<String> = working.keys().cloned().collect();
    let full_order = schedule(&names, &dependencies, basis)?;
    let order: Vec<String> = full_order.into_iter().filter(|n| !basis.has(n)).collect();

    // 3. Variable substitution. Basis expressions go last since their
    // dependencies are not edges in the schedule.
    if inline_variables {
        let basis_names: Vec<String> = names.iter().filter(|n| basis.has(n)).cloned().collect();
        for name in order.iter().chain(&basis_names) {
            let deps = &dependencies[name.as_str()];
            if deps.is_empty() {
                continue;
            }
            let substituted = substitute(&working[name.as_str()], |ident| {
                deps.contains(ident).then(|| working[ident].tokens().to_vec())
            });
            working.insert(name.clone(), substituted);
        }
    }

    // 4. Backend naming
    let mut expressions = IndexMap::with_capacity(working.len());
    for (name, expr) in working {
        expressions.insert(name, qualify(&expr, backend)?);
    }
    let mut formatted_functions = FunctionTable::new();
    if !inline_functions {
        for def in functions.iter() {
            let mut def = def.clone();
            def.body = qualify(&def.body, backend)?;
            formatted_functions.insert(def);
        }
    }

    Ok(Formatted {
        expressions,
        dependencies,
        order,
        functions: formatted_functions,
        backend,
    })
}

fn check_calls(expr: &Expr, functions: &FunctionTable) -> Result<()> {
    for callee in expr.call_names() {
        let bare = Backend::strip_qualifier(callee);
        if !builtins::is_builtin(bare) && !functions.contains(callee) {
            return Err(ModelError::UnknownFunction {
                name: callee.to_string(),
                expression: expr.to_string(),
            });
        }
    }
    Ok(())
}

/// Replaces value identifiers for which `lookup` returns tokens by those
/// tokens, parenthesized unless atomic.
fn substitute<F>(expr: &Expr, lookup: F) -> Expr
where
    F: Fn(&str) -> Option<Vec<Token>>,
{
    let tokens = expr.tokens();
    let mut out = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        let replacement = (token.kind == TokenKind::Ident && !is_call_head(tokens, i))
            .then(|| lookup(&token.text))
            .flatten();
        match replacement {
            Some(inner) => out.extend(parenthesized(&inner)),
            None => out.push(token.clone()),
        }
    }
    Expr::from_tokens(out)
}

fn qualify(expr: &Expr, backend: Backend) -> Result<Expr> {
    let mut out = Vec::with_capacity(expr.tokens().len());
    for token in expr.tokens() {
        if token.kind == TokenKind::Ident {
            if let Some(builtin) = builtins::lookup(Backend::strip_qualifier(&token.text)) {
                out.push(Token::ident(backend.qualify(builtin)?));
                continue;
            }
        }
        out.push(token.clone());
    }
    Ok(Expr::from_tokens(out))
}
