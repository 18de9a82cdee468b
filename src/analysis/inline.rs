//! User function table and call-site inlining.

use super::builtins;
use super::expr::{
    is_call_head, matching_paren, next_significant, parenthesized, split_arguments, trim, Expr, Token, TokenKind,
};
use crate::error::{ModelError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A user function declared as `name(p1, ..., pn)` with a body over its
/// parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
}

impl FunctionDef {
    /// Parses a signature such as `"f(a, b)"` and its body text.
    pub fn parse(signature: &str, body: &str) -> Result<Self> {
        let invalid = || ModelError::InvalidFunctionSignature(signature.to_string());
        let sig = Expr::parse(signature).map_err(|_| invalid())?;
        let tokens: Vec<&Token> = sig.tokens().iter().filter(|t| !t.is_space()).collect();

        let (head, rest) = tokens.split_first().ok_or_else(invalid)?;
        if head.kind != TokenKind::Ident || head.text.contains('.') || builtins::is_builtin(&head.text) {
            return Err(invalid());
        }
        if rest.len() < 2 || rest[0].kind != TokenKind::LParen || rest[rest.len() - 1].kind != TokenKind::RParen {
            return Err(invalid());
        }

        let inner = &rest[1..rest.len() - 1];
        let mut params: Vec<String> = Vec::new();
        for (i, token) in inner.iter().enumerate() {
            let expect_ident = i % 2 == 0;
            match (expect_ident, token.kind) {
                (true, TokenKind::Ident) if !params.contains(&token.text) => params.push(token.text.clone()),
                (false, TokenKind::Comma) if i + 1 < inner.len() => {}
                _ => return Err(invalid()),
            }
        }

        Ok(Self {
            name: head.text.clone(),
            params,
            body: Expr::parse(body)?,
        })
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Function declarations keyed by bare function name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionTable {
    defs: IndexMap<String, FunctionDef>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from `(signature, body)` pairs.
    pub fn from_signatures<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut table = Self::new();
        for (signature, body) in entries {
            table.insert(FunctionDef::parse(signature, body)?);
        }
        Ok(table)
    }

    pub fn insert(&mut self, def: FunctionDef) {
        self.defs.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDef> {
        self.defs.get(name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.defs.get_index_of(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionDef> {
        self.defs.values()
    }

    /// Names a function reads besides its parameters, following nested calls
    /// to other user functions.
    pub fn free_names(&self, name: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut seen = BTreeSet::new();
        self.collect_free_names(name, &mut seen, &mut names);
        names
    }

    fn collect_free_names(&self, name: &str, seen: &mut BTreeSet<String>, names: &mut BTreeSet<String>) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(def) = self.defs.get(name) else { return };
        for ident in def.body.identifiers() {
            if !def.params.iter().any(|p| p == ident) && !builtins::is_builtin(ident) {
                names.insert(ident.to_string());
            }
        }
        for callee in def.body.call_names() {
            self.collect_free_names(callee, seen, names);
        }
    }

    /// Fails when a function calls itself, directly or through others.
    pub fn check_acyclic(&self) -> Result<()> {
        let mut state: HashMap<&str, VisitState> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        for name in self.defs.keys() {
            self.visit(name, &mut state, &mut path)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        state: &mut HashMap<&'a str, VisitState>,
        path: &mut Vec<&'a str>,
    ) -> Result<()> {
        match state.get(name) {
            Some(VisitState::Visited) => return Ok(()),
            Some(VisitState::Visiting) => return Err(cycle_error(path, name)),
            None => {}
        }
        let Some(def) = self.defs.get(name) else { return Ok(()) };
        state.insert(name, VisitState::Visiting);
        path.push(name);
        for callee in def.body.call_names() {
            if let Some((key, _)) = self.defs.get_key_value(callee) {
                self.visit(key.as_str(), state, path)?;
            }
        }
        path.pop();
        state.insert(name, VisitState::Visited);
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

fn cycle_error<S: AsRef<str>>(path: &[S], repeated: &str) -> ModelError {
    let start = path.iter().position(|p| p.as_ref() == repeated).unwrap_or(0);
    let mut cycle: Vec<String> = path[start..].iter().map(|p| p.as_ref().to_string()).collect();
    cycle.push(repeated.to_string());
    ModelError::CircularDependency { path: cycle }
}

/// Replaces every call to a user function in `expr` by the function body,
/// with formal parameters replaced by the (already inlined) actual arguments.
///
/// Arguments are parenthesized unless atomic. An expanded call is wrapped in
/// parentheses unless it spans the whole expression. Calls to names in
/// `builtin_names` are kept and only their arguments are inlined.
pub fn inline(expr: &Expr, functions: &FunctionTable, builtin_names: &[&str]) -> Result<Expr> {
    let source = expr.to_string();
    let inliner = Inliner { functions, builtin_names, source: &source };
    let mut active = Vec::new();
    let tokens = inliner.expand(expr.tokens(), &mut active)?;
    Ok(Expr::from_tokens(tokens))
}

struct Inliner<'a> {
    functions: &'a FunctionTable,
    builtin_names: &'a [&'a str],
    source: &'a str,
}

impl<'a> Inliner<'a> {
    fn is_builtin(&self, name: &str) -> bool {
        // Backend-qualified names (`np.exp`) count as their bare built-in.
        let bare = name.rsplit('.').next().unwrap_or(name);
        self.builtin_names.contains(&name) || self.builtin_names.contains(&bare)
    }

    fn expand(&self, tokens: &[Token], active: &mut Vec<String>) -> Result<Vec<Token>> {
        let first = next_significant(tokens, 0);
        let last = tokens.iter().rposition(|t| !t.is_space());
        let mut out = Vec::with_capacity(tokens.len());
        let mut i = 0;

        while i < tokens.len() {
            if !is_call_head(tokens, i) {
                out.push(tokens[i].clone());
                i += 1;
                continue;
            }
            let name = tokens[i].text.as_str();
            let open = next_significant(tokens, i + 1)
                .ok_or_else(|| ModelError::malformed(self.source, "call without argument list"))?;
            let close = matching_paren(tokens, open)
                .ok_or_else(|| ModelError::malformed(self.source, "unbalanced parentheses"))?;
            let args = split_arguments(&tokens[open + 1..close]);
            if args.iter().any(|a| trim(a).is_empty()) {
                return Err(ModelError::malformed(
                    self.source,
                    format!("empty argument in call to '{}'", name),
                ));
            }

            // 1. Inline inside the arguments first
            let mut expanded_args = Vec::with_capacity(args.len());
            for arg in &args {
                expanded_args.push(self.expand(trim(arg), active)?);
            }

            // 2. Built-ins keep their call, with the spacing as written
            if self.is_builtin(name) {
                out.extend_from_slice(&tokens[i..=open]);
                if args.is_empty() {
                    out.extend_from_slice(&tokens[open + 1..close]);
                }
                for (k, (arg, expanded)) in args.iter().zip(&expanded_args).enumerate() {
                    if k > 0 {
                        out.push(Token::new(TokenKind::Comma, ","));
                    }
                    let lead = arg.iter().take_while(|t| t.is_space()).count();
                    let trail = arg.iter().rev().take_while(|t| t.is_space()).count();
                    out.extend_from_slice(&arg[..lead.min(arg.len())]);
                    out.extend(expanded.iter().cloned());
                    out.extend_from_slice(&arg[arg.len() - trail..]);
                }
                out.push(tokens[close].clone());
                i = close + 1;
                continue;
            }

            // 3. User functions are replaced by their substituted body
            let def = self.functions.get(name).ok_or_else(|| ModelError::UnknownFunction {
                name: name.to_string(),
                expression: self.source.to_string(),
            })?;
            if def.arity() != args.len() {
                return Err(ModelError::ArgumentCountMismatch {
                    name: name.to_string(),
                    expected: def.arity(),
                    actual: args.len(),
                    expression: self.source.to_string(),
                });
            }
            if active.iter().any(|a| a == name) {
                return Err(cycle_error(active, name));
            }

            let substituted = substitute(def.body.tokens(), &def.params, &expanded_args);
            active.push(name.to_string());
            let body = self.expand(&substituted, active)?;
            active.pop();

            if first == Some(i) && last == Some(close) {
                out.extend(trim(&body).iter().cloned());
            } else {
                out.extend(parenthesized(&body));
            }
            i = close + 1;
        }
        Ok(out)
    }
}

fn substitute(body: &[Token], params: &[String], args: &[Vec<Token>]) -> Vec<Token> {
    let mut out = Vec::with_capacity(body.len());
    for (i, token) in body.iter().enumerate() {
        let slot = (token.kind == TokenKind::Ident && !is_call_head(body, i))
            .then(|| params.iter().position(|p| *p == token.text))
            .flatten();
        match slot {
            Some(k) => out.extend(parenthesized(&args[k])),
            None => out.push(token.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, &str)]) -> FunctionTable {
        FunctionTable::from_signatures(entries.iter().copied()).unwrap()
    }

    fn builtin_names() -> Vec<&'static str> {
        builtins::names().collect()
    }

    fn run(text: &str, functions: &FunctionTable) -> Result<String> {
        inline(&Expr::parse(text)?, functions, &builtin_names()).map(|e| e.to_string())
    }

    #[test]
    fn test_inline_substitutes_parenthesized_arguments() {
        let f = table(&[("f(a,b)", "a + b**2")]);
        assert_eq!(run("f(x, y+z)", &f).unwrap(), "x + (y+z)**2");
    }

    #[test]
    fn test_inline_wraps_call_inside_larger_expression() {
        let f = table(&[("f(a,b)", "a + b**2")]);
        assert_eq!(run("2*f(x, y) - 1", &f).unwrap(), "2*(x + y**2) - 1");
    }

    #[test]
    fn test_inline_nested_function_bodies() {
        let f = table(&[("sq(u)", "u*u"), ("norm(a, b)", "sqrt(sq(a) + sq(b))")]);
        assert_eq!(run("norm(x, y - 1)", &f).unwrap(), "sqrt((x*x) + ((y - 1)*(y - 1)))");
    }

    #[test]
    fn test_inline_keeps_builtin_calls_and_inlines_their_arguments() {
        let f = table(&[("half(v)", "v/2")]);
        assert_eq!(run("exp( half(t) ) + half(t)", &f).unwrap(), "exp( t/2 ) + (t/2)");
    }

    #[test]
    fn test_inline_is_idempotent() {
        let f = table(&[("f(a,b)", "a + b**2"), ("g(c)", "f(c, 1) * max_rate")]);
        let once = inline(&Expr::parse("where(g(x) > 0, g(y), exp(-x))").unwrap(), &f, &builtin_names()).unwrap();
        let twice = inline(&once, &f, &builtin_names()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_parameter_names_do_not_match_prefixes() {
        let f = table(&[("f(co2)", "co2 + co2Out")]);
        assert_eq!(run("f(3)", &f).unwrap(), "3 + co2Out");
    }

    #[test]
    fn test_argument_count_mismatch() {
        let f = table(&[("f(a,b)", "a + b")]);
        let err = run("f(x)", &f).unwrap_err();
        assert_eq!(
            err,
            ModelError::ArgumentCountMismatch {
                name: "f".into(),
                expected: 2,
                actual: 1,
                expression: "f(x)".into()
            }
        );
    }

    #[test]
    fn test_unknown_function() {
        let err = run("g(x) + 1", &FunctionTable::new()).unwrap_err();
        assert!(matches!(err, ModelError::UnknownFunction { ref name, .. } if name == "g"));
    }

    #[test]
    fn test_empty_argument_is_malformed() {
        let f = table(&[("f(a,b)", "a + b")]);
        assert!(matches!(run("f(x,)", &f), Err(ModelError::MalformedExpression { .. })));
    }

    #[test]
    fn test_recursive_functions_report_cycle() {
        let f = table(&[("f(a)", "g(a) + 1"), ("g(b)", "f(b)")]);
        let err = run("f(x)", &f).unwrap_err();
        assert_eq!(
            err,
            ModelError::CircularDependency { path: vec!["f".into(), "g".into(), "f".into()] }
        );
        assert!(f.check_acyclic().is_err());
    }

    #[test]
    fn test_nullary_function() {
        let f = table(&[("k()", "0.5")]);
        assert_eq!(run("x*k()", &f).unwrap(), "x*0.5");
    }

    #[test]
    fn test_free_names_follow_nested_calls() {
        let f = table(&[("f(a)", "a*gain + g(a)"), ("g(b)", "b - offset")]);
        let names: Vec<_> = f.free_names("f").into_iter().collect();
        assert_eq!(names, vec!["gain", "offset"]);
    }

    #[rstest::rstest]
    #[case("f")]
    #[case("f(a")]
    #[case("f(a,)")]
    #[case("f(a, a)")]
    #[case("f(1)")]
    #[case("sin(a)")]
    fn test_invalid_signatures(#[case] signature: &str) {
        assert!(matches!(
            FunctionDef::parse(signature, "0"),
            Err(ModelError::InvalidFunctionSignature(_))
        ));
    }
}
