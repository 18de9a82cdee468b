//! Built-in names recognised by the expression language.
//!
//! Built-ins are never treated as dependencies or user functions. Each entry
//! records whether the `math` backend can express it; `numpy` and `numexpr`
//! support the full table.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// A named constant (`inf`).
    Constant,
    /// A function of a fixed number of arguments.
    Function(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Builtin {
    pub name: &'static str,
    pub kind: BuiltinKind,
    pub in_math_subset: bool,
}

const fn func(name: &'static str, arity: usize, in_math_subset: bool) -> Builtin {
    Builtin { name, kind: BuiltinKind::Function(arity), in_math_subset }
}

pub const BUILTINS: &[Builtin] = &[
    func("sin", 1, true),
    func("cos", 1, true),
    func("tan", 1, true),
    func("sinh", 1, true),
    func("cosh", 1, true),
    func("tanh", 1, true),
    func("log", 1, true),
    func("log10", 1, true),
    func("log1p", 1, true),
    func("exp", 1, true),
    func("expm1", 1, true),
    func("sqrt", 1, true),
    func("floor", 1, true),
    func("ceil", 1, true),
    Builtin { name: "inf", kind: BuiltinKind::Constant, in_math_subset: true },
    func("radians", 1, true),
    func("where", 3, false),
    func("arcsin", 1, false),
    func("arccos", 1, false),
    func("arctan", 1, false),
    func("arctan2", 2, false),
    func("arcsinh", 1, false),
    func("arccosh", 1, false),
    func("arctanh", 1, false),
    func("conj", 1, false),
    func("real", 1, false),
    func("imag", 1, false),
    func("abs", 1, false),
    func("mod", 2, false),
    func("logical_and", 2, false),
    func("logical_or", 2, false),
];

pub fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

pub fn is_builtin(name: &str) -> bool {
    lookup(name).is_some()
}

/// All built-in names, in table order.
pub fn names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|b| b.name)
}
