use crate::analysis::builtins::{self, BuiltinKind};
use crate::analysis::expr::Expr;
use crate::analysis::format::{Backend, Formatted};
use crate::compute::parser::{self, Ast, BinaryOp, UnaryOp, UNARY_PRECEDENCE};
use crate::error::{ModelError, Result};
use crate::store::inputs::TIME_COLUMN;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Built-ins of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Func1 {
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
    Log,
    Log10,
    Log1p,
    Exp,
    Expm1,
    Sqrt,
    Floor,
    Ceil,
    Radians,
    Arcsin,
    Arccos,
    Arctan,
    Arcsinh,
    Arccosh,
    Arctanh,
    Abs,
    /// Real-valued inputs only, so `conj` and `real` are the identity.
    Identity,
    /// Imaginary part of a real value.
    Zero,
}

impl Func1 {
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Func1::Sin => x.sin(),
            Func1::Cos => x.cos(),
            Func1::Tan => x.tan(),
            Func1::Sinh => x.sinh(),
            Func1::Cosh => x.cosh(),
            Func1::Tanh => x.tanh(),
            Func1::Log => x.ln(),
            Func1::Log10 => x.log10(),
            Func1::Log1p => x.ln_1p(),
            Func1::Exp => x.exp(),
            Func1::Expm1 => x.exp_m1(),
            Func1::Sqrt => x.sqrt(),
            Func1::Floor => x.floor(),
            Func1::Ceil => x.ceil(),
            Func1::Radians => x.to_radians(),
            Func1::Arcsin => x.asin(),
            Func1::Arccos => x.acos(),
            Func1::Arctan => x.atan(),
            Func1::Arcsinh => x.asinh(),
            Func1::Arccosh => x.acosh(),
            Func1::Arctanh => x.atanh(),
            Func1::Abs => x.abs(),
            Func1::Identity => x,
            Func1::Zero => 0.0,
        }
    }
}

/// Built-ins of two arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Func2 {
    Arctan2,
    Mod,
    LogicalAnd,
    LogicalOr,
}

impl Func2 {
    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Func2::Arctan2 => a.atan2(b),
            Func2::Mod => floor_mod(a, b),
            Func2::LogicalAnd => truth(a != 0.0 && b != 0.0),
            Func2::LogicalOr => truth(a != 0.0 || b != 0.0),
        }
    }
}

/// Remainder with the sign of the divisor.
#[inline]
pub fn floor_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

#[inline]
pub fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OpCode {
    Const(f64),
    /// Push `y[j]`.
    State(u32),
    /// Push `a[k]`.
    Aux(u32),
    /// Push `d[m]`; `d[0]` is the time.
    Input(u32),
    /// Push a function parameter.
    Param(u32),
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Unary(Func1),
    Binary(Func2),
    /// `where(cond, a, b)`.
    Select,
    /// Call a compiled user function with `argc` arguments from the stack.
    Call { function: u32, argc: u32 },
}

impl OpCode {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::Const(_) => "Const",
            OpCode::State(_) => "State",
            OpCode::Aux(_) => "Aux",
            OpCode::Input(_) => "Input",
            OpCode::Param(_) => "Param",
            OpCode::Neg => "Neg",
            OpCode::Add => "Add",
            OpCode::Sub => "Subtract",
            OpCode::Mul => "Multiply",
            OpCode::Div => "Divide",
            OpCode::Rem => "Remainder",
            OpCode::Pow => "Power",
            OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge | OpCode::Eq | OpCode::Ne => "Compare",
            OpCode::And | OpCode::Or => "Logical",
            OpCode::Unary(_) => "Unary",
            OpCode::Binary(_) => "Binary",
            OpCode::Select => "Select",
            OpCode::Call { .. } => "Call",
        }
    }

    /// Net change in stack height.
    pub fn stack_effect(&self) -> isize {
        match self {
            OpCode::Const(_) | OpCode::State(_) | OpCode::Aux(_) | OpCode::Input(_) | OpCode::Param(_) => 1,
            OpCode::Neg | OpCode::Unary(_) => 0,
            OpCode::Select => -2,
            OpCode::Call { argc, .. } => 1 - *argc as isize,
            _ => -1,
        }
    }

    fn from_binary(op: BinaryOp) -> Self {
        match op {
            BinaryOp::Or => OpCode::Or,
            BinaryOp::And => OpCode::And,
            BinaryOp::Lt => OpCode::Lt,
            BinaryOp::Le => OpCode::Le,
            BinaryOp::Gt => OpCode::Gt,
            BinaryOp::Ge => OpCode::Ge,
            BinaryOp::Eq => OpCode::Eq,
            BinaryOp::Ne => OpCode::Ne,
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Rem => OpCode::Rem,
            BinaryOp::Pow => OpCode::Pow,
        }
    }
}

/// Slot an instruction writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    Aux(u32),
    Derivative(u32),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Aux(k) => write!(f, "a[{}]", k),
            Target::Derivative(i) => write!(f, "dy[{}]", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub target: Target,
    pub code: Vec<OpCode>,
    /// Right-hand side in slot notation, e.g. `y[0] + d[1]`.
    pub listing: String,
}

/// A user function compiled for runtime calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub name: String,
    pub arity: usize,
    pub code: Vec<OpCode>,
    pub reads_aux: bool,
}

/// Names bound to the three value vectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    /// `y[j]`
    pub states: IndexSet<String>,
    /// `a[k]`, in solving order.
    pub auxiliaries: IndexSet<String>,
    /// `d[1 + m]`, in input table column order.
    pub inputs: IndexSet<String>,
}

impl Layout {
    /// Width of the `d` vector, time included.
    pub fn data_width(&self) -> usize {
        self.inputs.len() + 1
    }

    pub fn target_name(&self, target: Target) -> &str {
        let name = match target {
            Target::Aux(k) => self.auxiliaries.get_index(k as usize),
            Target::Derivative(i) => self.states.get_index(i as usize),
        };
        name.map_or("?", String::as_str)
    }
}

/// The derivative function as a flat instruction list: every auxiliary in
/// solving order, then one derivative per state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    /// Index of the first `dy[i]` instruction.
    pub derivative_start: usize,
    pub routines: Vec<Routine>,
    pub layout: Layout,
    /// Whether any derivative reads `a`, directly or through a routine.
    pub derivative_reads_aux: bool,
}

impl Program {
    pub fn auxiliary_block(&self) -> &[Instruction] {
        &self.instructions[..self.derivative_start]
    }

    pub fn derivative_block(&self) -> &[Instruction] {
        &self.instructions[self.derivative_start..]
    }

    pub fn listing(&self) -> String {
        let mut out = String::new();
        for routine in &self.routines {
            out.push_str(&format!("def {}/{} ({} ops)\n", routine.name, routine.arity, routine.code.len()));
        }
        for ins in &self.instructions {
            out.push_str(&format!("{} = {}\n", ins.target, ins.listing));
        }
        out
    }
}

/// Right-hand side text plus the precedence of its outermost operator.
struct Rendered {
    text: String,
    precedence: u8,
}

const ATOM: u8 = u8::MAX;

impl Rendered {
    fn atom(text: String) -> Self {
        Self { text, precedence: ATOM }
    }

    fn wrapped_below(self, min: u8) -> String {
        if self.precedence < min {
            format!("({})", self.text)
        } else {
            self.text
        }
    }
}

pub struct Compiler<'a> {
    formatted: &'a Formatted,
    layout: Layout,
}

/// Parameters in scope while compiling a routine body.
type Scope<'s> = Option<&'s [String]>;

impl<'a> Compiler<'a> {
    pub fn new(formatted: &'a Formatted, layout: Layout) -> Self {
        Self { formatted, layout }
    }

    /// Compiles routines, then the auxiliary block, then the derivatives.
    pub fn compile(self) -> Result<Program> {
        let mut routines = Vec::with_capacity(self.formatted.functions.len());
        for def in self.formatted.functions.iter() {
            let ast = parser::parse(&def.body)?;
            let mut code = Vec::new();
            self.emit(&ast, &def.body, Some(def.params.as_slice()), &mut code)?;
            routines.push(Routine {
                name: def.name.clone(),
                arity: def.arity(),
                code,
                reads_aux: false,
            });
        }
        propagate_aux_reads(&mut routines);

        let mut instructions = Vec::with_capacity(self.layout.auxiliaries.len() + self.layout.states.len());
        for (k, name) in self.layout.auxiliaries.iter().enumerate() {
            let expr = self.expression(name)?;
            if expr.is_name(name) {
                return Err(ModelError::MissingInput { name: name.clone() });
            }
            instructions.push(self.instruction(Target::Aux(k as u32), expr)?);
        }

        let derivative_start = instructions.len();
        for (i, name) in self.layout.states.iter().enumerate() {
            let expr = self.expression(name)?;
            if expr.is_name(name) {
                return Err(ModelError::malformed(&expr.to_string(), format!("state '{}' has no derivative", name)));
            }
            instructions.push(self.instruction(Target::Derivative(i as u32), expr)?);
        }

        let derivative_reads_aux = instructions[derivative_start..]
            .iter()
            .any(|ins| reads_aux(&ins.code, &routines));

        log::debug!(
            "Compiled {} instruction(s) and {} routine(s); derivative block reads aux: {}",
            instructions.len(),
            routines.len(),
            derivative_reads_aux
        );

        Ok(Program {
            instructions,
            derivative_start,
            routines,
            layout: self.layout,
            derivative_reads_aux,
        })
    }

    fn expression(&self, name: &str) -> Result<&'a Expr> {
        self.formatted.expressions.get(name).ok_or_else(|| ModelError::UnknownVariable {
            name: name.to_string(),
            expression: name.to_string(),
        })
    }

    fn instruction(&self, target: Target, expr: &Expr) -> Result<Instruction> {
        let ast = parser::parse(expr)?;
        let mut code = Vec::new();
        let rendered = self.emit(&ast, expr, None, &mut code)?;
        Ok(Instruction { target, code, listing: rendered.text })
    }

    fn emit(&self, ast: &Ast, source: &Expr, scope: Scope<'_>, code: &mut Vec<OpCode>) -> Result<Rendered> {
        match ast {
            Ast::Number(v) => {
                code.push(OpCode::Const(*v));
                Ok(Rendered::atom(v.to_string()))
            }
            Ast::Name(name) => {
                let (op, text) = self.resolve(name, source, scope)?;
                code.push(op);
                Ok(Rendered::atom(text))
            }
            Ast::Unary(op, operand) => {
                let inner = self.emit(operand, source, scope, code)?.wrapped_below(UNARY_PRECEDENCE);
                let sign = match op {
                    UnaryOp::Neg => {
                        code.push(OpCode::Neg);
                        "-"
                    }
                    UnaryOp::Pos => "+",
                };
                Ok(Rendered { text: format!("{}{}", sign, inner), precedence: UNARY_PRECEDENCE })
            }
            Ast::Binary(op, lhs, rhs) => {
                let p = op.precedence();
                let (left_min, right_min) = if *op == BinaryOp::Pow {
                    (p + 1, UNARY_PRECEDENCE)
                } else {
                    (p, p + 1)
                };
                let left = self.emit(lhs, source, scope, code)?.wrapped_below(left_min);
                let right = self.emit(rhs, source, scope, code)?.wrapped_below(right_min);
                code.push(OpCode::from_binary(*op));
                let text = if *op == BinaryOp::Pow {
                    format!("{}**{}", left, right)
                } else {
                    format!("{} {} {}", left, op.symbol(), right)
                };
                Ok(Rendered { text, precedence: p })
            }
            Ast::Call(name, args) => self.emit_call(name, args, source, scope, code),
        }
    }

    fn emit_call(
        &self,
        name: &str,
        args: &[Ast],
        source: &Expr,
        scope: Scope<'_>,
        code: &mut Vec<OpCode>,
    ) -> Result<Rendered> {
        let bare = Backend::strip_qualifier(name);
        let mismatch = |expected: usize| ModelError::ArgumentCountMismatch {
            name: bare.to_string(),
            expected,
            actual: args.len(),
            expression: source.to_string(),
        };

        let builtin = builtins::lookup(bare).and_then(|b| match b.kind {
            BuiltinKind::Function(arity) => Some(arity),
            BuiltinKind::Constant => None,
        });
        let op = if let Some(arity) = builtin {
            if arity != args.len() {
                return Err(mismatch(arity));
            }
            builtin_op(bare)
        } else if let Some(def) = self.formatted.functions.get(name) {
            if def.arity() != args.len() {
                return Err(mismatch(def.arity()));
            }
            let index = self.formatted.functions.index_of(name).unwrap_or(0);
            Some(OpCode::Call { function: index as u32, argc: args.len() as u32 })
        } else {
            None
        };
        let op = op.ok_or_else(|| ModelError::UnknownFunction {
            name: name.to_string(),
            expression: source.to_string(),
        })?;

        let mut rendered_args = Vec::with_capacity(args.len());
        for arg in args {
            rendered_args.push(self.emit(arg, source, scope, code)?.text);
        }
        code.push(op);
        Ok(Rendered::atom(format!("{}({})", bare, rendered_args.join(", "))))
    }

    /// Resolves an identifier to a load instruction and its slot text.
    fn resolve(&self, name: &str, source: &Expr, scope: Scope<'_>) -> Result<(OpCode, String)> {
        if let Some(i) = scope.and_then(|params| params.iter().position(|p| p == name)) {
            return Ok((OpCode::Param(i as u32), name.to_string()));
        }
        let bare = Backend::strip_qualifier(name);
        if let Some(builtin) = builtins::lookup(bare) {
            if builtin.kind == BuiltinKind::Constant {
                return Ok((OpCode::Const(f64::INFINITY), bare.to_string()));
            }
        }
        if let Some(j) = self.layout.states.get_index_of(name) {
            return Ok((OpCode::State(j as u32), format!("y[{}]", j)));
        }
        if let Some(k) = self.layout.auxiliaries.get_index_of(name) {
            return Ok((OpCode::Aux(k as u32), format!("a[{}]", k)));
        }
        if let Some(m) = self.layout.inputs.get_index_of(name) {
            let slot = m + 1;
            return Ok((OpCode::Input(slot as u32), format!("d[{}]", slot)));
        }
        if name == TIME_COLUMN {
            return Ok((OpCode::Input(0), "d[0]".to_string()));
        }
        Err(ModelError::UnknownVariable {
            name: name.to_string(),
            expression: source.to_string(),
        })
    }
}

fn builtin_op(name: &str) -> Option<OpCode> {
    let unary = |f| Some(OpCode::Unary(f));
    let binary = |f| Some(OpCode::Binary(f));
    match name {
        "sin" => unary(Func1::Sin),
        "cos" => unary(Func1::Cos),
        "tan" => unary(Func1::Tan),
        "sinh" => unary(Func1::Sinh),
        "cosh" => unary(Func1::Cosh),
        "tanh" => unary(Func1::Tanh),
        "log" => unary(Func1::Log),
        "log10" => unary(Func1::Log10),
        "log1p" => unary(Func1::Log1p),
        "exp" => unary(Func1::Exp),
        "expm1" => unary(Func1::Expm1),
        "sqrt" => unary(Func1::Sqrt),
        "floor" => unary(Func1::Floor),
        "ceil" => unary(Func1::Ceil),
        "radians" => unary(Func1::Radians),
        "arcsin" => unary(Func1::Arcsin),
        "arccos" => unary(Func1::Arccos),
        "arctan" => unary(Func1::Arctan),
        "arcsinh" => unary(Func1::Arcsinh),
        "arccosh" => unary(Func1::Arccosh),
        "arctanh" => unary(Func1::Arctanh),
        "abs" => unary(Func1::Abs),
        "conj" | "real" => unary(Func1::Identity),
        "imag" => unary(Func1::Zero),
        "arctan2" => binary(Func2::Arctan2),
        "mod" => binary(Func2::Mod),
        "logical_and" => binary(Func2::LogicalAnd),
        "logical_or" => binary(Func2::LogicalOr),
        "where" => Some(OpCode::Select),
        _ => None,
    }
}

fn reads_aux(code: &[OpCode], routines: &[Routine]) -> bool {
    code.iter().any(|op| match op {
        OpCode::Aux(_) => true,
        OpCode::Call { function, .. } => routines.get(*function as usize).map_or(false, |r| r.reads_aux),
        _ => false,
    })
}

/// Marks routines that read `a`, following calls between routines. The call
/// graph is acyclic, so the loop settles within `routines.len()` passes.
fn propagate_aux_reads(routines: &mut [Routine]) {
    loop {
        let mut changed = false;
        for i in 0..routines.len() {
            if !routines[i].reads_aux && reads_aux(&routines[i].code, routines) {
                routines[i].reads_aux = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::format::format;
    use crate::analysis::inline::FunctionTable;
    use indexmap::IndexMap;
    use std::collections::BTreeSet;

    fn formatted(entries: &[(&str, &str)], basis: &[&str], functions: &FunctionTable, inline: bool) -> Formatted {
        let all: IndexMap<String, Expr> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), Expr::parse(v).unwrap()))
            .collect();
        let basis: BTreeSet<String> = basis.iter().map(|s| s.to_string()).collect();
        format(&all, &basis, functions, Backend::Numpy, inline, false).unwrap()
    }

    fn layout(states: &[&str], auxiliaries: &[&str], inputs: &[&str]) -> Layout {
        let set = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
        Layout {
            states: set(states),
            auxiliaries: set(auxiliaries),
            inputs: set(inputs),
        }
    }

    #[test]
    fn test_listing_uses_slot_notation() {
        let f = formatted(&[("x", "-k*x + t_out"), ("k", "0.5")], &["x", "t_out"], &FunctionTable::new(), true);
        let program = Compiler::new(&f, layout(&["x"], &["k"], &["t_out"])).compile().unwrap();

        assert_eq!(program.derivative_start, 1);
        assert_eq!(program.instructions[0].listing, "0.5");
        assert_eq!(program.instructions[1].listing, "-a[0] * y[0] + d[1]");
        assert!(program.derivative_reads_aux);
        assert_eq!(program.listing(), "a[0] = 0.5\ndy[0] = -a[0] * y[0] + d[1]\n");
    }

    #[test]
    fn test_listing_keeps_required_parentheses() {
        let f = formatted(
            &[("x", "(x - 1)*(2 - x) - (x - (1 - x)) + (-x)**2 + 2**-x")],
            &["x"],
            &FunctionTable::new(),
            true,
        );
        let program = Compiler::new(&f, layout(&["x"], &[], &[])).compile().unwrap();
        assert_eq!(
            program.instructions[0].listing,
            "(y[0] - 1) * (2 - y[0]) - (y[0] - (1 - y[0])) + (-y[0])**2 + 2**-y[0]"
        );
        assert!(!program.derivative_reads_aux);
    }

    #[test]
    fn test_time_and_builtins() {
        let f = formatted(&[("x", "where(Time > 10, np.exp(-x), inf)")], &["x"], &FunctionTable::new(), true);
        let program = Compiler::new(&f, layout(&["x"], &[], &[])).compile().unwrap();
        assert_eq!(program.instructions[0].listing, "where(d[0] > 10, exp(-y[0]), inf)");
        assert_eq!(
            program.instructions[0].code,
            vec![
                OpCode::Input(0),
                OpCode::Const(10.0),
                OpCode::Gt,
                OpCode::State(0),
                OpCode::Neg,
                OpCode::Unary(Func1::Exp),
                OpCode::Const(f64::INFINITY),
                OpCode::Select,
            ]
        );
    }

    #[test]
    fn test_runtime_functions_become_routines() {
        let functions = FunctionTable::from_signatures([("g(u)", "u*k")]).unwrap();
        let f = formatted(&[("x", "g(x)"), ("k", "2")], &["x"], &functions, false);
        let program = Compiler::new(&f, layout(&["x"], &["k"], &[])).compile().unwrap();

        assert_eq!(program.routines.len(), 1);
        assert_eq!(program.routines[0].code, vec![OpCode::Param(0), OpCode::Aux(0), OpCode::Mul]);
        assert!(program.routines[0].reads_aux);
        assert!(program.derivative_reads_aux);
        assert_eq!(program.instructions[1].listing, "g(y[0])");
    }

    #[test]
    fn test_builtin_arity_is_checked() {
        let f = formatted(&[("x", "np.sin(x, 2)")], &["x"], &FunctionTable::new(), true);
        let err = Compiler::new(&f, layout(&["x"], &[], &[])).compile().unwrap_err();
        assert!(matches!(err, ModelError::ArgumentCountMismatch { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn test_unresolved_names() {
        let f = formatted(&[("x", "x + q")], &["x"], &FunctionTable::new(), true);
        let err = Compiler::new(&f, layout(&["x"], &[], &[])).compile().unwrap_err();
        assert_eq!(err, ModelError::UnknownVariable { name: "q".into(), expression: "x + q".into() });

        let f = formatted(&[("x", "-x + rain"), ("rain", "rain")], &["x"], &FunctionTable::new(), true);
        let err = Compiler::new(&f, layout(&["x"], &["rain"], &[])).compile().unwrap_err();
        assert_eq!(err, ModelError::MissingInput { name: "rain".into() });
    }

    #[rstest::rstest]
    #[case(7.0, 3.0, 1.0)]
    #[case(-7.0, 3.0, 2.0)]
    #[case(7.0, -3.0, -2.0)]
    #[case(-6.0, 3.0, 0.0)]
    fn test_floor_mod(#[case] a: f64, #[case] b: f64, #[case] expected: f64) {
        assert_eq!(floor_mod(a, b), expected);
    }
}
