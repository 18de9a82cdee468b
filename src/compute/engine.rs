use crate::analysis::telemetry::ProgramStats;
use crate::compute::bytecode::{floor_mod, truth, Instruction, OpCode, Program, Routine, Target};
use crate::compute::ledger::Trajectory;
use crate::compute::safety::NumericPolicy;
use crate::display::audit::{AuditLog, LogCategory};
use crate::error::{ModelError, Result};
use crate::store::inputs::{InputTable, TIME_COLUMN};
use crate::store::options::Interpolation;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cell::{Ref, RefCell};
use std::sync::Arc;

pub type Stack = SmallVec<[f64; 32]>;

/// Read-only value vectors for one evaluation.
pub struct Frame<'a> {
    pub y: &'a [f64],
    pub a: &'a [f64],
    pub d: &'a [f64],
}

pub struct Vm;

impl Vm {
    /// Runs `code` and returns the value left on top of the stack.
    ///
    /// Slot indices come from the compiler and are checked against the frame
    /// sizes when the evaluator is built.
    pub fn execute(code: &[OpCode], frame: &Frame<'_>, params: &[f64], routines: &[Routine], stack: &mut Stack) -> f64 {
        let base = stack.len();
        for op in code {
            match *op {
                OpCode::Const(v) => stack.push(v),
                OpCode::State(j) => stack.push(frame.y[j as usize]),
                OpCode::Aux(k) => stack.push(frame.a[k as usize]),
                OpCode::Input(m) => stack.push(frame.d[m as usize]),
                OpCode::Param(p) => stack.push(params[p as usize]),
                OpCode::Neg => {
                    let v = pop(stack);
                    stack.push(-v);
                }
                OpCode::Unary(f) => {
                    let v = pop(stack);
                    stack.push(f.apply(v));
                }
                OpCode::Binary(f) => {
                    let (a, b) = pop2(stack);
                    stack.push(f.apply(a, b));
                }
                OpCode::Select => {
                    let otherwise = pop(stack);
                    let then = pop(stack);
                    let cond = pop(stack);
                    stack.push(if cond != 0.0 { then } else { otherwise });
                }
                OpCode::Call { function, argc } => {
                    let split = stack.len().saturating_sub(argc as usize);
                    let args: SmallVec<[f64; 8]> = stack.drain(split..).collect();
                    let value = match routines.get(function as usize) {
                        Some(routine) => Self::execute(&routine.code, frame, &args, routines, stack),
                        None => f64::NAN,
                    };
                    stack.push(value);
                }
                binary => {
                    let (a, b) = pop2(stack);
                    stack.push(apply_binary(binary, a, b));
                }
            }
        }
        let result = pop(stack);
        stack.truncate(base);
        result
    }
}

#[inline]
fn pop(stack: &mut Stack) -> f64 {
    stack.pop().unwrap_or(f64::NAN)
}

#[inline]
fn pop2(stack: &mut Stack) -> (f64, f64) {
    let b = pop(stack);
    let a = pop(stack);
    (a, b)
}

#[inline]
fn apply_binary(op: OpCode, a: f64, b: f64) -> f64 {
    match op {
        OpCode::Add => a + b,
        OpCode::Sub => a - b,
        OpCode::Mul => a * b,
        OpCode::Div => a / b,
        OpCode::Rem => floor_mod(a, b),
        OpCode::Pow => a.powf(b),
        OpCode::Lt => truth(a < b),
        OpCode::Le => truth(a <= b),
        OpCode::Gt => truth(a > b),
        OpCode::Ge => truth(a >= b),
        OpCode::Eq => truth(a == b),
        OpCode::Ne => truth(a != b),
        OpCode::And => truth(a != 0.0 && b != 0.0),
        OpCode::Or => truth(a != 0.0 || b != 0.0),
        _ => f64::NAN,
    }
}

/// Per-run behaviour taken from the model options.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunSettings {
    pub policy: NumericPolicy,
    pub interpolation: Interpolation,
    /// Mirror numeric corrections as warnings instead of debug records.
    pub warn: bool,
}

/// The seam between a compiled model and an external integrator.
pub trait OdeSystem {
    fn dimension(&self) -> usize;

    /// Writes `dy/dt` at `(t, y)` into `dy`.
    fn apply(&self, t: f64, y: &[f64], dy: &mut [f64]);
}

struct Scratch {
    y: Vec<f64>,
    a: Vec<f64>,
    d: Vec<f64>,
    stack: Stack,
}

/// One run context over a compiled program.
///
/// Scratch buffers live behind `RefCell`, so an evaluator is used from one
/// thread at a time. Parallel runs each build their own.
pub struct Evaluator {
    program: Arc<Program>,
    inputs: Arc<InputTable>,
    settings: RunSettings,
    scratch: RefCell<Scratch>,
    log: RefCell<AuditLog>,
    trajectory: Option<RefCell<Trajectory>>,
}

impl Evaluator {
    pub fn new(program: Arc<Program>, inputs: Arc<InputTable>, settings: RunSettings) -> Result<Self> {
        Self::validate_layout(&program, &inputs)?;
        let stats = ProgramStats::analyze(&program);
        let mut stack = Stack::new();
        stack.reserve(stats.max_stack_depth);
        let scratch = Scratch {
            y: vec![0.0; program.layout.states.len()],
            a: vec![0.0; program.layout.auxiliaries.len()],
            d: vec![0.0; program.layout.data_width()],
            stack,
        };
        Ok(Self {
            program,
            inputs,
            settings,
            scratch: RefCell::new(scratch),
            log: RefCell::new(AuditLog::new()),
            trajectory: None,
        })
    }

    /// Records time, states and auxiliaries on every derivative call.
    pub fn with_trajectory(mut self) -> Self {
        let layout = &self.program.layout;
        let columns = std::iter::once(TIME_COLUMN.to_string())
            .chain(layout.states.iter().cloned())
            .chain(layout.auxiliaries.iter().cloned())
            .collect();
        self.trajectory = Some(RefCell::new(Trajectory::new(columns)));
        self
    }

    /// The `d` vector must line up with the input table's columns.
    fn validate_layout(program: &Program, inputs: &InputTable) -> Result<()> {
        for (m, name) in program.layout.inputs.iter().enumerate() {
            let column = inputs.column_names().nth(m);
            if column != Some(name.as_str()) {
                return Err(ModelError::InvalidInputData(format!(
                    "program expects column '{}' at position {} but the table has {:?}",
                    name, m, column
                )));
            }
        }
        if inputs.width() != program.layout.inputs.len() {
            return Err(ModelError::InvalidInputData(format!(
                "program reads {} input column(s) but the table has {}",
                program.layout.inputs.len(),
                inputs.width()
            )));
        }
        Ok(())
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn log(&self) -> Ref<'_, AuditLog> {
        self.log.borrow()
    }

    pub fn take_log(&self) -> AuditLog {
        self.log.take()
    }

    pub fn trajectory(&self) -> Option<Ref<'_, Trajectory>> {
        self.trajectory.as_ref().map(RefCell::borrow)
    }

    pub fn derivative(&self, t: f64, y: &[f64]) -> Vec<f64> {
        let mut dy = vec![0.0; self.program.layout.states.len()];
        self.derivative_into(t, y, &mut dy);
        dy
    }

    pub fn derivative_into(&self, t: f64, y: &[f64], dy: &mut [f64]) {
        let states = self.program.layout.states.len();
        assert_eq!(y.len(), states, "state vector has {} value(s), model has {} state(s)", y.len(), states);
        assert_eq!(dy.len(), states, "derivative buffer has {} slot(s), model has {} state(s)", dy.len(), states);

        let mut scratch = self.scratch.borrow_mut();
        let scratch = &mut *scratch;
        self.load(t, y, scratch);

        let need_aux = self.program.derivative_reads_aux || self.trajectory.is_some();
        if need_aux {
            self.run_auxiliaries(t, scratch);
        }

        let frame = Frame { y: &scratch.y, a: &scratch.a, d: &scratch.d };
        for (slot, ins) in dy.iter_mut().zip(self.program.derivative_block()) {
            let raw = Vm::execute(&ins.code, &frame, &[], &self.program.routines, &mut scratch.stack);
            *slot = self.correct(raw, ins, t);
        }

        if let Some(trajectory) = &self.trajectory {
            trajectory.borrow_mut().record(t, &scratch.y, &scratch.a);
        }
    }

    /// Auxiliary values at `(t, y)` in solving order.
    pub fn auxiliaries(&self, t: f64, y: &[f64]) -> Vec<f64> {
        let states = self.program.layout.states.len();
        assert_eq!(y.len(), states, "state vector has {} value(s), model has {} state(s)", y.len(), states);

        let mut scratch = self.scratch.borrow_mut();
        let scratch = &mut *scratch;
        self.load(t, y, scratch);
        self.run_auxiliaries(t, scratch);
        scratch.a.clone()
    }

    fn load(&self, t: f64, y: &[f64], scratch: &mut Scratch) {
        scratch.y.copy_from_slice(y);
        let (clipped, zeroed) = self.settings.policy.correct_state(&mut scratch.y);
        if self.settings.policy.log_corrections {
            let mut log = self.log.borrow_mut();
            if clipped > 0 {
                log.record(
                    LogCategory::NumericCorrection,
                    format!("{} state value(s) clipped to 1e38 at time {}", clipped, t),
                    self.settings.warn,
                );
            }
            if zeroed > 0 {
                log.record(
                    LogCategory::NumericCorrection,
                    format!("{} NaN state value(s) replaced with 0 at time {}", zeroed, t),
                    self.settings.warn,
                );
            }
        }
        scratch.d[0] = t;
        self.inputs.sample_into(t, self.settings.interpolation, &mut scratch.d[1..]);
    }

    fn run_auxiliaries(&self, t: f64, scratch: &mut Scratch) {
        for (k, ins) in self.program.auxiliary_block().iter().enumerate() {
            let frame = Frame { y: &scratch.y, a: &scratch.a, d: &scratch.d };
            let raw = Vm::execute(&ins.code, &frame, &[], &self.program.routines, &mut scratch.stack);
            scratch.a[k] = self.correct(raw, ins, t);
        }
    }

    fn correct(&self, raw: f64, ins: &Instruction, t: f64) -> f64 {
        let (value, correction) = self.settings.policy.apply(raw);
        if let Some(correction) = correction {
            if self.settings.policy.log_corrections {
                let name = match ins.target {
                    Target::Aux(_) => self.program.layout.target_name(ins.target).to_string(),
                    Target::Derivative(_) => format!("d{}/dt", self.program.layout.target_name(ins.target)),
                };
                self.log.borrow_mut().record(
                    LogCategory::NumericCorrection,
                    correction.describe(&name, t),
                    self.settings.warn,
                );
            }
        }
        value
    }
}

impl OdeSystem for Evaluator {
    fn dimension(&self) -> usize {
        self.program.layout.states.len()
    }

    fn apply(&self, t: f64, y: &[f64], dy: &mut [f64]) {
        self.derivative_into(t, y, dy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::bytecode::Layout;

    fn set(names: &[&str]) -> indexmap::IndexSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn ins(target: Target, code: Vec<OpCode>) -> Instruction {
        Instruction { target, code, listing: String::new() }
    }

    /// a[0] = d[1] * 2 ; dy[0] = a[0] - y[0] ; dy[1] = 0 / 0
    fn program() -> Program {
        Program {
            instructions: vec![
                ins(Target::Aux(0), vec![OpCode::Input(1), OpCode::Const(2.0), OpCode::Mul]),
                ins(Target::Derivative(0), vec![OpCode::Aux(0), OpCode::State(0), OpCode::Sub]),
                ins(Target::Derivative(1), vec![OpCode::Const(0.0), OpCode::Const(0.0), OpCode::Div]),
            ],
            derivative_start: 1,
            routines: vec![],
            layout: Layout {
                states: set(&["x", "z"]),
                auxiliaries: set(&["twice"]),
                inputs: set(&["t_out"]),
            },
            derivative_reads_aux: true,
        }
    }

    fn inputs() -> Arc<InputTable> {
        let table = InputTable::new(vec![0.0, 10.0]).unwrap().with_column("t_out", vec![0.0, 10.0]).unwrap();
        Arc::new(table)
    }

    fn settings(nans_to_zeros: bool) -> RunSettings {
        RunSettings {
            policy: NumericPolicy { clip_large_nums: true, nans_to_zeros, log_corrections: true },
            ..RunSettings::default()
        }
    }

    #[test]
    fn test_derivative_with_interpolated_input() {
        let ev = Evaluator::new(Arc::new(program()), inputs(), settings(true)).unwrap();
        let dy = ev.derivative(5.0, &[1.0, 0.0]);
        assert_eq!(dy, vec![9.0, 0.0]);
        assert_eq!(ev.auxiliaries(5.0, &[1.0, 0.0]), vec![10.0]);
    }

    #[test]
    fn test_nan_replaced_and_logged() {
        let ev = Evaluator::new(Arc::new(program()), inputs(), settings(true)).unwrap();
        let dy = ev.derivative(1.0, &[0.0, 0.0]);
        assert_eq!(dy[1], 0.0);
        let log = ev.log();
        let entries: Vec<_> = log.of_category(LogCategory::NumericCorrection).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "dz/dt is NaN at time 1; replaced with 0");
    }

    #[test]
    fn test_nan_propagates_when_disabled() {
        let ev = Evaluator::new(Arc::new(program()), inputs(), settings(false)).unwrap();
        let dy = ev.derivative(1.0, &[0.0, 0.0]);
        assert!(dy[1].is_nan());
        assert!(ev.log().is_empty());
    }

    #[test]
    fn test_large_state_is_clipped_before_use() {
        let ev = Evaluator::new(Arc::new(program()), inputs(), settings(true)).unwrap();
        let dy = ev.derivative(0.0, &[5e40, 0.0]);
        assert_eq!(dy[0], -1e38);
        assert!(ev.log().entries()[0].message.contains("clipped"));
    }

    #[test]
    fn test_nan_state_zeroed_before_use() {
        let ev = Evaluator::new(Arc::new(program()), inputs(), settings(true)).unwrap();
        let dy = ev.derivative(5.0, &[f64::NAN, 0.0]);
        assert_eq!(dy[0], 10.0);
        assert!(ev.log().entries()[0].message.contains("NaN state value(s) replaced with 0"));

        let raw = Evaluator::new(Arc::new(program()), inputs(), settings(false)).unwrap();
        assert!(raw.derivative(5.0, &[f64::NAN, 0.0])[0].is_nan());
    }

    #[test]
    fn test_trajectory_records_rows() {
        let ev = Evaluator::new(Arc::new(program()), inputs(), settings(true)).unwrap().with_trajectory();
        let mut dy = [0.0; 2];
        ev.apply(0.0, &[1.0, 0.0], &mut dy);
        ev.apply(10.0, &[2.0, 0.0], &mut dy);
        let tr = ev.trajectory().unwrap();
        assert_eq!(tr.columns(), &["Time", "x", "z", "twice"]);
        assert_eq!(tr.column("twice").unwrap(), vec![0.0, 20.0]);
        assert_eq!(ev.dimension(), 2);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let table = InputTable::new(vec![0.0]).unwrap().with_column("rain", vec![1.0]).unwrap();
        let err = Evaluator::new(Arc::new(program()), Arc::new(table), settings(true)).err();
        assert!(matches!(err, Some(ModelError::InvalidInputData(_))));
    }

    #[test]
    #[should_panic(expected = "state vector has 1 value(s)")]
    fn test_wrong_dimension_panics() {
        let ev = Evaluator::new(Arc::new(program()), inputs(), settings(true)).unwrap();
        ev.derivative(0.0, &[1.0]);
    }

    #[test]
    fn test_vm_routine_call_and_select() {
        // r(p0, p1) = p0 - p1
        let routines = vec![Routine {
            name: "r".into(),
            arity: 2,
            code: vec![OpCode::Param(0), OpCode::Param(1), OpCode::Sub],
            reads_aux: false,
        }];
        let frame = Frame { y: &[4.0], a: &[], d: &[0.0] };
        let mut stack = Stack::new();
        // where(y0 > 3, r(y0, 1), 0)
        let code = [
            OpCode::State(0),
            OpCode::Const(3.0),
            OpCode::Gt,
            OpCode::State(0),
            OpCode::Const(1.0),
            OpCode::Call { function: 0, argc: 2 },
            OpCode::Const(0.0),
            OpCode::Select,
        ];
        assert_eq!(Vm::execute(&code, &frame, &[], &routines, &mut stack), 3.0);
        assert!(stack.is_empty());
    }
}
