use crate::compute::bytecode::{OpCode, Program, Routine};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotReads {
    pub states: usize,
    pub auxiliaries: usize,
    /// Reads of `d`, time included.
    pub inputs: usize,
    pub params: usize,
    pub constants: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramStats {
    pub total_ops: usize,
    pub op_counts: BTreeMap<String, usize>,
    pub reads: SlotReads,
    /// Deepest VM stack any instruction needs, routine calls included.
    pub max_stack_depth: usize,
    pub routine_calls: usize,
}

impl ProgramStats {
    pub fn analyze(program: &Program) -> Self {
        let mut op_counts = BTreeMap::new();
        let mut reads = SlotReads::default();
        let mut total_ops = 0;
        let mut routine_calls = 0;

        let bodies = program
            .instructions
            .iter()
            .map(|ins| ins.code.as_slice())
            .chain(program.routines.iter().map(|r| r.code.as_slice()));
        for code in bodies {
            total_ops += code.len();
            for op in code {
                *op_counts.entry(op.mnemonic().to_string()).or_insert(0) += 1;
                match op {
                    OpCode::State(_) => reads.states += 1,
                    OpCode::Aux(_) => reads.auxiliaries += 1,
                    OpCode::Input(_) => reads.inputs += 1,
                    OpCode::Param(_) => reads.params += 1,
                    OpCode::Const(_) => reads.constants += 1,
                    OpCode::Call { .. } => routine_calls += 1,
                    _ => {}
                }
            }
        }

        let mut routine_depth = vec![None; program.routines.len()];
        let max_stack_depth = program
            .instructions
            .iter()
            .map(|ins| Self::stack_depth(&ins.code, &program.routines, &mut routine_depth))
            .max()
            .unwrap_or(0);

        Self {
            total_ops,
            op_counts,
            reads,
            max_stack_depth,
            routine_calls,
        }
    }

    /// Peak stack height of `code`. A call pops its arguments before the
    /// routine runs on top of the remaining stack.
    fn stack_depth(code: &[OpCode], routines: &[Routine], memo: &mut Vec<Option<usize>>) -> usize {
        let mut height: isize = 0;
        let mut peak: isize = 0;
        for op in code {
            if let OpCode::Call { function, argc } = op {
                let f = *function as usize;
                let inner = match memo.get(f).copied().flatten() {
                    Some(depth) => depth,
                    None => {
                        let depth = routines.get(f).map_or(0, |r| Self::stack_depth(&r.code, routines, memo));
                        if let Some(slot) = memo.get_mut(f) {
                            *slot = Some(depth);
                        }
                        depth
                    }
                };
                peak = peak.max(height - *argc as isize + inner as isize);
            }
            height += op.stack_effect();
            peak = peak.max(height);
        }
        peak.max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::bytecode::{Instruction, Layout, Target};

    fn instruction(code: Vec<OpCode>) -> Instruction {
        Instruction { target: Target::Derivative(0), code, listing: String::new() }
    }

    #[test]
    fn test_counts_and_depth() {
        // y0 * (y0 + d1)
        let program = Program {
            instructions: vec![instruction(vec![
                OpCode::State(0),
                OpCode::State(0),
                OpCode::Input(1),
                OpCode::Add,
                OpCode::Mul,
            ])],
            derivative_start: 0,
            routines: vec![],
            layout: Layout::default(),
            derivative_reads_aux: false,
        };
        let stats = ProgramStats::analyze(&program);
        assert_eq!(stats.total_ops, 5);
        assert_eq!(stats.max_stack_depth, 3);
        assert_eq!(stats.reads.states, 2);
        assert_eq!(stats.reads.inputs, 1);
        assert_eq!(stats.op_counts["Add"], 1);
    }

    #[test]
    fn test_depth_includes_routine_frames() {
        // g(p) = p * (p + (p - 1))
        let routine = Routine {
            name: "g".into(),
            arity: 1,
            code: vec![
                OpCode::Param(0),
                OpCode::Param(0),
                OpCode::Param(0),
                OpCode::Const(1.0),
                OpCode::Sub,
                OpCode::Add,
                OpCode::Mul,
            ],
            reads_aux: false,
        };
        // 2 + g(y0)
        let program = Program {
            instructions: vec![instruction(vec![
                OpCode::Const(2.0),
                OpCode::State(0),
                OpCode::Call { function: 0, argc: 1 },
                OpCode::Add,
            ])],
            derivative_start: 0,
            routines: vec![routine],
            layout: Layout::default(),
            derivative_reads_aux: false,
        };
        let stats = ProgramStats::analyze(&program);
        assert_eq!(stats.max_stack_depth, 5);
        assert_eq!(stats.routine_calls, 1);
        assert_eq!(stats.reads.params, 3);
    }
}
