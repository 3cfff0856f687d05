//! Two-pass assembler (spec.md §4.2). Pass 1 walks the stub stream once to
//! assign a PC to every instruction and record each label's PC; pass 2
//! re-walks it to encode each instruction into a 64-bit word, resolving
//! label operands to PCs and literal operands to deduplicated indices into
//! the data segment. Grounded on `VM_Store`/`VM_Indirect`/`VM_Direct` in
//! `roman2.c` and on the teacher's own `Program { code, data }` split.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{AssembleError, AssembleResult};
use crate::opcode::{Opcode, OperandKind};
use crate::stub::{Literal, Operand, Stub};
use crate::value::Value;

/// A module/line pair attached to every assembled instruction, so a
/// runtime fault can report where in source it originated.
#[derive(Clone, Debug, PartialEq)]
pub struct DebugRecord {
    pub module: String,
    pub line: i64,
}

/// The fully assembled program: a flat instruction stream, a deduplicated
/// constant pool, and a debug record per instruction (same length and
/// order as `code`).
#[derive(Debug)]
pub struct Program {
    pub code: Vec<u64>,
    pub data: Vec<Value>,
    pub debug: Vec<DebugRecord>,
}

impl Program {
    pub fn fetch(&self, pc: usize) -> AssembleResult<u64> {
        self.code
            .get(pc)
            .copied()
            .ok_or(AssembleError::MalformedOperand(format!("pc {pc} out of range")))
    }
}

pub struct Assembler {
    labels: HashMap<String, i64>,
    data_dedup: HashMap<String, i64>,
    data: Vec<Value>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            labels: HashMap::new(),
            data_dedup: HashMap::new(),
            data: Vec::new(),
        }
    }

    pub fn assemble(mut self, stubs: &[Stub]) -> AssembleResult<Program> {
        self.pass_one(stubs)?;
        let (code, debug) = self.pass_two(stubs)?;
        Ok(Program {
            code,
            data: self.data,
            debug,
        })
    }

    fn pass_one(&mut self, stubs: &[Stub]) -> AssembleResult<()> {
        let mut pc: i64 = 0;
        for stub in stubs {
            match stub {
                Stub::Label(name) => {
                    if self.labels.insert(name.clone(), pc).is_some() {
                        return Err(AssembleError::DuplicateLabel(name.clone()));
                    }
                }
                Stub::Instruction { .. } => pc += 1,
            }
        }
        debug!(labels = self.labels.len(), instructions = pc, "assembler pass 1 complete");
        Ok(())
    }

    fn pass_two(&mut self, stubs: &[Stub]) -> AssembleResult<(Vec<u64>, Vec<DebugRecord>)> {
        let mut code = Vec::new();
        let mut debug_records = Vec::new();
        for stub in stubs {
            if let Stub::Instruction {
                opcode,
                operand,
                module,
                line,
            } = stub
            {
                let word = self.encode(*opcode, operand)?;
                code.push(word);
                debug_records.push(DebugRecord {
                    module: module.clone(),
                    line: *line,
                });
            }
        }
        debug!(
            data_segment = self.data.len(),
            code_words = code.len(),
            "assembler pass 2 complete"
        );
        Ok((code, debug_records))
    }

    fn encode(&mut self, opcode: Opcode, operand: &Operand) -> AssembleResult<u64> {
        match (opcode.operand_kind(), operand) {
            (OperandKind::Literal, Operand::Literal(lit)) => {
                let index = self.store(lit)?;
                Ok(opcode.encode(index))
            }
            (OperandKind::Label, Operand::Label(name)) => {
                let pc = self.resolve_label(name)?;
                Ok(opcode.encode(pc))
            }
            (OperandKind::Direct, Operand::Number(n)) => Ok(opcode.encode(*n)),
            (OperandKind::None, Operand::None) => Ok(opcode.encode(0)),
            _ => Err(AssembleError::MalformedOperand(format!(
                "{:?} does not accept operand {:?}",
                opcode, operand
            ))),
        }
    }

    fn resolve_label(&self, name: &str) -> AssembleResult<i64> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| AssembleError::UndefinedLabel(name.to_string()))
    }

    /// Deduplicated constant-pool insertion, mirroring `VM_Store`'s
    /// `data_dups` map in `roman2.c`: the same literal text reuses the same
    /// data-segment slot.
    fn store(&mut self, lit: &Literal) -> AssembleResult<i64> {
        let key = format!("{:?}", lit);
        if let Some(index) = self.data_dedup.get(&key) {
            return Ok(*index);
        }
        let value = match lit {
            Literal::Number(text) => Value::number(
                text.parse()
                    .map_err(|_| AssembleError::MalformedOperand(text.clone()))?,
            ),
            Literal::Bool(b) => Value::boolean(*b),
            Literal::Null => Value::null(),
            Literal::Str(s) => Value::string(s.clone()),
            Literal::EmptyQueue => Value::empty_queue(),
            Literal::EmptyMap => Value::empty_map(),
            Literal::FunctionRef { name, arity, label } => {
                let address = self.resolve_label(label)?;
                Value::function(name.clone(), *arity, address)
            }
        };
        value.mark_constant();
        let index = self.data.len() as i64;
        self.data.push(value);
        self.data_dedup.insert(key, index);
        Ok(index)
    }
}

impl Default for Assembler {
    fn default() -> Assembler {
        Assembler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn duplicate_labels_are_fatal() {
        let stubs = vec![Stub::Label("top".into()), Stub::Label("top".into())];
        let err = Assembler::new().assemble(&stubs).unwrap_err();
        assert_eq!(err, AssembleError::DuplicateLabel("top".into()));
    }

    #[test]
    fn undefined_label_is_fatal() {
        let stubs = vec![Stub::op_label("m", 1, Opcode::Jmp, "nowhere")];
        let err = Assembler::new().assemble(&stubs).unwrap_err();
        assert_eq!(err, AssembleError::UndefinedLabel("nowhere".into()));
    }

    #[test]
    fn identical_literals_share_a_data_slot() {
        let stubs = vec![
            Stub::op_literal("m", 1, Opcode::Psh, Literal::Number("1".into())),
            Stub::op_literal("m", 2, Opcode::Psh, Literal::Number("1".into())),
            Stub::op("m", 3, Opcode::End),
        ];
        let program = Assembler::new().assemble(&stubs).unwrap();
        assert_eq!(program.data.len(), 1);
        let (_, a) = crate::opcode::decode(program.code[0]);
        let (_, b) = crate::opcode::decode(program.code[1]);
        assert_eq!(a, b);
    }

    #[test]
    fn labels_resolve_to_their_pc() {
        let stubs = vec![
            Stub::op_label("m", 1, Opcode::Jmp, "target"),
            Stub::Label("target".into()),
            Stub::op("m", 2, Opcode::End),
        ];
        let program = Assembler::new().assemble(&stubs).unwrap();
        let (op, operand) = crate::opcode::decode(program.code[0]);
        assert_eq!(op, Opcode::Jmp);
        assert_eq!(operand, 1);
    }
}
