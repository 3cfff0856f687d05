//! The bytecode interpreter (spec.md §4.3). A stack machine: an operand
//! stack, a call-frame stack carrying `(return_pc, frame_pointer, arity)`,
//! a growable globals vector, and a single return register that `Sav`
//! writes and `Lod` reads (clearing it on read) — grounded throughout on
//! `VM_Run`'s dispatch loop and the `VM_*` opcode handlers in `roman2.c`.
//! `Ret` and `Fls` both pop a call frame and restore `pc`; `Fls` additionally
//! truncates the stack down to the frame's `fp` first, which is what lets an
//! early `ret` inside a nested block skip that block's own compile-time
//! `Pop` emission and still leave the stack balanced (`VM_Ret`/`VM_Fls`).

use std::time::{SystemTime, UNIX_EPOCH};

use enumflags2::BitFlags;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, trace};

use crate::assembler::Program;
use crate::error::{Fault, RunResult};
use crate::gc::Collector;
use crate::native::NativeBridge;
use crate::opcode::{decode, Opcode};
use crate::value::{Payload, TypeTag, Value};

/// One entry in the call-frame stack. `arity` is carried only for stack
/// traces; addressing uses `fp` alone (spec.md §4.3).
#[derive(Copy, Clone, Debug)]
struct Frame {
    return_pc: i64,
    fp: usize,
    #[allow(dead_code)]
    arity: i64,
}

/// When a program's `Main` calls `Exit`, the VM stops with this exit code
/// instead of falling through to `Lod`'s implicit zero.
pub struct Halted {
    pub exit_code: i64,
}

pub struct Vm {
    program: Program,
    stack: Vec<Value>,
    call_stack: Vec<Frame>,
    globals: Vec<Value>,
    pc: i64,
    return_reg: Value,
    done: bool,
    exit_code: i64,
    gc: Collector,
    native: NativeBridge,
    rng: StdRng,
    /// Accumulated by `Spd` immediately ahead of a `Cal`: the number of
    /// stack slots the callee's frame pointer must look back past to find
    /// its first argument, mirroring `sp_decs` in `VM_Cal`/`VM_Spd`.
    sp_decs: i64,
}

impl Vm {
    pub fn new(program: Program) -> Vm {
        Vm {
            program,
            stack: Vec::new(),
            call_stack: Vec::new(),
            globals: Vec::new(),
            pc: 0,
            return_reg: Value::null(),
            done: false,
            exit_code: 0,
            gc: Collector::new(),
            native: NativeBridge::new(),
            rng: StdRng::seed_from_u64(0),
            sp_decs: 0,
        }
    }

    /// Runs from PC 0 (the `!start` prologue) until `End`/`Exit`.
    pub fn run(&mut self) -> RunResult<Halted> {
        while !self.done {
            self.step()?;
        }
        debug!(exit_code = self.exit_code, "program halted");
        Ok(Halted {
            exit_code: self.exit_code,
        })
    }

    fn fault_at(&self, fault: Fault) -> Fault {
        if let Some(record) = self.program.debug.get((self.pc.max(1) - 1) as usize) {
            error!(module = %record.module, line = record.line, %fault, "runtime fault");
        } else {
            error!(%fault, "runtime fault");
        }
        fault
    }

    fn step(&mut self) -> RunResult<()> {
        let word = self
            .program
            .fetch(self.pc as usize)
            .map_err(|_| self.fault_at(Fault::IllegalAddr(self.pc)))?;
        let (opcode, operand) = decode(word);
        trace!(pc = self.pc, ?opcode, operand, "dispatch");
        self.pc += 1;
        self.execute(opcode, operand).map_err(|e| self.fault_at(e))
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.stack.pop().ok_or(Fault::Underflow)
    }

    fn top(&self) -> RunResult<Value> {
        self.stack.last().cloned().ok_or(Fault::Underflow)
    }

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn frame_pointer(&self) -> usize {
        self.call_stack.last().map(|f| f.fp).unwrap_or(0)
    }

    fn ensure_global(&mut self, slot: usize) {
        if self.globals.len() <= slot {
            self.globals.resize_with(slot + 1, Value::null);
        }
    }

    fn expect_type(v: &Value, want: TypeTag) -> Fault {
        Fault::TypeError {
            expect: BitFlags::from(want),
            got: v.type_tag(),
        }
    }

    /// Reentrant call used by `Qso`/`Bsr` to invoke a comparator from
    /// inside a native (Rust) builtin, while the outer `run` loop is
    /// paused mid-dispatch — mirrors `VM_Run`'s documented re-entrancy:
    /// it remembers the frame-stack depth at entry and stops as soon as
    /// that depth is restored by the callee's own `Ret`.
    fn invoke(&mut self, address: i64, args: Vec<Value>) -> RunResult<Value> {
        let depth = self.call_stack.len();
        let fp = self.stack.len();
        for a in args {
            self.push(a);
        }
        self.call_stack.push(Frame {
            return_pc: self.pc,
            fp,
            arity: 0,
        });
        self.pc = address;
        while self.call_stack.len() > depth && !self.done {
            self.step()?;
        }
        Ok(self.return_reg.clone())
    }

    fn function_address(v: &Value) -> RunResult<i64> {
        match &*v.0.payload.borrow() {
            Payload::Function(f) => Ok(f.address),
            _ => Err(Self::expect_type(v, TypeTag::Function)),
        }
    }

    fn gc_roots(&self) -> Vec<Value> {
        self.stack
            .iter()
            .cloned()
            .chain(self.globals.iter().cloned())
            .chain(std::iter::once(self.return_reg.clone()))
            .collect()
    }

    fn execute(&mut self, opcode: Opcode, operand: i64) -> RunResult<()> {
        use Opcode::*;
        match opcode {
            // --- stack/flow ---------------------------------------------
            Psh => {
                let literal = self
                    .program
                    .data
                    .get(operand as usize)
                    .ok_or(Fault::IllegalAddr(operand))?;
                // `[]`/`{}` literals are deduplicated in the data segment
                // like any other constant, but each *execution* of a `Psh`
                // against one must build a fresh, mutable container rather
                // than share the one in the pool — otherwise every `[]` in
                // the program (and every loop iteration re-running the same
                // `Psh`) would alias the same backing Queue/Map.
                let v = match &*literal.0.payload.borrow() {
                    Payload::Queue(_) => {
                        let fresh = Value::empty_queue();
                        self.gc.track(fresh.clone());
                        fresh
                    }
                    Payload::Map(_) => {
                        let fresh = Value::empty_map();
                        self.gc.track(fresh.clone());
                        fresh
                    }
                    _ => literal.clone(),
                };
                self.push(v);
            }
            Pop => {
                let n = operand as usize;
                let len = self.stack.len();
                self.stack.truncate(len.saturating_sub(n));
            }
            Spd => {
                self.sp_decs += operand;
            }
            Jmp => self.pc = operand,
            Brf => {
                let cond = self.pop()?.as_bool()?;
                if !cond {
                    self.pc = operand;
                }
            }
            Cal => {
                let fp = (self.stack.len() as i64 - self.sp_decs).max(0) as usize;
                self.sp_decs = 0;
                self.call_stack.push(Frame {
                    return_pc: self.pc,
                    fp,
                    arity: 0,
                });
                self.pc = operand;
            }
            Ret => {
                let frame = self.call_stack.pop().ok_or(Fault::Underflow)?;
                self.pc = frame.return_pc;
            }
            Sav => {
                self.return_reg = self.pop()?;
            }
            Fls => {
                let frame = self.call_stack.pop().ok_or(Fault::Underflow)?;
                self.stack.truncate(frame.fp);
                self.pc = frame.return_pc;
            }
            Lod => {
                self.push(self.return_reg.clone());
                self.return_reg = Value::null();
            }
            End => {
                let n = self.return_reg.as_number()?;
                self.exit_code = n as i64;
                self.done = true;
            }

            // --- memory/globals ------------------------------------------
            Glb => {
                let slot = operand as usize;
                self.ensure_global(slot);
                self.push(self.globals[slot].clone());
            }
            Loc => {
                let fp = self.frame_pointer();
                let slot = fp + operand as usize;
                let v = self.stack.get(slot).cloned().ok_or(Fault::IllegalAddr(operand))?;
                self.push(v);
            }
            Mov => {
                let b = self.pop()?;
                let a = self.top()?;
                a.mov(&b)?;
            }
            Con => {
                self.top()?.mark_constant();
            }
            Cop => {
                let a = self.pop()?;
                let copy = a.deep_copy();
                self.gc.track_tree(&copy);
                self.push(copy);
            }
            Ref => {
                let a = self.pop()?;
                self.push(Value::number(a.refs() as f64));
            }
            Mem => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::boolean(a.same_identity(&b)));
            }
            Ptr => {
                let a = self.pop()?;
                let ptr = Value::pointer(a);
                self.gc.track(ptr.clone());
                self.push(ptr);
            }
            Drf | Val => {
                let p = self.pop()?;
                let target = match &*p.0.payload.borrow() {
                    Payload::Pointer(t) => t.borrow().clone(),
                    _ => return Err(Self::expect_type(&p, TypeTag::Pointer)),
                };
                self.push(target);
            }
            God => {
                let a = self.pop()?;
                self.push(Value::boolean(!a.is_null()));
            }

            // --- arithmetic/math -------------------------------------------
            Add => self.binary_numeric(|a, b| a.add(b))?,
            Sub => self.binary_numeric(|a, b| a.sub(b))?,
            Mul => self.binary_numeric(|a, b| a.mul(b))?,
            Div => self.binary_numeric(|a, b| a.div(b))?,
            Mod => self.binary_numeric(|a, b| a.modulo(b))?,
            Pow => self.binary_numeric(|a, b| a.pow(b))?,
            Idv => self.binary_numeric(|a, b| a.idiv(b))?,
            Imd => self.binary_numeric(|a, b| a.imod(b))?,
            Abs => self.unary_math(|n| n.abs())?,
            Sin => self.unary_math(|n| n.sin())?,
            Cos => self.unary_math(|n| n.cos())?,
            Tan => self.unary_math(|n| n.tan())?,
            Asi => self.unary_math(|n| n.asin())?,
            Aco => self.unary_math(|n| n.acos())?,
            Ata => self.unary_math(|n| n.atan())?,
            Log => self.unary_math(|n| n.ln())?,
            Sqr => self.unary_math(|n| n.sqrt())?,
            Cel => self.unary_math(|n| n.ceil())?,
            Flr => self.unary_math(|n| n.floor())?,
            Min => {
                let b = self.pop()?.as_number()?;
                let a = self.pop()?.as_number()?;
                self.push(Value::number(a.min(b)));
            }
            Max => {
                let b = self.pop()?.as_number()?;
                let a = self.pop()?.as_number()?;
                self.push(Value::number(a.max(b)));
            }

            // --- comparison/logic -------------------------------------------
            Eql => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::boolean(a.value_eq(&b)));
            }
            Neq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::boolean(!a.value_eq(&b)));
            }
            Lst => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a.lt(&b));
            }
            Grt => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a.gt(&b));
            }
            Lte => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a.lte(&b));
            }
            Gte => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a.gte(&b));
            }
            And => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a.logical_and(&b)?);
            }
            Lor => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a.logical_or(&b)?);
            }
            Not => {
                let a = self.pop()?;
                self.push(a.logical_not()?);
            }
            All => {
                let a = self.pop()?;
                let ok = match &*a.0.payload.borrow() {
                    Payload::Queue(q) => q.borrow().iter().all(|v| v.as_bool().unwrap_or(false)),
                    _ => return Err(Self::expect_type(&a, TypeTag::Queue)),
                };
                self.push(Value::boolean(ok));
            }
            Any => {
                let a = self.pop()?;
                let ok = match &*a.0.payload.borrow() {
                    Payload::Queue(q) => q.borrow().iter().any(|v| v.as_bool().unwrap_or(false)),
                    _ => return Err(Self::expect_type(&a, TypeTag::Queue)),
                };
                self.push(Value::boolean(ok));
            }

            // --- containers -------------------------------------------------
            Len => {
                let a = self.pop()?;
                self.push(Value::number(a.len()? as f64));
            }
            Get => {
                let key = self.pop()?;
                let container = self.pop()?;
                let v = container.get(&key)?;
                self.push(v);
            }
            Ins => {
                let value = self.pop()?;
                let key = self.pop()?;
                let container = self.top()?;
                container.insert(&key, value)?;
            }
            Del => {
                let key = self.pop()?;
                let container = self.pop()?;
                container.delete(&key)?;
                self.push(Value::null());
            }
            Key => {
                let container = self.pop()?;
                self.push(container.keys()?);
            }
            Exi => {
                let key = self.pop()?;
                let container = self.pop()?;
                self.push(Value::boolean(container.exists(&key)?));
            }
            Slc => {
                let hi = self.pop()?;
                let lo = self.pop()?;
                let container = self.pop()?;
                self.push(container.slice(&lo, &hi)?);
            }
            Psb => {
                let value = self.pop()?;
                let container = self.top()?;
                container.push_back(value)?;
            }
            Psf => {
                let value = self.pop()?;
                let container = self.top()?;
                container.push_front(value)?;
            }

            // --- meta/IO -----------------------------------------------------
            Typ => {
                let a = self.pop()?;
                self.push(Value::string(a.type_name()));
            }
            Asr => {
                let a = self.pop()?;
                if !a.as_bool()? {
                    return Err(Fault::AssertFailed);
                }
                self.push(Value::null());
            }
            Ext => {
                let code = self.pop()?.as_index()?;
                self.exit_code = code;
                self.done = true;
            }
            Tim => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                self.push(Value::number(now.as_secs_f64()));
            }
            Srd => {
                let seed = self.pop()?.as_index()?;
                self.rng = StdRng::seed_from_u64(seed as u64);
                self.push(Value::null());
            }
            Ran => {
                let n: f64 = self.rng.gen();
                self.push(Value::number(n));
            }
            Gar => {
                if self.gc.should_collect() {
                    let roots = self.gc_roots();
                    let collected = self.gc.collect(&roots);
                    debug!(collected, "cycle collector ran");
                }
            }
            Prt => {
                let a = self.pop()?;
                println!("{}", crate::dump::sprint(&a, false, 0));
                self.push(Value::null());
            }
            Opn => {
                let mode = self.pop()?.as_text().ok_or(Fault::MalformedLiteral("mode".into()))?;
                let path = self.pop()?.as_text().ok_or(Fault::MalformedLiteral("path".into()))?;
                let handle = match mode.as_str() {
                    "r" => std::fs::File::open(&path).ok(),
                    "w" => std::fs::File::create(&path).ok(),
                    _ => None,
                };
                self.push(Value::file(path, mode, handle));
            }
            Red => {
                use std::io::Read as _;
                let count = self.pop()?.as_index()?;
                let file = self.pop()?;
                let text = match &*file.0.payload.borrow() {
                    Payload::File(f) => {
                        let mut buf = vec![0u8; count.max(0) as usize];
                        let n = f
                            .handle
                            .borrow_mut()
                            .as_mut()
                            .map(|h| h.read(&mut buf).unwrap_or(0))
                            .unwrap_or(0);
                        String::from_utf8_lossy(&buf[..n]).into_owned()
                    }
                    _ => return Err(Self::expect_type(&file, TypeTag::File)),
                };
                self.push(Value::string(text));
            }
            Wrt => {
                use std::io::Write as _;
                let data = self.pop()?;
                let file = self.pop()?;
                let text = data.as_text().ok_or(Fault::MalformedLiteral("data".into()))?;
                let n = match &*file.0.payload.borrow() {
                    Payload::File(f) => f
                        .handle
                        .borrow_mut()
                        .as_mut()
                        .map(|h| h.write(text.as_bytes()).unwrap_or(0))
                        .unwrap_or(0),
                    _ => return Err(Self::expect_type(&file, TypeTag::File)),
                };
                self.push(Value::number(n as f64));
            }
            Dll => {
                let argc = self.pop()?.as_index()?;
                let symbol = self.pop()?.as_text().ok_or(Fault::MalformedLiteral("symbol".into()))?;
                let path = self.pop()?.as_text().ok_or(Fault::MalformedLiteral("path".into()))?;
                let mut args = Vec::with_capacity(argc.max(0) as usize);
                for _ in 0..argc.max(0) {
                    args.push(self.pop()?);
                }
                args.reverse();
                let result = self.native.call(&path, &symbol, &args)?;
                self.push(result);
            }

            // --- indirect call -------------------------------------------
            Vrt => {
                let f = self.pop()?;
                let address = Self::function_address(&f)?;
                let fp = self.stack.len();
                self.call_stack.push(Frame {
                    return_pc: self.pc,
                    fp,
                    arity: 0,
                });
                self.pc = address;
            }
            Trv => {
                let f = self.pop()?;
                let args = self.pop()?;
                let address = Self::function_address(&f)?;
                let items: Vec<Value> = match &*args.0.payload.borrow() {
                    Payload::Queue(q) => q.borrow().iter().cloned().collect(),
                    _ => return Err(Self::expect_type(&args, TypeTag::Queue)),
                };
                let fp = self.stack.len();
                for item in items {
                    self.push(item);
                }
                self.call_stack.push(Frame {
                    return_pc: self.pc,
                    fp,
                    arity: 0,
                });
                self.pc = address;
            }
            Qso => {
                let comparator = self.pop()?;
                let container = self.pop()?;
                let address = Self::function_address(&comparator)?;
                let mut items: Vec<Value> = match &*container.0.payload.borrow() {
                    Payload::Queue(q) => q.borrow().iter().cloned().collect(),
                    _ => return Err(Self::expect_type(&container, TypeTag::Queue)),
                };
                self.sort_with(&mut items, address)?;
                match &*container.0.payload.borrow() {
                    Payload::Queue(q) => {
                        *q.borrow_mut() = items.into_iter().collect();
                    }
                    _ => unreachable!(),
                }
                self.push(container);
            }
            Bsr => {
                let comparator = self.pop()?;
                let target = self.pop()?;
                let container = self.pop()?;
                let address = Self::function_address(&comparator)?;
                let items: Vec<Value> = match &*container.0.payload.borrow() {
                    Payload::Queue(q) => q.borrow().iter().cloned().collect(),
                    _ => return Err(Self::expect_type(&container, TypeTag::Queue)),
                };
                let found = self.binary_search(&items, &target, address)?;
                self.push(Value::number(found.map(|i| i as f64).unwrap_or(-1.0)));
            }
        }
        Ok(())
    }

    fn binary_numeric(&mut self, f: impl Fn(&Value, &Value) -> Result<Value, Fault>) -> RunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(f(&a, &b)?);
        Ok(())
    }

    fn unary_math(&mut self, f: impl Fn(f64) -> f64) -> RunResult<()> {
        let a = self.pop()?;
        self.push(a.unary_math(f)?);
        Ok(())
    }

    /// `less(a, b)` via the comparator's reentrant invocation, used by both
    /// `sort_with` and `binary_search`.
    fn less(&mut self, address: i64, a: &Value, b: &Value) -> RunResult<bool> {
        let result = self.invoke(address, vec![a.clone(), b.clone()])?;
        result.as_bool()
    }

    fn sort_with(&mut self, items: &mut Vec<Value>, address: i64) -> RunResult<()> {
        // Insertion sort: simple and correct, and every comparison goes
        // through a reentrant bytecode call, so an O(n log n) algorithm
        // buys little at the scales this language runs at.
        for i in 1..items.len() {
            let mut j = i;
            while j > 0 && self.less(address, &items[j], &items[j - 1])? {
                items.swap(j, j - 1);
                j -= 1;
            }
        }
        Ok(())
    }

    fn binary_search(&mut self, items: &[Value], target: &Value, address: i64) -> RunResult<Option<usize>> {
        let mut lo = 0i64;
        let mut hi = items.len() as i64 - 1;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            if self.less(address, &items[mid as usize], target)? {
                lo = mid + 1;
            } else if self.less(address, target, &items[mid as usize])? {
                hi = mid - 1;
            } else {
                return Ok(Some(mid as usize));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{Literal, Stub};

    fn run_stubs(stubs: &[Stub]) -> Halted {
        let program = crate::assembler::Assembler::new().assemble(stubs).unwrap();
        let mut vm = Vm::new(program);
        vm.run().unwrap()
    }

    #[test]
    fn arithmetic_and_halt() {
        let stubs = vec![
            Stub::op_literal("t", 1, Opcode::Psh, Literal::Number("2".into())),
            Stub::op_literal("t", 1, Opcode::Psh, Literal::Number("3".into())),
            Stub::op("t", 1, Opcode::Add),
            Stub::op("t", 1, Opcode::Sav),
            Stub::op("t", 1, Opcode::End),
        ];
        let halted = run_stubs(&stubs);
        assert_eq!(halted.exit_code, 5);
    }

    #[test]
    fn call_and_return_roundtrip() {
        let stubs = vec![
            Stub::op_label("t", 1, Opcode::Cal, "fn"),
            Stub::op("t", 1, Opcode::Lod),
            Stub::op("t", 1, Opcode::Sav),
            Stub::op("t", 1, Opcode::End),
            Stub::Label("fn".into()),
            Stub::op_literal("t", 2, Opcode::Psh, Literal::Number("42".into())),
            Stub::op("t", 2, Opcode::Sav),
            Stub::op("t", 2, Opcode::Ret),
        ];
        let program = crate::assembler::Assembler::new().assemble(&stubs).unwrap();
        let mut vm = Vm::new(program);
        vm.run().unwrap();
        assert_eq!(vm.exit_code, 42);
    }

    #[test]
    fn underflow_is_a_fault() {
        let stubs = vec![Stub::op("t", 1, Opcode::Add)];
        let program = crate::assembler::Assembler::new().assemble(&stubs).unwrap();
        let mut vm = Vm::new(program);
        assert!(vm.run().is_err());
    }

    /// A two-argument call must address its parameters at `fp+0`/`fp+1`
    /// where `fp` sits *below* the pushed arguments (`Spd` tells `Cal`
    /// how far back to look), not past them.
    #[test]
    fn call_with_arguments_addresses_params_correctly() {
        let stubs = vec![
            Stub::op_literal("t", 1, Opcode::Psh, Literal::Number("10".into())),
            Stub::op_literal("t", 1, Opcode::Psh, Literal::Number("32".into())),
            Stub::op_number("t", 1, Opcode::Spd, 2),
            Stub::op_label("t", 1, Opcode::Cal, "add2"),
            Stub::op("t", 1, Opcode::Lod),
            Stub::op("t", 1, Opcode::Sav),
            Stub::op("t", 1, Opcode::End),
            Stub::Label("add2".into()),
            Stub::op_number("t", 2, Opcode::Loc, 0),
            Stub::op_number("t", 2, Opcode::Loc, 1),
            Stub::op("t", 2, Opcode::Add),
            Stub::op("t", 2, Opcode::Sav),
            Stub::op("t", 2, Opcode::Ret),
        ];
        let program = crate::assembler::Assembler::new().assemble(&stubs).unwrap();
        let mut vm = Vm::new(program);
        vm.run().unwrap();
        assert_eq!(vm.exit_code, 42);
    }

    #[test]
    fn gc_reclaims_containers_the_stack_no_longer_references() {
        let stubs = vec![
            Stub::op_literal("t", 1, Opcode::Psh, Literal::EmptyQueue),
            Stub::op("t", 1, Opcode::Ptr),
            Stub::op_number("t", 1, Opcode::Pop, 1),
            Stub::op_literal("t", 1, Opcode::Psh, Literal::Number("0".into())),
            Stub::op("t", 1, Opcode::Sav),
            Stub::op("t", 1, Opcode::End),
        ];
        let program = crate::assembler::Assembler::new().assemble(&stubs).unwrap();
        let mut vm = Vm::new(program);
        vm.run().unwrap();
        let roots = vm.gc_roots();
        assert_eq!(vm.gc.collect(&roots), 2);
    }

    #[test]
    fn ref_counts_durable_references_beyond_the_asking_handle() {
        // A fresh value with nothing else holding it reports 0; a global
        // slot (`Glb`) clones the `Rc` the same way `VM_Glb`'s `Value_Inc`
        // would, so a second push of the same global reports 1.
        let stubs = vec![
            Stub::op_number("t", 1, Opcode::Glb, 0),
            Stub::op_literal("t", 1, Opcode::Psh, Literal::Number("7".into())),
            Stub::op("t", 1, Opcode::Mov),
            Stub::op_number("t", 1, Opcode::Pop, 1),
            Stub::op_number("t", 1, Opcode::Glb, 0),
            Stub::op_number("t", 1, Opcode::Glb, 0),
            Stub::op("t", 1, Opcode::Ref),
            Stub::op("t", 1, Opcode::Sav),
            Stub::op("t", 1, Opcode::End),
        ];
        let program = crate::assembler::Assembler::new().assemble(&stubs).unwrap();
        let mut vm = Vm::new(program);
        vm.run().unwrap();
        assert!(vm.exit_code >= 1);
    }

    #[test]
    fn fls_truncates_the_stack_to_the_frame_pointer_before_returning() {
        // `fn` pushes two extra locals past its frame pointer before an
        // early `ret`-style `Sav; Fls`; the caller's own stack must come
        // back exactly as it was, with only the returned value readable
        // through `Lod`.
        let stubs = vec![
            Stub::op_label("t", 1, Opcode::Cal, "fn"),
            Stub::op("t", 1, Opcode::Lod),
            Stub::op("t", 1, Opcode::Sav),
            Stub::op("t", 1, Opcode::End),
            Stub::Label("fn".into()),
            Stub::op_literal("t", 2, Opcode::Psh, Literal::Number("1".into())),
            Stub::op_literal("t", 2, Opcode::Psh, Literal::Number("2".into())),
            Stub::op_literal("t", 2, Opcode::Psh, Literal::Number("42".into())),
            Stub::op("t", 2, Opcode::Sav),
            Stub::op("t", 2, Opcode::Fls),
        ];
        let program = crate::assembler::Assembler::new().assemble(&stubs).unwrap();
        let mut vm = Vm::new(program);
        vm.run().unwrap();
        assert_eq!(vm.exit_code, 42);
        assert_eq!(vm.stack.len(), 0);
    }

    #[test]
    fn lod_clears_the_return_register_after_pushing_it() {
        // A second `Lod` with nothing saved in between must not observe
        // the first call's stale return value - it reads null instead.
        let stubs = vec![
            Stub::op_label("t", 1, Opcode::Cal, "fn"),
            Stub::op("t", 1, Opcode::Lod),
            Stub::op_number("t", 1, Opcode::Pop, 1),
            Stub::op("t", 1, Opcode::Lod),
            Stub::op_literal("t", 1, Opcode::Psh, Literal::Number("0".into())),
            Stub::op("t", 1, Opcode::Sav),
            Stub::op("t", 1, Opcode::End),
            Stub::Label("fn".into()),
            Stub::op_literal("t", 2, Opcode::Psh, Literal::Number("99".into())),
            Stub::op("t", 2, Opcode::Sav),
            Stub::op("t", 2, Opcode::Ret),
        ];
        let program = crate::assembler::Assembler::new().assemble(&stubs).unwrap();
        let mut vm = Vm::new(program);
        vm.run().unwrap();
        assert!(vm.stack.last().unwrap().is_null());
    }
}
