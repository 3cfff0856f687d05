//! The Value model: a tagged sum over heap-boxed payloads, each carrying a
//! constant flag (spec.md §3) and, via `Rc`, its own reference count.
//!
//! Every `Value` is `Rc<ValueBox>`. The `Rc` gives us real memory safety for
//! free (a value's backing allocation survives exactly as long as someone
//! holds a clone of the handle) and, for the same reason, a correct
//! "durable references" count for free too: `Loc`/`Glb` clone the handle
//! onto the stack exactly where the original's `VM_Loc`/`VM_Glb` would call
//! `Value_Inc`, and dropping a clone (a `Pop`, a scope exit, a container
//! losing an element) decrements in step — spec.md §9's requirement that
//! `Ref` "count durable references" under an `Rc`-based reimplementation.
//! `refs()` reads `Rc::strong_count` rather than re-deriving the same
//! number through a hand-maintained parallel counter, which would need
//! its own `inc`/`dec` call at every one of those sites and could drift
//! out of sync with the real handle count if one were missed. The
//! `constant` cell on `ValueBox` has no `Rc` equivalent, so it stays a
//! manually-set flag.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::File as OsFile;
use std::rc::Rc;

use enumflags2::BitFlags;

use crate::error::Fault;

#[derive(BitFlags, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum TypeTag {
    File = 0b00_0000_0001,
    Function = 0b00_0000_0010,
    Queue = 0b00_0000_0100,
    Char = 0b00_0000_1000,
    Map = 0b00_0001_0000,
    String = 0b00_0010_0000,
    Number = 0b00_0100_0000,
    Bool = 0b00_1000_0000,
    Pointer = 0b01_0000_0000,
    Null = 0b10_0000_0000,
}

pub type TypeSet = BitFlags<TypeTag>;

pub struct FunctionVal {
    pub name: String,
    pub arity: i64,
    pub address: i64,
}

pub struct FileVal {
    pub path: String,
    pub mode: String,
    pub handle: RefCell<Option<OsFile>>,
}

pub enum Payload {
    Number(f64),
    Bool(bool),
    Null,
    Str(RefCell<String>),
    /// A byte offset into `parent`'s bytes; `parent` holds a strong
    /// reference, so the borrow stays valid for as long as the Char lives
    /// (spec.md invariant I2).
    Char { parent: Value, index: usize },
    Queue(RefCell<VecDeque<Value>>),
    Map(RefCell<BTreeMap<String, Value>>),
    File(Rc<FileVal>),
    Function(Rc<FunctionVal>),
    /// The only variant that can form a reference cycle.
    Pointer(RefCell<Value>),
}

/// `payload` sits behind its own `RefCell` (on top of the per-container
/// `RefCell`s already inside `Payload`) so that `Mov` — assignment's
/// implementation opcode — can overwrite a box's contents and even its
/// variant in place, exactly as `Type_Kill`/`Type_Copy` do in the original:
/// other live handles to the same `Rc<ValueBox>` (a Queue element, a Map
/// value) observe the new contents rather than going stale.
pub struct ValueBox {
    pub payload: RefCell<Payload>,
    pub constant: Cell<bool>,
}

#[derive(Clone)]
pub struct Value(pub Rc<ValueBox>);

impl Value {
    fn new(payload: Payload) -> Value {
        Value(Rc::new(ValueBox {
            payload: RefCell::new(payload),
            constant: Cell::new(false),
        }))
    }

    pub fn number(n: f64) -> Value {
        Value::new(Payload::Number(n))
    }

    pub fn boolean(b: bool) -> Value {
        Value::new(Payload::Bool(b))
    }

    pub fn null() -> Value {
        Value::new(Payload::Null)
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::new(Payload::Str(RefCell::new(s.into())))
    }

    pub fn char_at(parent: Value, index: usize) -> Value {
        Value::new(Payload::Char { parent, index })
    }

    pub fn queue(items: VecDeque<Value>) -> Value {
        Value::new(Payload::Queue(RefCell::new(items)))
    }

    pub fn empty_queue() -> Value {
        Value::queue(VecDeque::new())
    }

    pub fn map(items: BTreeMap<String, Value>) -> Value {
        Value::new(Payload::Map(RefCell::new(items)))
    }

    pub fn empty_map() -> Value {
        Value::map(BTreeMap::new())
    }

    pub fn file(path: String, mode: String, handle: Option<OsFile>) -> Value {
        Value::new(Payload::File(Rc::new(FileVal {
            path,
            mode,
            handle: RefCell::new(handle),
        })))
    }

    pub fn function(name: String, arity: i64, address: i64) -> Value {
        Value::new(Payload::Function(Rc::new(FunctionVal {
            name,
            arity,
            address,
        })))
    }

    pub fn pointer(target: Value) -> Value {
        Value::new(Payload::Pointer(RefCell::new(target)))
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Durable references to this value beyond the one held by whoever's
    /// asking: a freshly allocated value with no other handle outstanding
    /// reports 0, matching `Value_New`'s `self->refs = 0` in the original.
    pub fn refs(&self) -> i64 {
        Rc::strong_count(&self.0) as i64 - 1
    }

    pub fn is_constant(&self) -> bool {
        self.0.constant.get()
    }

    /// Mark this value, and transitively its contents, constant
    /// (spec.md invariant I3).
    pub fn mark_constant(&self) {
        self.0.constant.set(true);
        match &*self.0.payload.borrow() {
            Payload::Queue(q) => {
                for v in q.borrow().iter() {
                    v.mark_constant();
                }
            }
            Payload::Map(m) => {
                for v in m.borrow().values() {
                    v.mark_constant();
                }
            }
            _ => {}
        }
    }

    pub fn type_tag(&self) -> TypeTag {
        match &*self.0.payload.borrow() {
            Payload::Number(_) => TypeTag::Number,
            Payload::Bool(_) => TypeTag::Bool,
            Payload::Null => TypeTag::Null,
            Payload::Str(_) => TypeTag::String,
            Payload::Char { .. } => TypeTag::Char,
            Payload::Queue(_) => TypeTag::Queue,
            Payload::Map(_) => TypeTag::Map,
            Payload::File(_) => TypeTag::File,
            Payload::Function(_) => TypeTag::Function,
            Payload::Pointer(_) => TypeTag::Pointer,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(*self.0.payload.borrow(), Payload::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match &*self.0.payload.borrow() {
            Payload::Number(_) => "number",
            Payload::Bool(_) => "bool",
            Payload::Null => "null",
            Payload::Str(_) => "string",
            Payload::Char { .. } => "char",
            Payload::Queue(_) => "queue",
            Payload::Map(_) => "map",
            Payload::File(_) => "file",
            Payload::Function(_) => "function",
            Payload::Pointer(_) => "pointer",
        }
    }

    pub fn as_number(&self) -> Result<f64, Fault> {
        match &*self.0.payload.borrow() {
            Payload::Number(n) => Ok(*n),
            _ => Err(self.type_error(TypeTag::Number)),
        }
    }

    pub fn as_bool(&self) -> Result<bool, Fault> {
        match &*self.0.payload.borrow() {
            Payload::Bool(b) => Ok(*b),
            _ => Err(self.type_error(TypeTag::Bool)),
        }
    }

    pub fn as_index(&self) -> Result<i64, Fault> {
        Ok(self.as_number()? as i64)
    }

    fn type_error(&self, expect: TypeTag) -> Fault {
        Fault::TypeError {
            expect: BitFlags::from(expect),
            got: self.type_tag(),
        }
    }

    /// Byte content of a String or Char, for the operations that treat them
    /// interchangeably (Add/Sub overloads, Map String|Char keys, Eql).
    pub fn as_text(&self) -> Option<String> {
        match &*self.0.payload.borrow() {
            Payload::Str(s) => Some(s.borrow().clone()),
            Payload::Char { parent, index } => {
                let byte = parent.char_byte(*index)?;
                Some(byte.to_string())
            }
            _ => None,
        }
    }

    fn char_byte(&self, index: usize) -> Option<char> {
        match &*self.0.payload.borrow() {
            Payload::Str(s) => s.borrow().as_bytes().get(index).map(|b| *b as char),
            Payload::Char { parent, index: i } => parent.char_byte(*i + index),
            _ => None,
        }
    }

    /// Deep, value-preserving copy: fresh heap cells, refs reset to 0, not
    /// constant, detached from the source (spec.md round-trip law
    /// `Copy(v) == v` by value, `!==` by identity).
    pub fn deep_copy(&self) -> Value {
        match &*self.0.payload.borrow() {
            Payload::Number(n) => Value::number(*n),
            Payload::Bool(b) => Value::boolean(*b),
            Payload::Null => Value::null(),
            Payload::Str(s) => Value::string(s.borrow().clone()),
            Payload::Char { .. } => Value::string(self.as_text().unwrap_or_default()),
            Payload::Queue(q) => {
                Value::queue(q.borrow().iter().map(|v| v.deep_copy()).collect())
            }
            Payload::Map(m) => Value::map(
                m.borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ),
            Payload::File(f) => Value::file(f.path.clone(), f.mode.clone(), None),
            Payload::Function(f) => Value::function(f.name.clone(), f.arity, f.address),
            Payload::Pointer(p) => Value::pointer(p.borrow().deep_copy()),
        }
    }

    /// Value equality (used by `Eql`/`==` and the `PartialEq` impl). Cross-type
    /// comparisons are `false`, except Char/length-1 String per spec.md §4.3.
    pub fn value_eq(&self, other: &Value) -> bool {
        use Payload::*;
        match (&*self.0.payload.borrow(), &*other.0.payload.borrow()) {
            (Number(a), Number(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Null, Null) => true,
            (Str(a), Str(b)) => *a.borrow() == *b.borrow(),
            (Queue(a), Queue(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.value_eq(y))
            }
            (Map(a), Map(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|v2| v.value_eq(v2)))
            }
            (Function(a), Function(b)) => a.address == b.address,
            (File(a), File(b)) => Rc::ptr_eq(a, b),
            (Char { .. }, Str(_)) | (Str(_), Char { .. }) | (Char { .. }, Char { .. }) => {
                match (self.as_text(), other.as_text()) {
                    (Some(a), Some(b)) => a.len() == 1 && b.len() == 1 && a == b,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Identity: same backing allocation (the `Mem` opcode).
    pub fn same_identity(&self, other: &Value) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn numeric_binop(
        &self,
        other: &Value,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Value, Fault> {
        match (&*self.0.payload.borrow(), &*other.0.payload.borrow()) {
            (Payload::Number(a), Payload::Number(b)) => Ok(Value::number(f(*a, *b))),
            _ => Err(Fault::TypeMismatch(self.type_tag(), other.type_tag())),
        }
    }

    pub fn add(&self, other: &Value) -> Result<Value, Fault> {
        use Payload::*;
        match (&*self.0.payload.borrow(), &*other.0.payload.borrow()) {
            (Number(a), Number(b)) => Ok(Value::number(a + b)),
            (Str(_), Char { .. }) | (Str(_), Str(_)) => {
                let mut s = self.as_text().unwrap();
                s.push_str(&other.as_text().unwrap());
                Ok(Value::string(s))
            }
            (Queue(_), Queue(_)) if self.same_identity(other) => {
                // self-append: copy first to avoid aliasing the borrow.
                let copy = other.deep_copy();
                self.add(&copy)
            }
            (Queue(a), Queue(b)) => {
                let mut merged = a.borrow().clone();
                merged.extend(b.borrow().iter().cloned());
                Ok(Value::queue(merged))
            }
            (Queue(a), _) => {
                let mut merged = a.borrow().clone();
                merged.push_back(other.clone());
                Ok(Value::queue(merged))
            }
            (Map(_), Map(_)) if self.same_identity(other) => {
                let copy = other.deep_copy();
                self.add(&copy)
            }
            (Map(a), Map(b)) => {
                let mut merged = a.borrow().clone();
                for (k, v) in b.borrow().iter() {
                    merged.insert(k.clone(), v.clone());
                }
                Ok(Value::map(merged))
            }
            _ => Err(Fault::TypeMismatch(self.type_tag(), other.type_tag())),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, Fault> {
        use Payload::*;
        match (&*self.0.payload.borrow(), &*other.0.payload.borrow()) {
            (Number(a), Number(b)) => Ok(Value::number(a - b)),
            (Queue(a), _) => {
                let mut merged = a.borrow().clone();
                merged.push_front(other.clone());
                Ok(Value::queue(merged))
            }
            (Str(_), Str(_)) | (Char { .. }, Str(_)) => {
                let a = self.as_text().unwrap();
                let b = other.as_text().unwrap();
                Ok(Value::number(a.cmp(&b) as i32 as f64))
            }
            _ => Err(Fault::TypeMismatch(self.type_tag(), other.type_tag())),
        }
    }

    pub fn mul(&self, other: &Value) -> Result<Value, Fault> {
        self.numeric_binop(other, |a, b| a * b)
    }

    pub fn div(&self, other: &Value) -> Result<Value, Fault> {
        self.numeric_binop(other, |a, b| a / b)
    }

    pub fn modulo(&self, other: &Value) -> Result<Value, Fault> {
        match (&*self.0.payload.borrow(), &*other.0.payload.borrow()) {
            (Payload::Str(_), Payload::Queue(_)) => self.format(other),
            _ => self.numeric_binop(other, |a, b| a % b),
        }
    }

    /// `{index}` / `{width.precision}` positional formatting: `self` is the
    /// format string, `args` the Queue of substitution values (spec.md
    /// §4.3 and the OPEN QUESTION in spec.md §9 — only `{index}`, `{.P}`
    /// and `{W.P}` forms are implemented, per what the corpus exercises).
    fn format(&self, args: &Value) -> Result<Value, Fault> {
        let fmt = self.as_text().ok_or_else(|| self.type_error(TypeTag::String))?;
        let items = match &*args.0.payload.borrow() {
            Payload::Queue(q) => q.borrow().clone(),
            _ => return Err(args.type_error(TypeTag::Queue)),
        };
        let mut out = String::new();
        let bytes: Vec<char> = fmt.chars().collect();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == '{' {
                let end = bytes[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .map(|p| i + p)
                    .ok_or_else(|| Fault::MalformedLiteral(fmt.clone()))?;
                let spec_str: String = bytes[i + 1..end].iter().collect();
                if spec_str.contains(' ') {
                    return Err(Fault::FormatWhitespace);
                }
                let (index_part, precision) = match spec_str.split_once('.') {
                    Some((idx, p)) => (idx.to_string(), Some(p.parse::<usize>().unwrap_or(0))),
                    None => (spec_str.clone(), None),
                };
                let index: usize = if index_part.is_empty() {
                    0
                } else {
                    index_part
                        .parse()
                        .map_err(|_| Fault::MalformedLiteral(fmt.clone()))?
                };
                let value = items
                    .get(index)
                    .ok_or(Fault::IndexError(index as i64))?;
                let rendered = crate::dump::sprint(value, false, 0);
                match (precision, value.as_number()) {
                    (Some(p), Ok(n)) => out.push_str(&format!("{:.*}", p, n)),
                    _ => out.push_str(&rendered),
                }
                i = end + 1;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        Ok(Value::string(out))
    }

    pub fn pow(&self, other: &Value) -> Result<Value, Fault> {
        self.numeric_binop(other, |a, b| a.powf(b))
    }

    pub fn idiv(&self, other: &Value) -> Result<Value, Fault> {
        self.numeric_binop(other, |a, b| (a as i64 / b as i64) as f64)
    }

    pub fn imod(&self, other: &Value) -> Result<Value, Fault> {
        self.numeric_binop(other, |a, b| (a as i64 % b as i64) as f64)
    }

    fn ordered(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (&*self.0.payload.borrow(), &*other.0.payload.borrow()) {
            (Payload::Number(a), Payload::Number(b)) => a.partial_cmp(b),
            _ => None,
        }
    }

    pub fn lt(&self, other: &Value) -> Value {
        Value::boolean(self.ordered(other) == Some(std::cmp::Ordering::Less))
    }

    pub fn gt(&self, other: &Value) -> Value {
        Value::boolean(self.ordered(other) == Some(std::cmp::Ordering::Greater))
    }

    pub fn lte(&self, other: &Value) -> Value {
        use std::cmp::Ordering::*;
        Value::boolean(matches!(self.ordered(other), Some(Less) | Some(Equal)))
    }

    pub fn gte(&self, other: &Value) -> Value {
        use std::cmp::Ordering::*;
        Value::boolean(matches!(self.ordered(other), Some(Greater) | Some(Equal)))
    }

    pub fn unary_math(&self, f: impl Fn(f64) -> f64) -> Result<Value, Fault> {
        Ok(Value::number(f(self.as_number()?)))
    }

    pub fn logical_and(&self, other: &Value) -> Result<Value, Fault> {
        Ok(Value::boolean(self.as_bool()? && other.as_bool()?))
    }

    pub fn logical_or(&self, other: &Value) -> Result<Value, Fault> {
        Ok(Value::boolean(self.as_bool()? || other.as_bool()?))
    }

    pub fn logical_not(&self) -> Result<Value, Fault> {
        Ok(Value::boolean(!self.as_bool()?))
    }

    pub fn len(&self) -> Result<i64, Fault> {
        match &*self.0.payload.borrow() {
            Payload::Queue(q) => Ok(q.borrow().len() as i64),
            Payload::Map(m) => Ok(m.borrow().len() as i64),
            Payload::Str(s) => Ok(s.borrow().len() as i64),
            _ => Err(Fault::TypeMismatch(self.type_tag(), self.type_tag())),
        }
    }

    /// Rewrite a spec.md I5 negative index: `i < 0` becomes `size + i`.
    fn normalize_index(index: i64, size: i64) -> Result<usize, Fault> {
        let i = if index < 0 { size + index } else { index };
        if i < 0 || i >= size {
            Err(Fault::IndexError(index))
        } else {
            Ok(i as usize)
        }
    }

    pub fn push_back(&self, value: Value) -> Result<(), Fault> {
        self.check_mutable()?;
        match &*self.0.payload.borrow() {
            Payload::Queue(q) => {
                q.borrow_mut().push_back(value);
                Ok(())
            }
            _ => Err(Fault::TypeMismatch(self.type_tag(), TypeTag::Queue)),
        }
    }

    pub fn push_front(&self, value: Value) -> Result<(), Fault> {
        self.check_mutable()?;
        match &*self.0.payload.borrow() {
            Payload::Queue(q) => {
                q.borrow_mut().push_front(value);
                Ok(())
            }
            _ => Err(Fault::TypeMismatch(self.type_tag(), TypeTag::Queue)),
        }
    }

    fn check_mutable(&self) -> Result<(), Fault> {
        if self.is_constant() {
            Err(Fault::ConstViolation)
        } else {
            Ok(())
        }
    }

    /// `Get`: Queue[Number] -> element, String[Number] -> Char borrowing the
    /// string, Map[String|Char] -> value or Null.
    pub fn get(&self, key: &Value) -> Result<Value, Fault> {
        match &*self.0.payload.borrow() {
            Payload::Queue(q) => {
                let size = q.borrow().len() as i64;
                let i = Self::normalize_index(key.as_index()?, size)?;
                Ok(q.borrow()[i].clone())
            }
            Payload::Str(s) => {
                let size = s.borrow().len() as i64;
                let i = Self::normalize_index(key.as_index()?, size)?;
                Ok(Value::char_at(self.clone(), i))
            }
            Payload::Map(m) => {
                let k = key
                    .as_text()
                    .ok_or_else(|| key.type_error(TypeTag::String))?;
                Ok(m.borrow().get(&k).cloned().unwrap_or_else(Value::null))
            }
            _ => Err(Fault::TypeMismatch(self.type_tag(), TypeTag::Queue)),
        }
    }

    /// `Ins`: `map[key] := value`, or `Insert(queue, index, value)` splicing
    /// into a Queue ahead of the given position.
    pub fn insert(&self, key: &Value, value: Value) -> Result<(), Fault> {
        self.check_mutable()?;
        match &*self.0.payload.borrow() {
            Payload::Map(m) => {
                let k = key
                    .as_text()
                    .ok_or_else(|| key.type_error(TypeTag::String))?;
                m.borrow_mut().insert(k, value);
                Ok(())
            }
            Payload::Queue(q) => {
                let size = q.borrow().len() as i64;
                let i = Self::normalize_index(key.as_index()?, size.max(1)).unwrap_or(size as usize);
                let i = i.min(q.borrow().len());
                q.borrow_mut().insert(i, value);
                Ok(())
            }
            _ => Err(Fault::TypeMismatch(self.type_tag(), TypeTag::Map)),
        }
    }

    /// `Del`: Queue/String by index, Map by key.
    pub fn delete(&self, key: &Value) -> Result<(), Fault> {
        self.check_mutable()?;
        match &*self.0.payload.borrow() {
            Payload::Queue(q) => {
                let size = q.borrow().len() as i64;
                let i = Self::normalize_index(key.as_index()?, size)?;
                q.borrow_mut().remove(i);
                Ok(())
            }
            Payload::Str(s) => {
                let size = s.borrow().len() as i64;
                let i = Self::normalize_index(key.as_index()?, size)?;
                s.borrow_mut().remove(i);
                Ok(())
            }
            Payload::Map(m) => {
                let k = key
                    .as_text()
                    .ok_or_else(|| key.type_error(TypeTag::String))?;
                m.borrow_mut().remove(&k);
                Ok(())
            }
            _ => Err(Fault::TypeMismatch(self.type_tag(), TypeTag::Queue)),
        }
    }

    /// `Key`: sorted Queue of a Map's keys (spec.md testable property).
    pub fn keys(&self) -> Result<Value, Fault> {
        match &*self.0.payload.borrow() {
            Payload::Map(m) => Ok(Value::queue(
                m.borrow().keys().map(|k| Value::string(k.clone())).collect(),
            )),
            _ => Err(Fault::TypeMismatch(self.type_tag(), TypeTag::Map)),
        }
    }

    /// `Exi`: key existence test.
    pub fn exists(&self, key: &Value) -> Result<bool, Fault> {
        match &*self.0.payload.borrow() {
            Payload::Map(m) => {
                let k = key
                    .as_text()
                    .ok_or_else(|| key.type_error(TypeTag::String))?;
                Ok(m.borrow().contains_key(&k))
            }
            _ => Err(Fault::TypeMismatch(self.type_tag(), TypeTag::Map)),
        }
    }

    /// `Slc`: Queue/String slice by `[lo:hi]`, or Map by `[keyLo:keyHi]`
    /// over sorted key order.
    pub fn slice(&self, lo: &Value, hi: &Value) -> Result<Value, Fault> {
        match &*self.0.payload.borrow() {
            Payload::Queue(q) => {
                let size = q.borrow().len() as i64;
                let (a, b) = Self::slice_bounds(lo.as_index()?, hi.as_index()?, size)?;
                Ok(Value::queue(q.borrow().iter().skip(a).take(b - a).cloned().collect()))
            }
            Payload::Str(s) => {
                let size = s.borrow().len() as i64;
                let (a, b) = Self::slice_bounds(lo.as_index()?, hi.as_index()?, size)?;
                Ok(Value::string(s.borrow()[a..b].to_string()))
            }
            Payload::Map(m) => {
                let lo_key = lo.as_text().ok_or_else(|| lo.type_error(TypeTag::String))?;
                let hi_key = hi.as_text().ok_or_else(|| hi.type_error(TypeTag::String))?;
                Ok(Value::map(
                    m.borrow()
                        .range(lo_key..=hi_key)
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ))
            }
            _ => Err(Fault::TypeMismatch(self.type_tag(), TypeTag::Queue)),
        }
    }

    fn slice_bounds(lo: i64, hi: i64, size: i64) -> Result<(usize, usize), Fault> {
        let a = if lo < 0 { size + lo } else { lo };
        let b = if hi < 0 { size + hi } else { hi };
        if a > b || b > size || a < 0 {
            return Err(Fault::SliceError(lo, hi, size as usize));
        }
        Ok((a as usize, b as usize))
    }

    /// `Mov`: assignment's implementation opcode. Overwrites `self`'s
    /// contents with `source`'s, in place, so every other handle sharing
    /// this box (a Queue slot, a Map entry) sees the update. A Char target
    /// writes through to its parent string instead of replacing its own
    /// payload, since a Char's identity *is* that byte position.
    pub fn mov(&self, source: &Value) -> Result<(), Fault> {
        self.check_mutable()?;
        if self.same_identity(source) {
            return Ok(());
        }
        let is_char_target = matches!(&*self.0.payload.borrow(), Payload::Char { .. });
        if is_char_target {
            let byte = source
                .as_text()
                .and_then(|s| s.chars().next())
                .ok_or_else(|| source.type_error(TypeTag::Char))?;
            if let Payload::Char { parent, index } = &*self.0.payload.borrow() {
                if let Payload::Str(s) = &*parent.0.payload.borrow() {
                    let mut bytes: Vec<char> = s.borrow().chars().collect();
                    if *index < bytes.len() {
                        bytes[*index] = byte;
                        *s.borrow_mut() = bytes.into_iter().collect();
                    }
                }
            }
            return Ok(());
        }
        let copied = source.deep_copy();
        let inner = Rc::try_unwrap(copied.0)
            .unwrap_or_else(|_| unreachable!("deep_copy produces a unique Rc"))
            .payload
            .into_inner();
        *self.0.payload.borrow_mut() = inner;
        Ok(())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::dump::sprint(self, false, 0))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.value_eq(other)
    }
}
