//! The native dynamic-library bridge (spec.md §6, `Dll` opcode). Loads a
//! shared object with `libloading`, resolves a symbol by name, and calls it
//! with up to 9 pointer-sized arguments built from RR values — mirroring
//! `roman2.c`'s `VM_Dll`, which hands the foreign function raw `void*`s to
//! stack-local C values rather than marshalling a managed calling
//! convention.

use std::collections::HashMap;
use std::ffi::c_void;

use libloading::{Library, Symbol};
use tracing::debug;

use crate::error::Fault;
use crate::value::Value;

const MAX_NATIVE_ARGS: usize = 9;

/// A C function taking up to 9 `void*` arguments and returning nothing
/// useful to RR (spec.md: the return value is always `Null`). The bridge
/// always calls through the 9-argument shape and pads unused slots with
/// null pointers, since `libloading`'s `Symbol` needs a single fixed
/// signature to transmute into.
type NativeFn = unsafe extern "C" fn(
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
);

/// Caches opened libraries by path so repeated `Dll` calls into the same
/// `.so`/`.dylib` don't reopen it every time.
pub struct NativeBridge {
    libraries: HashMap<String, Library>,
}

/// Backing storage an argument's raw pointer points into. Numbers/Bools get
/// a owned scratch cell; Strings/Chars point directly at the RR-owned byte
/// buffer since the callee is documented to only read it.
enum Scratch {
    Number(f64),
    Bool(bool),
}

impl NativeBridge {
    pub fn new() -> NativeBridge {
        NativeBridge {
            libraries: HashMap::new(),
        }
    }

    fn library(&mut self, path: &str) -> Result<&Library, Fault> {
        if !self.libraries.contains_key(path) {
            let lib = unsafe { Library::new(path) }
                .map_err(|_| Fault::NativeSymbol(path.to_string(), "<open>".to_string()))?;
            self.libraries.insert(path.to_string(), lib);
        }
        Ok(self.libraries.get(path).unwrap())
    }

    /// `Dll`: pops `(path: String, symbol: String, argc: Number)` plus
    /// `argc` further values already beneath them on the operand stack, and
    /// calls `symbol` from `path` with `argc` raw pointers built from those
    /// values. Always returns `Null` (spec.md §6).
    pub fn call(&mut self, path: &str, symbol: &str, args: &[Value]) -> Result<Value, Fault> {
        if args.len() > MAX_NATIVE_ARGS {
            return Err(Fault::NativeArity(args.len() as i64));
        }
        debug!(path, symbol, argc = args.len(), "invoking native function");

        let mut scratch: Vec<Scratch> = Vec::with_capacity(args.len());
        let mut string_bytes: Vec<Vec<u8>> = Vec::new();
        for v in args {
            match v.as_number() {
                Ok(n) => {
                    scratch.push(Scratch::Number(n));
                    continue;
                }
                Err(_) => {}
            }
            if let Ok(b) = v.as_bool() {
                scratch.push(Scratch::Bool(b));
                continue;
            }
            if let Some(text) = v.as_text() {
                let mut bytes = text.into_bytes();
                bytes.push(0);
                string_bytes.push(bytes);
                continue;
            }
            return Err(Fault::NativeSymbol(path.to_string(), symbol.to_string()));
        }

        let mut pointers: [*mut c_void; MAX_NATIVE_ARGS] = [std::ptr::null_mut(); MAX_NATIVE_ARGS];
        let mut scratch_iter = scratch.iter_mut();
        let mut string_iter = string_bytes.iter_mut();
        for (i, v) in args.iter().enumerate() {
            if v.as_number().is_ok() || v.as_bool().is_ok() {
                match scratch_iter.next().unwrap() {
                    Scratch::Number(n) => pointers[i] = n as *mut f64 as *mut c_void,
                    Scratch::Bool(b) => pointers[i] = b as *mut bool as *mut c_void,
                }
            } else {
                let bytes = string_iter.next().unwrap();
                pointers[i] = bytes.as_mut_ptr() as *mut c_void;
            }
        }

        let lib = self.library(path)?;
        let func: Symbol<NativeFn> = unsafe {
            lib.get(symbol.as_bytes())
                .map_err(|_| Fault::NativeSymbol(path.to_string(), symbol.to_string()))?
        };
        unsafe {
            func(
                pointers[0], pointers[1], pointers[2], pointers[3], pointers[4], pointers[5],
                pointers[6], pointers[7], pointers[8],
            );
        }
        Ok(Value::null())
    }
}

impl Default for NativeBridge {
    fn default() -> NativeBridge {
        NativeBridge::new()
    }
}
