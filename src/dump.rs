//! Canonical value printing (spec.md §6 "Canonical value printing") and the
//! `-d` assembly-dump formatter (spec.md §6 "Assembly-dump format").

use crate::assembler::Program;
use crate::value::{Payload, Value};

/// Render `value` the way `Print`/`Debug` do. `quoted` controls whether a
/// top-level String/Char prints with its surrounding quotes: top-level
/// `Print` output is unquoted, but a String/Char nested inside a Queue or
/// Map always prints quoted so the container's own punctuation stays
/// unambiguous.
pub fn sprint(value: &Value, quoted: bool, indent: usize) -> String {
    match &*value.0.payload.borrow() {
        Payload::Number(n) => format_number(*n),
        Payload::Bool(b) => b.to_string(),
        Payload::Null => "null".to_string(),
        Payload::Str(s) => {
            if quoted {
                format!("\"{}\"", escape(&s.borrow()))
            } else {
                s.borrow().clone()
            }
        }
        Payload::Char { .. } => {
            let text = value.as_text().unwrap_or_default();
            if quoted {
                format!("\"{}\"", escape(&text))
            } else {
                text
            }
        }
        Payload::Queue(q) => {
            let pad = "  ".repeat(indent + 1);
            let items: Vec<String> = q
                .borrow()
                .iter()
                .map(|v| format!("{}{}", pad, sprint(v, true, indent + 1)))
                .collect();
            if items.is_empty() {
                "[]".to_string()
            } else {
                format!("[\n{}\n{}]", items.join(",\n"), "  ".repeat(indent))
            }
        }
        Payload::Map(m) => {
            let pad = "  ".repeat(indent + 1);
            let items: Vec<String> = m
                .borrow()
                .iter()
                .map(|(k, v)| format!("{}{}: {}", pad, k, sprint(v, true, indent + 1)))
                .collect();
            if items.is_empty() {
                "{}".to_string()
            } else {
                format!("{{\n{}\n{}}}", items.join(",\n"), "  ".repeat(indent))
            }
        }
        Payload::File(f) => format!("<file {} ({})>", f.path, f.mode),
        Payload::Function(f) => format!("<function {}/{} @{}>", f.name, f.arity, f.address),
        Payload::Pointer(p) => format!("<pointer -> {}>", sprint(&p.borrow(), true, indent)),
    }
}

/// `%*.*f` with width 0 and precision 5 when unset, matching `Value_Sprint`'s
/// defaults (`width == -1 -> 0`, `preci == -1 -> 5`) - a whole number prints
/// as `3.00000`, not `3`.
fn format_number(n: f64) -> String {
    format!("{:.5}", n)
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// `-d`: print the assembled data segment and instruction stream, one line
/// per entry, in the order the assembler produced them.
pub fn dump_program(program: &Program) -> String {
    let mut out = String::new();
    out.push_str(".data:\n");
    for (index, value) in program.data.iter().enumerate() {
        out.push_str(&format!(
            "{:>5} : {:>3} : {}\n",
            index,
            value.refs(),
            sprint(value, true, 0)
        ));
    }
    out.push_str(".code:\n");
    for (pc, word) in program.code.iter().enumerate() {
        let opcode = (word & 0xFF) as u8;
        let operand = word >> 8;
        let mnemonic = crate::opcode::Opcode::from_byte(opcode)
            .map(|op| op.mnemonic())
            .unwrap_or("???");
        out.push_str(&format!("{:>6}: {:<6} {}\n", pc, mnemonic, operand));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn numbers_print_with_default_precision_five() {
        assert_eq!(sprint(&Value::number(3.0), false, 0), "3.00000");
        assert_eq!(sprint(&Value::number(3.5), false, 0), "3.50000");
    }

    #[test]
    fn strings_quote_only_when_nested() {
        let s = Value::string("hi");
        assert_eq!(sprint(&s, false, 0), "hi");
        assert_eq!(sprint(&s, true, 0), "\"hi\"");
    }

    #[test]
    fn empty_queue_prints_brackets() {
        assert_eq!(sprint(&Value::queue(VecDeque::new()), false, 0), "[]");
    }

    #[test]
    fn print_renders_exactly_what_sprint_produces() {
        // `Print` (src/vm.rs's `Prt` handler) calls `sprint(&a, false, 0)`
        // unmodified, so this is the exact text a `Print(55)` call writes.
        let mut q = VecDeque::new();
        q.push_back(Value::number(1.0));
        q.push_back(Value::string("hi"));
        assert_eq!(sprint(&Value::number(55.0), false, 0), "55.00000");
        assert_eq!(
            sprint(&Value::queue(q), false, 0),
            "[\n  1.00000,\n  \"hi\"\n]"
        );
    }
}
