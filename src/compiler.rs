//! Recursive-descent compiler (spec.md §4.1). Parses one or more source
//! modules directly into a flat stream of assembly stubs plus debug
//! records — there is no intermediate AST. Grounded on `CC_*` in
//! `roman2.c` for grammar/identifier-resolution behavior and on the
//! teacher's single-lookahead lexer discipline for the `unget` buffer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{CompileError, CompileErrorKind, CompileResult};
use crate::lexer::Lexer;
use crate::opcode::Opcode;
use crate::stub::{Literal, Stub};
use crate::token::{Spanned, Token};

#[derive(Clone, Debug, PartialEq)]
enum IdentClass {
    GlobalVar { slot: i64 },
    LocalVar { slot: i64 },
    Function { label: String, arity: i64 },
    FunctionPrototype { arity: i64 },
    NativeFunctionPrototype { arity: i64, lib: String },
}

struct Keyword {
    opcode: Opcode,
    arity: i64,
}

fn keyword_table() -> HashMap<&'static str, Keyword> {
    use Opcode::*;
    let entries = [
        ("Print", Prt, 1),
        ("Len", Len, 1),
        ("Qsort", Qso, 2),
        ("Keys", Key, 1),
        ("Open", Opn, 2),
        ("Read", Red, 2),
        ("Write", Wrt, 2),
        ("Abs", Abs, 1),
        ("Sin", Sin, 1),
        ("Cos", Cos, 1),
        ("Tan", Tan, 1),
        ("Asin", Asi, 1),
        ("Acos", Aco, 1),
        ("Atan", Ata, 1),
        ("Log", Log, 1),
        ("Sqrt", Sqr, 1),
        ("Ceil", Cel, 1),
        ("Floor", Flr, 1),
        ("Type", Typ, 1),
        ("Copy", Cop, 1),
        ("Assert", Asr, 1),
        ("Exit", Ext, 1),
        ("Time", Tim, 0),
        ("Seed", Srd, 1),
        ("Random", Ran, 0),
        ("Del", Del, 2),
        ("Exists", Exi, 2),
        ("Slice", Slc, 3),
        ("Insert", Ins, 3),
        ("Bsr", Bsr, 3),
        ("Mem", Mem, 2),
        ("Val", Val, 1),
        ("God", God, 1),
        ("Ref", Ref, 1),
        ("All", All, 1),
        ("Any", Any, 1),
        ("Min", Min, 2),
        ("Max", Max, 2),
    ];
    entries
        .into_iter()
        .map(|(name, opcode, arity)| (name, Keyword { opcode, arity }))
        .collect()
}

struct Scope {
    names: Vec<String>,
}

pub struct Compiler {
    keywords: HashMap<&'static str, Keyword>,
    symbols: HashMap<String, IdentClass>,
    scopes: Vec<Scope>,
    local_slot: i64,
    global_slot: i64,
    global_inits: Vec<String>,
    stubs: Vec<Stub>,
    label_counter: i64,
    included: HashSet<PathBuf>,
    loop_labels: Vec<(String, String, usize)>,
    module: String,
    lexer: Option<Lexer<'static>>,
}

impl Compiler {
    pub fn new() -> Compiler {
        Compiler {
            keywords: keyword_table(),
            symbols: HashMap::new(),
            scopes: Vec::new(),
            local_slot: 0,
            global_slot: 0,
            global_inits: Vec::new(),
            stubs: Vec::new(),
            label_counter: 0,
            included: HashSet::new(),
            loop_labels: Vec::new(),
            module: String::new(),
            lexer: None,
        }
    }

    fn next_label(&mut self, prefix: &str) -> String {
        self.label_counter += 1;
        format!("__{}_{}", prefix, self.label_counter)
    }

    fn error(&self, line: i64, kind: CompileErrorKind) -> CompileError {
        CompileError {
            module: self.module.clone(),
            line,
            kind,
        }
    }

    /// Entry point: compile `path` and every module it (transitively)
    /// includes, then append the synthetic `!start:` prologue (spec.md
    /// §4.1 "Spool").
    pub fn compile_entry(mut self, path: &Path) -> CompileResult<Vec<Stub>> {
        info!(path = %path.display(), "compiling entry module");
        self.compile_module(path)?;
        if !matches!(
            self.symbols.get("Main"),
            Some(IdentClass::Function { arity: 0, .. })
        ) {
            return Err(self.error(0, CompileErrorKind::MissingMain));
        }
        // Mirrors `CC_Spool`: every `__ginit_*` runs purely for its global's
        // side effect (the initializer's own `Sav;Ret` already discards its
        // pushed `null`), so nothing here ever `Lod`s one back. `Main`'s own
        // `ret`/fall-through populates the return register via `Sav` before
        // `End` reads it directly - no `Lod` belongs in this prologue at all.
        let mut prologue = Vec::new();
        prologue.push(Stub::Label("!start".into()));
        for name in self.global_inits.clone() {
            prologue.push(Stub::op_number("!start", 0, Opcode::Spd, 0));
            prologue.push(Stub::op_label("!start", 0, Opcode::Cal, format!("__ginit_{name}")));
        }
        prologue.push(Stub::op_number("!start", 0, Opcode::Spd, 0));
        prologue.push(Stub::op_label("!start", 0, Opcode::Cal, "Main"));
        prologue.push(Stub::op("!start", 0, Opcode::End));
        prologue.extend(self.stubs);
        debug!(stubs = prologue.len(), "compilation complete");
        Ok(prologue)
    }

    fn canonical_include_path(&self, from: &Path, name: &str) -> PathBuf {
        let mut rel = name.to_string();
        let mut up = 0usize;
        while rel.starts_with('.') {
            rel.remove(0);
            up += 1;
        }
        let mut dir = from.parent().unwrap_or(Path::new(".")).to_path_buf();
        for _ in 0..up.saturating_sub(1) {
            dir.push("..");
        }
        let rel_path = rel.replace('.', "/");
        dir.join(format!("{rel_path}.rr"))
    }

    fn compile_module(&mut self, path: &Path) -> CompileResult<()> {
        let canonical = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        if self.included.contains(&canonical) {
            return Ok(());
        }
        self.included.insert(canonical.clone());

        let source = std::fs::read_to_string(path).map_err(|e| {
            self.error(
                0,
                CompileErrorKind::UnresolvableInclude(path.display().to_string(), e.to_string()),
            )
        })?;

        let module_name = path.display().to_string();
        let prev_module = std::mem::replace(&mut self.module, module_name.clone());

        // SAFETY-FREE WORKAROUND: Lexer borrows the module text; we box it
        // for the lifetime of this call so `self.lexer` can hold it without
        // infecting `Compiler` with a lifetime parameter.
        let boxed: Box<str> = source.into_boxed_str();
        let leaked: &'static str = Box::leak(boxed);
        let lexer = Lexer::new(Box::leak(module_name.clone().into_boxed_str()), leaked);
        let prev_lexer = self.lexer.replace(lexer);

        let result = self.parse_top_decls(path);

        self.lexer = prev_lexer;
        self.module = prev_module;
        result
    }

    fn lexer(&mut self) -> &mut Lexer<'static> {
        self.lexer.as_mut().expect("compile_module sets the lexer")
    }

    fn next(&mut self) -> CompileResult<Spanned> {
        self.lexer().next_token()
    }

    fn unget(&mut self, s: Spanned) {
        self.lexer().unget(s)
    }

    fn expect(&mut self, want: &Token) -> CompileResult<()> {
        let s = self.next()?;
        if &s.token == want {
            Ok(())
        } else {
            Err(self.error(s.line, CompileErrorKind::Expected(format!("{:?}", want))))
        }
    }

    fn expect_ident(&mut self) -> CompileResult<(String, i64)> {
        let s = self.next()?;
        match s.token {
            Token::Ident(name) => Ok((name, s.line)),
            _ => Err(self.error(s.line, CompileErrorKind::Expected("identifier".into()))),
        }
    }

    fn parse_top_decls(&mut self, current_path: &Path) -> CompileResult<()> {
        loop {
            let s = self.next()?;
            match s.token {
                Token::Eof => return Ok(()),
                Token::Ident(kw) if kw == "inc" => {
                    let (name, _) = self.expect_ident()?;
                    self.expect(&Token::Semicolon)?;
                    let included = self.canonical_include_path(current_path, &name);
                    self.compile_module(&included)?;
                }
                Token::Ident(kw) if kw == "lib" => {
                    self.parse_lib_decl()?;
                }
                Token::Ident(kw) if kw == "const" => {
                    // A top-level `const` declares a global, not a local -
                    // `declare_local` would panic (no function scope is
                    // open here) or, if one were, wrongly bind a
                    // module-level constant to a `Loc`-relative slot with
                    // no live frame to address. Route through the same
                    // `__ginit_*` wiring as a plain top-level global.
                    let (name, line) = self.expect_ident()?;
                    self.expect(&Token::ColonEq)?;
                    self.compile_global(&name, line, true)?;
                }
                Token::Ident(name) => {
                    self.unget(Spanned { token: Token::Ident(name), line: s.line });
                    self.parse_top_ident_decl()?;
                }
                other => {
                    return Err(self.error(s.line, CompileErrorKind::Expected(format!("{:?}", other))));
                }
            }
        }
    }

    fn parse_lib_decl(&mut self) -> CompileResult<()> {
        let (lib, _) = self.expect_ident()?;
        self.expect(&Token::LBrace)?;
        loop {
            let s = self.next()?;
            if s.token == Token::RBrace {
                break;
            }
            let name = match s.token {
                Token::Ident(n) => n,
                _ => return Err(self.error(s.line, CompileErrorKind::Expected("identifier".into()))),
            };
            self.expect(&Token::LParen)?;
            let arity = self.count_params()?;
            self.expect(&Token::Semicolon)?;
            self.symbols.insert(
                name,
                IdentClass::NativeFunctionPrototype { arity, lib: lib.clone() },
            );
        }
        Ok(())
    }

    fn count_params(&mut self) -> CompileResult<i64> {
        let mut count = 0;
        let s = self.next()?;
        if s.token == Token::RParen {
            return Ok(0);
        }
        self.unget(s);
        loop {
            let (_, _) = self.expect_ident()?;
            count += 1;
            let s = self.next()?;
            match s.token {
                Token::Comma => continue,
                Token::RParen => break,
                _ => return Err(self.error(s.line, CompileErrorKind::Expected(")".into()))),
            }
        }
        Ok(count)
    }

    /// `IDENT "(" params ")" (";" | block)` — function prototype/definition,
    /// or `IDENT ":" "=" expr ";"` — a top-level global declaration.
    fn parse_top_ident_decl(&mut self) -> CompileResult<()> {
        let (name, line) = self.expect_ident()?;
        let s = self.next()?;
        match s.token {
            Token::LParen => {
                let params = self.parse_param_names()?;
                let s2 = self.next()?;
                if s2.token == Token::Semicolon {
                    self.declare(&name, line, IdentClass::FunctionPrototype { arity: params.len() as i64 })?;
                } else {
                    self.unget(s2);
                    self.compile_function(&name, line, &params)?;
                }
            }
            Token::ColonEq => {
                self.compile_global(&name, line, false)?;
            }
            _ => return Err(self.error(line, CompileErrorKind::Expected("( or :=".into()))),
        }
        Ok(())
    }

    fn parse_param_names(&mut self) -> CompileResult<Vec<String>> {
        let mut names = Vec::new();
        let s = self.next()?;
        if s.token == Token::RParen {
            return Ok(names);
        }
        self.unget(s);
        loop {
            let (name, _) = self.expect_ident()?;
            names.push(name);
            let s = self.next()?;
            match s.token {
                Token::Comma => continue,
                Token::RParen => break,
                other => return Err(self.error(0, CompileErrorKind::Expected(format!("{:?}", other)))),
            }
        }
        Ok(names)
    }

    fn declare(&mut self, name: &str, line: i64, class: IdentClass) -> CompileResult<()> {
        match self.symbols.get(name) {
            None => {}
            Some(IdentClass::FunctionPrototype { arity }) => {
                if let IdentClass::Function { arity: new_arity, .. } = &class {
                    if new_arity != arity {
                        return Err(self.error(
                            line,
                            CompileErrorKind::Arity(name.to_string(), *new_arity as usize, *arity as usize),
                        ));
                    }
                } else {
                    return Err(self.error(line, CompileErrorKind::Redefinition(name.to_string())));
                }
            }
            Some(_) => return Err(self.error(line, CompileErrorKind::Redefinition(name.to_string()))),
        }
        if matches!(name, "true" | "false" | "null") {
            return Err(self.error(line, CompileErrorKind::ReservedRebind(name.to_string())));
        }
        self.symbols.insert(name.to_string(), class);
        Ok(())
    }

    fn compile_function(&mut self, name: &str, line: i64, params: &[String]) -> CompileResult<()> {
        let label = if name == "Main" { "Main".to_string() } else { self.next_label(name) };
        self.declare(
            name,
            line,
            IdentClass::Function { label: label.clone(), arity: params.len() as i64 },
        )?;
        self.stubs.push(Stub::Label(label));
        self.scopes.push(Scope { names: Vec::new() });
        self.local_slot = 0;
        for p in params {
            self.symbols.insert(p.clone(), IdentClass::LocalVar { slot: self.local_slot });
            self.scopes.last_mut().unwrap().names.push(p.clone());
            self.local_slot += 1;
        }
        self.parse_block()?;
        // Fall-through return for a function without an explicit `ret`.
        // By this point the block's own closing scope-pop has already
        // balanced the stack back to the frame pointer, so a plain `Ret`
        // (no flush) is correct here - matching `CC_Function`'s
        // `Psh null; Sav; Ret` fallthrough emission.
        self.stubs.push(Stub::op_literal("fn", line, Opcode::Psh, Literal::Null));
        self.stubs.push(Stub::op("fn", line, Opcode::Sav));
        self.stubs.push(Stub::op("fn", line, Opcode::Ret));
        let params_scope = self.scopes.pop().unwrap();
        for p in params_scope.names {
            self.symbols.remove(&p);
        }
        Ok(())
    }

    /// Shared by the bare `IDENT := expr;` top-level global and the
    /// top-level `const IDENT := expr;` form (`CC_Global` in `roman2.c`,
    /// parameterized the same way over its `constant` argument). Emits a
    /// `__ginit_*` one-time initializer that stores the expression's value
    /// into the global's slot and returns — `!start:`'s prologue calls
    /// every `__ginit_*` before `Main`.
    fn compile_global(&mut self, name: &str, line: i64, konst: bool) -> CompileResult<()> {
        let slot = self.global_slot;
        self.global_slot += 1;
        self.declare(name, line, IdentClass::GlobalVar { slot })?;
        let init_label = format!("__ginit_{name}");
        self.global_inits.push(name.to_string());
        self.stubs.push(Stub::Label(init_label));
        self.stubs.push(Stub::op_number("g", line, Opcode::Glb, slot));
        self.parse_expr()?;
        self.stubs.push(Stub::op("g", line, Opcode::Mov));
        // `Mov` copies the expr's payload into the slot's own Value and
        // leaves that Value (not the transient expr result) on top, so
        // `Con` must come after `Mov` to mark the persisted global itself.
        if konst {
            self.stubs.push(Stub::op("g", line, Opcode::Con));
        }
        self.stubs.push(Stub::op_number("g", line, Opcode::Pop, 1));
        // Stack is back at the frame pointer after that `Pop`, so - same as
        // a function's fall-through - a plain `Ret` (no flush) is correct.
        self.stubs.push(Stub::op_literal("g", line, Opcode::Psh, Literal::Null));
        self.stubs.push(Stub::op("g", line, Opcode::Sav));
        self.stubs.push(Stub::op("g", line, Opcode::Ret));
        self.expect(&Token::Semicolon)?;
        Ok(())
    }

    fn parse_block(&mut self) -> CompileResult<()> {
        self.expect(&Token::LBrace)?;
        self.scopes.push(Scope { names: Vec::new() });
        let slot_base = self.local_slot;
        loop {
            let s = self.next()?;
            if s.token == Token::RBrace {
                break;
            }
            self.unget(s);
            self.parse_statement()?;
        }
        let scope = self.scopes.pop().unwrap();
        for name in scope.names {
            self.symbols.remove(&name);
            self.stubs.push(Stub::op_number(&self.module.clone(), 0, Opcode::Pop, 1));
        }
        // Restore the slot counter so sibling blocks (distinct `if`/`elif`
        // bodies, successive loop bodies) reuse the same stack offsets a
        // popped predecessor just vacated, rather than drifting ahead of
        // the actual runtime frame depth.
        self.local_slot = slot_base;
        Ok(())
    }

    fn parse_statement(&mut self) -> CompileResult<()> {
        let s = self.next()?;
        match &s.token {
            Token::Ident(kw) if kw == "if" => self.parse_if(),
            Token::Ident(kw) if kw == "while" => self.parse_while(),
            Token::Ident(kw) if kw == "for" => self.parse_for(),
            Token::Ident(kw) if kw == "foreach" => self.parse_foreach(),
            Token::Ident(kw) if kw == "ret" => {
                let s2 = self.next()?;
                if s2.token == Token::Semicolon {
                    self.stubs.push(Stub::op_literal(&self.module.clone(), s.line, Opcode::Psh, Literal::Null));
                } else {
                    self.unget(s2);
                    self.parse_expr()?;
                    self.expect(&Token::Semicolon)?;
                }
                // `Fls`, not `Ret`: an early `ret` inside a nested block
                // skips that block's own compile-time `Pop` emission, so the
                // stack needs a runtime flush down to the frame pointer
                // rather than the assumption (valid only at fall-through)
                // that it's already balanced (`CC_Ret`'s `Sav;Fls`).
                self.stubs.push(Stub::op(&self.module.clone(), s.line, Opcode::Sav));
                self.stubs.push(Stub::op(&self.module.clone(), s.line, Opcode::Fls));
                Ok(())
            }
            Token::Ident(kw) if kw == "continue" => {
                self.expect(&Token::Semicolon)?;
                let (_, tail, depth) = self
                    .loop_labels
                    .last()
                    .cloned()
                    .ok_or_else(|| self.error(s.line, CompileErrorKind::Expected("loop".into())))?;
                self.emit_unwind_to(depth);
                self.stubs.push(Stub::op_label(&self.module.clone(), s.line, Opcode::Jmp, tail));
                Ok(())
            }
            Token::Ident(kw) if kw == "break" => {
                self.expect(&Token::Semicolon)?;
                let (head, _, depth) = self
                    .loop_labels
                    .last()
                    .cloned()
                    .ok_or_else(|| self.error(s.line, CompileErrorKind::Expected("loop".into())))?;
                self.emit_unwind_to(depth);
                self.stubs.push(Stub::op_label(&self.module.clone(), s.line, Opcode::Jmp, head));
                Ok(())
            }
            Token::Ident(kw) if kw == "const" => {
                let (name, line) = self.expect_ident()?;
                self.expect(&Token::ColonEq)?;
                self.parse_expr()?;
                self.stubs.push(Stub::op("const", line, Opcode::Con));
                self.declare_local(&name, line)?;
                self.expect(&Token::Semicolon)?;
                Ok(())
            }
            Token::Ident(name) => {
                let name = name.clone();
                let peek = self.next()?;
                // `:=` always introduces a fresh binding (`declare_local`
                // itself rejects redefinition); `=` and the compound-assign
                // forms mutate an already-declared local/global in place.
                if peek.token == Token::ColonEq {
                    self.parse_expr()?;
                    self.declare_local(&name, s.line)?;
                    self.expect(&Token::Semicolon)?;
                    return Ok(());
                }
                let compound = match &peek.token {
                    Token::Assign => None,
                    Token::PlusEq => Some(Opcode::Add),
                    Token::MinusEq => Some(Opcode::Sub),
                    Token::StarEq => Some(Opcode::Mul),
                    Token::SlashEq => Some(Opcode::Div),
                    Token::PercentEq => Some(Opcode::Mod),
                    Token::StarStarEq => Some(Opcode::Pow),
                    Token::SlashSlashEq => Some(Opcode::Idv),
                    Token::PercentPercentEq => Some(Opcode::Imd),
                    _ => {
                        self.unget(peek);
                        self.unget(s);
                        self.parse_expr()?;
                        self.expect(&Token::Semicolon)?;
                        self.stubs.push(Stub::op_number(&self.module.clone(), 0, Opcode::Pop, 1));
                        return Ok(());
                    }
                };
                match self.symbols.get(&name).cloned() {
                    Some(IdentClass::LocalVar { slot }) => {
                        self.stubs.push(Stub::op_number(&self.module.clone(), s.line, Opcode::Loc, slot));
                        if let Some(op) = compound {
                            self.stubs.push(Stub::op_number(&self.module.clone(), s.line, Opcode::Loc, slot));
                            self.parse_expr()?;
                            self.stubs.push(Stub::op(&self.module.clone(), s.line, op));
                        } else {
                            self.parse_expr()?;
                        }
                        self.stubs.push(Stub::op(&self.module.clone(), s.line, Opcode::Mov));
                    }
                    Some(IdentClass::GlobalVar { slot }) => {
                        self.stubs.push(Stub::op_number(&self.module.clone(), s.line, Opcode::Glb, slot));
                        if let Some(op) = compound {
                            self.stubs.push(Stub::op_number(&self.module.clone(), s.line, Opcode::Glb, slot));
                            self.parse_expr()?;
                            self.stubs.push(Stub::op(&self.module.clone(), s.line, op));
                        } else {
                            self.parse_expr()?;
                        }
                        self.stubs.push(Stub::op(&self.module.clone(), s.line, Opcode::Mov));
                    }
                    _ => return Err(self.error(s.line, CompileErrorKind::UndefinedIdent(name))),
                }
                self.expect(&Token::Semicolon)?;
                self.stubs.push(Stub::op_number(&self.module.clone(), s.line, Opcode::Pop, 1));
                Ok(())
            }
            _ => {
                self.unget(s.clone());
                self.parse_expr()?;
                self.expect(&Token::Semicolon)?;
                self.stubs.push(Stub::op_number(&self.module.clone(), s.line, Opcode::Pop, 1));
                Ok(())
            }
        }
    }

    fn emit_unwind_to(&mut self, depth: usize) {
        for scope in self.scopes[depth..].iter().rev() {
            for _ in &scope.names {
                self.stubs.push(Stub::op_number("unwind", 0, Opcode::Pop, 1));
            }
        }
    }

    fn declare_local(&mut self, name: &str, line: i64) -> CompileResult<()> {
        let slot = self.local_slot;
        self.local_slot += 1;
        self.declare(name, line, IdentClass::LocalVar { slot })?;
        self.scopes.last_mut().unwrap().names.push(name.to_string());
        // Every new binding is a point where the cycle collector may need
        // to run (mirrors `CC_AssignLocal` pairing each local's value with
        // a `Gar` check).
        self.stubs.push(Stub::op(&self.module.clone(), line, Opcode::Gar));
        Ok(())
    }

    fn parse_if(&mut self) -> CompileResult<()> {
        self.expect(&Token::LParen)?;
        self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let end_label = self.next_label("ifend");
        let mut next_label = self.next_label("elif");
        self.stubs.push(Stub::op_label("if", 0, Opcode::Brf, next_label.clone()));
        self.parse_block()?;
        self.stubs.push(Stub::op_label("if", 0, Opcode::Jmp, end_label.clone()));
        loop {
            self.stubs.push(Stub::Label(next_label.clone()));
            let s = self.next()?;
            if let Token::Ident(kw) = &s.token {
                if kw == "elif" {
                    self.expect(&Token::LParen)?;
                    self.parse_expr()?;
                    self.expect(&Token::RParen)?;
                    next_label = self.next_label("elif");
                    self.stubs.push(Stub::op_label("if", 0, Opcode::Brf, next_label.clone()));
                    self.parse_block()?;
                    self.stubs.push(Stub::op_label("if", 0, Opcode::Jmp, end_label.clone()));
                    continue;
                }
                if kw == "else" {
                    self.parse_block()?;
                    break;
                }
            }
            self.unget(s);
            break;
        }
        self.stubs.push(Stub::Label(end_label));
        Ok(())
    }

    fn parse_while(&mut self) -> CompileResult<()> {
        let head = self.next_label("whead");
        let tail = self.next_label("wtail");
        self.stubs.push(Stub::Label(head.clone()));
        self.expect(&Token::LParen)?;
        self.parse_expr()?;
        self.expect(&Token::RParen)?;
        self.stubs.push(Stub::op_label("while", 0, Opcode::Brf, tail.clone()));
        let depth = self.scopes.len();
        self.loop_labels.push((tail.clone(), head.clone(), depth));
        self.parse_block()?;
        self.loop_labels.pop();
        self.stubs.push(Stub::op_label("while", 0, Opcode::Jmp, head));
        self.stubs.push(Stub::Label(tail));
        Ok(())
    }

    fn parse_for(&mut self) -> CompileResult<()> {
        self.expect(&Token::LParen)?;
        let (name, line) = self.expect_ident()?;
        self.expect(&Token::ColonEq)?;
        self.parse_expr()?;
        self.scopes.push(Scope { names: Vec::new() });
        self.declare_local(&name, line)?;
        self.expect(&Token::Semicolon)?;
        let head = self.next_label("fhead");
        let tail = self.next_label("ftail");
        let step_label = self.next_label("fstep");
        self.stubs.push(Stub::Label(head.clone()));
        self.parse_expr()?;
        self.stubs.push(Stub::op_label("for", 0, Opcode::Brf, tail.clone()));
        self.expect(&Token::Semicolon)?;
        let body_start = self.stubs.len();
        // step expr is parsed now but emitted after the body (classic
        // three-clause desugaring via stub reordering).
        let step_stubs_start = self.stubs.len();
        self.parse_expr()?;
        self.stubs.push(Stub::op_number("for", 0, Opcode::Pop, 1));
        self.expect(&Token::RParen)?;
        let step_stubs: Vec<Stub> = self.stubs.split_off(step_stubs_start);
        let _ = body_start;
        let depth = self.scopes.len();
        self.loop_labels.push((tail.clone(), step_label.clone(), depth));
        self.parse_block()?;
        self.loop_labels.pop();
        self.stubs.push(Stub::Label(step_label));
        self.stubs.extend(step_stubs);
        self.stubs.push(Stub::op_label("for", 0, Opcode::Jmp, head));
        self.stubs.push(Stub::Label(tail));
        let scope = self.scopes.pop().unwrap();
        for name in scope.names {
            self.symbols.remove(&name);
            self.stubs.push(Stub::op_number("for", 0, Opcode::Pop, 1));
        }
        Ok(())
    }

    fn parse_foreach(&mut self) -> CompileResult<()> {
        self.expect(&Token::LParen)?;
        let (name, line) = self.expect_ident()?;
        self.expect(&Token::Colon)?;
        self.parse_expr()?;
        self.expect(&Token::RParen)?;
        // Desugar: foreach(x : xs) { body }  =>
        //   i := 0; while(i < Len(xs)) { x := Get(xs, i); body; i += 1; }
        self.scopes.push(Scope { names: Vec::new() });
        self.declare_local("__foreach_src", line)?;
        self.stubs.push(Stub::op_literal("foreach", line, Opcode::Psh, Literal::Number("0".into())));
        self.declare_local("__foreach_idx", line)?;
        let head = self.next_label("fehead");
        let tail = self.next_label("fetail");
        self.stubs.push(Stub::Label(head.clone()));
        self.emit_local_push("__foreach_idx");
        self.emit_local_push("__foreach_src");
        self.stubs.push(Stub::op("foreach", line, Opcode::Len));
        self.stubs.push(Stub::op("foreach", line, Opcode::Lst));
        self.stubs.push(Stub::op_label("foreach", line, Opcode::Brf, tail.clone()));
        self.scopes.push(Scope { names: Vec::new() });
        self.emit_local_push("__foreach_src");
        self.emit_local_push("__foreach_idx");
        self.stubs.push(Stub::op("foreach", line, Opcode::Get));
        self.declare_local(&name, line)?;
        self.parse_block()?;
        self.emit_local_push("__foreach_idx");
        self.emit_local_push("__foreach_idx");
        self.stubs.push(Stub::op_literal("foreach", line, Opcode::Psh, Literal::Number("1".into())));
        self.stubs.push(Stub::op("foreach", line, Opcode::Add));
        self.stubs.push(Stub::op("foreach", line, Opcode::Mov));
        self.stubs.push(Stub::op_number("foreach", line, Opcode::Pop, 1));
        let inner = self.scopes.pop().unwrap();
        self.symbols.remove(&inner.names[0]);
        self.stubs.push(Stub::op_label("foreach", line, Opcode::Jmp, head));
        self.stubs.push(Stub::Label(tail));
        let scope = self.scopes.pop().unwrap();
        for n in scope.names {
            self.symbols.remove(&n);
            self.stubs.push(Stub::op_number("foreach", line, Opcode::Pop, 1));
        }
        Ok(())
    }

    fn emit_local_push(&mut self, name: &str) {
        if let Some(IdentClass::LocalVar { slot }) = self.symbols.get(name).cloned() {
            self.stubs.push(Stub::op_number("local", 0, Opcode::Loc, slot));
        }
    }

    // --- Expressions -----------------------------------------------------

    fn parse_expr(&mut self) -> CompileResult<()> {
        self.parse_term()?;
        loop {
            let s = self.next()?;
            let op = match &s.token {
                Token::Plus => Some(Opcode::Add),
                Token::Minus => Some(Opcode::Sub),
                Token::EqEq => Some(Opcode::Eql),
                Token::NotEq => Some(Opcode::Neq),
                Token::Lt => Some(Opcode::Lst),
                Token::Gt => Some(Opcode::Grt),
                Token::Lte => Some(Opcode::Lte),
                Token::Gte => Some(Opcode::Gte),
                Token::AndAnd => Some(Opcode::And),
                _ => None,
            };
            if let Some(op) = op {
                self.parse_term()?;
                self.stubs.push(Stub::op(&self.module.clone(), s.line, op));
                continue;
            }
            match &s.token {
                Token::Assign | Token::PlusEq | Token::MinusEq => {
                    return Err(self.error(s.line, CompileErrorKind::NotAValue(
                        "assignment target must be an identifier or indexed expression".into(),
                    )));
                }
                _ => {
                    self.unget(s);
                    break;
                }
            }
        }
        Ok(())
    }

    fn parse_term(&mut self) -> CompileResult<()> {
        self.parse_factor()?;
        loop {
            let s = self.next()?;
            let op = match &s.token {
                Token::Star => Some(Opcode::Mul),
                Token::Slash => Some(Opcode::Div),
                Token::Percent => Some(Opcode::Mod),
                Token::StarStar => Some(Opcode::Pow),
                Token::SlashSlash => Some(Opcode::Idv),
                Token::PercentPercent => Some(Opcode::Imd),
                Token::OrOr => Some(Opcode::Lor),
                Token::Question => Some(Opcode::Mem),
                _ => None,
            };
            if let Some(op) = op {
                self.parse_factor()?;
                self.stubs.push(Stub::op(&self.module.clone(), s.line, op));
                continue;
            }
            self.unget(s);
            break;
        }
        Ok(())
    }

    fn parse_factor(&mut self) -> CompileResult<()> {
        let s = self.next()?;
        match s.token {
            Token::Bang => {
                self.parse_factor()?;
                self.stubs.push(Stub::op("fac", s.line, Opcode::Not));
            }
            Token::Minus => {
                self.parse_factor()?;
                self.stubs.push(Stub::op_literal("fac", s.line, Opcode::Psh, Literal::Number("-1".into())));
                self.stubs.push(Stub::op("fac", s.line, Opcode::Mul));
            }
            Token::Plus => {
                self.parse_factor()?;
            }
            Token::Amp => {
                let peek = self.next()?;
                let is_function_name = matches!(
                    &peek.token,
                    Token::Ident(n) if matches!(
                        self.symbols.get(n),
                        Some(IdentClass::Function { .. }) | Some(IdentClass::FunctionPrototype { .. })
                    )
                );
                if is_function_name {
                    let (name, line) = match peek.token {
                        Token::Ident(n) => (n, peek.line),
                        _ => unreachable!(),
                    };
                    self.push_function_ref(&name, line)?;
                } else {
                    self.unget(peek);
                    self.parse_factor()?;
                    self.stubs.push(Stub::op("fac", s.line, Opcode::Ptr));
                }
            }
            Token::Number(text) => {
                self.stubs.push(Stub::op_literal("fac", s.line, Opcode::Psh, Literal::Number(text)));
            }
            Token::String(text) => {
                self.stubs.push(Stub::op_literal("fac", s.line, Opcode::Psh, Literal::Str(text)));
            }
            Token::LParen => {
                self.parse_expr()?;
                self.expect(&Token::RParen)?;
            }
            Token::LBracket => {
                self.parse_queue_literal()?;
            }
            Token::LBrace => {
                self.parse_map_literal()?;
            }
            Token::Ident(name) => {
                self.parse_ident_factor(&name, s.line)?;
            }
            other => {
                return Err(self.error(s.line, CompileErrorKind::Expected(format!("{:?}", other))));
            }
        }
        self.parse_postfix()
    }

    fn push_function_ref(&mut self, name: &str, line: i64) -> CompileResult<()> {
        match self.symbols.get(name).cloned() {
            Some(IdentClass::Function { label, arity }) => {
                self.stubs.push(Stub::op_literal(
                    "ref",
                    line,
                    Opcode::Psh,
                    Literal::FunctionRef { name: name.to_string(), arity, label },
                ));
                Ok(())
            }
            _ => Err(self.error(line, CompileErrorKind::NotCallable(name.to_string()))),
        }
    }

    fn parse_ident_factor(&mut self, name: &str, line: i64) -> CompileResult<()> {
        if name == "true" {
            self.stubs.push(Stub::op_literal(&self.module.clone(), line, Opcode::Psh, Literal::Bool(true)));
            return Ok(());
        }
        if name == "false" {
            self.stubs.push(Stub::op_literal(&self.module.clone(), line, Opcode::Psh, Literal::Bool(false)));
            return Ok(());
        }
        if name == "null" {
            self.stubs.push(Stub::op_literal(&self.module.clone(), line, Opcode::Psh, Literal::Null));
            return Ok(());
        }
        if let Some(kw) = self.keywords.get(name) {
            let opcode = kw.opcode;
            let arity = kw.arity;
            self.expect(&Token::LParen)?;
            self.parse_args(arity)?;
            self.stubs.push(Stub::op(&self.module.clone(), line, opcode));
            return Ok(());
        }
        match self.symbols.get(name).cloned() {
            Some(IdentClass::LocalVar { slot }) => {
                self.stubs.push(Stub::op_number(&self.module.clone(), line, Opcode::Loc, slot));
                Ok(())
            }
            Some(IdentClass::GlobalVar { slot }) => {
                self.stubs.push(Stub::op_number(&self.module.clone(), line, Opcode::Glb, slot));
                Ok(())
            }
            Some(IdentClass::Function { label, arity }) => {
                self.expect(&Token::LParen)?;
                self.parse_args(arity)?;
                self.stubs.push(Stub::op_number(&self.module.clone(), line, Opcode::Spd, arity));
                self.stubs.push(Stub::op_label(&self.module.clone(), line, Opcode::Cal, label));
                self.stubs.push(Stub::op("call", line, Opcode::Lod));
                Ok(())
            }
            Some(IdentClass::FunctionPrototype { arity }) => {
                self.expect(&Token::LParen)?;
                self.parse_args(arity)?;
                self.stubs.push(Stub::op_number(&self.module.clone(), line, Opcode::Spd, arity));
                self.stubs.push(Stub::op_label(&self.module.clone(), line, Opcode::Cal, name.to_string()));
                self.stubs.push(Stub::op("call", line, Opcode::Lod));
                Ok(())
            }
            Some(IdentClass::NativeFunctionPrototype { arity, lib }) => {
                self.expect(&Token::LParen)?;
                self.parse_args(arity)?;
                self.stubs.push(Stub::op_literal(
                    "dll",
                    line,
                    Opcode::Psh,
                    Literal::Str(lib.clone()),
                ));
                self.stubs.push(Stub::op_literal(
                    "dll",
                    line,
                    Opcode::Psh,
                    Literal::Str(name.to_string()),
                ));
                self.stubs.push(Stub::op_literal(
                    "dll",
                    line,
                    Opcode::Psh,
                    Literal::Number(arity.to_string()),
                ));
                self.stubs.push(Stub::op("dll", line, Opcode::Dll));
                Ok(())
            }
            None => Err(self.error(line, CompileErrorKind::UndefinedIdent(name.to_string()))),
        }
    }

    fn parse_args(&mut self, expected: i64) -> CompileResult<()> {
        let mut count = 0;
        let s = self.next()?;
        if s.token != Token::RParen {
            self.unget(s);
            loop {
                self.parse_expr()?;
                count += 1;
                let s = self.next()?;
                match s.token {
                    Token::Comma => continue,
                    Token::RParen => break,
                    other => return Err(self.error(0, CompileErrorKind::Expected(format!("{:?}", other)))),
                }
            }
        }
        if count != expected {
            return Err(self.error(0, CompileErrorKind::Arity(String::new(), count as usize, expected as usize)));
        }
        Ok(())
    }

    fn parse_queue_literal(&mut self) -> CompileResult<()> {
        self.stubs.push(Stub::op_literal("lit", 0, Opcode::Psh, Literal::EmptyQueue));
        let s = self.next()?;
        if s.token == Token::RBracket {
            return Ok(());
        }
        self.unget(s);
        loop {
            self.parse_expr()?;
            self.stubs.push(Stub::op("lit", 0, Opcode::Psb));
            let s = self.next()?;
            match s.token {
                Token::Comma => continue,
                Token::RBracket => break,
                other => return Err(self.error(0, CompileErrorKind::Expected(format!("{:?}", other)))),
            }
        }
        Ok(())
    }

    /// `{.a: 1, .b: 2}` map-literal sugar lowers to a sequence of `Ins`
    /// calls against a fresh empty map (spec.md's `CC_Resolve`-equivalent
    /// handling of a trailing `:=`).
    fn parse_map_literal(&mut self) -> CompileResult<()> {
        self.stubs.push(Stub::op_literal("lit", 0, Opcode::Psh, Literal::EmptyMap));
        let s = self.next()?;
        if s.token == Token::RBrace {
            return Ok(());
        }
        self.unget(s);
        loop {
            self.expect(&Token::Dot)?;
            let (key, line) = self.expect_ident()?;
            self.expect(&Token::Colon)?;
            self.stubs.push(Stub::op_literal("lit", line, Opcode::Psh, Literal::Str(key)));
            self.parse_expr()?;
            // stack: [.., map, key, value] — matches the (container, key,
            // value) order `Ins` also sees from indexed assignment.
            self.stubs.push(Stub::op("lit", line, Opcode::Ins));
            let s = self.next()?;
            match s.token {
                Token::Comma => continue,
                Token::RBrace => break,
                other => return Err(self.error(line, CompileErrorKind::Expected(format!("{:?}", other)))),
            }
        }
        Ok(())
    }

    fn parse_postfix(&mut self) -> CompileResult<()> {
        loop {
            let s = self.next()?;
            match s.token {
                Token::LBracket => {
                    self.parse_expr()?;
                    let s2 = self.next()?;
                    if s2.token == Token::Colon {
                        self.parse_expr()?;
                        self.expect(&Token::RBracket)?;
                        self.stubs.push(Stub::op("post", s.line, Opcode::Slc));
                    } else {
                        self.unget(s2);
                        self.expect(&Token::RBracket)?;
                        let s3 = self.next()?;
                        if s3.token == Token::ColonEq {
                            self.parse_expr()?;
                            self.stubs.push(Stub::op("post", s.line, Opcode::Ins));
                        } else {
                            self.unget(s3);
                            self.stubs.push(Stub::op("post", s.line, Opcode::Get));
                        }
                    }
                }
                Token::Dot => {
                    let (field, line) = self.expect_ident()?;
                    self.stubs.push(Stub::op_literal("post", line, Opcode::Psh, Literal::Str(field)));
                    self.stubs.push(Stub::op("post", line, Opcode::Get));
                }
                Token::At => {
                    self.stubs.push(Stub::op("post", s.line, Opcode::Drf));
                }
                _ => {
                    self.unget(s);
                    break;
                }
            }
        }
        Ok(())
    }
}

impl Default for Compiler {
    fn default() -> Compiler {
        Compiler::new()
    }
}
