//! The immutable program: constant pools, match tables, the native-symbol
//! reference table, and handlers.
//!
//! A `Program` is assembled by the compiler (or loaded from an image),
//! linked against a [`NativeRegistry`](crate::natives::NativeRegistry), and
//! validated once.  After that it is read-only and safe to share across
//! threads; every Runner borrows it for the duration of one request.

use std::net::IpAddr;

use thiserror::Error;

use crate::bytecode::{Instruction, Opcode};
use crate::matching::{MatchCase, MatchTable};
use crate::natives::{NativeKind, NativeRegistry};
use crate::value::{Cidr, FlowNumber, FlowType};

/// A compiled regular expression plus its source pattern (for `R2S` and the
/// on-disk image).
#[derive(Debug, Clone)]
pub struct RegexValue {
    pattern: String,
    compiled: regex::bytes::Regex,
}

impl RegexValue {
    pub fn new(pattern: &str) -> Result<Self, ProgramError> {
        let compiled = regex::bytes::Regex::new(pattern)
            .map_err(|source| ProgramError::BadRegex {
                pattern: pattern.to_owned(),
                source,
            })?;
        Ok(Self {
            pattern: pattern.to_owned(),
            compiled,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn compiled(&self) -> &regex::bytes::Regex {
        &self.compiled
    }
}

impl PartialEq for RegexValue {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

/// Entry in the program's native-symbol reference table.  `target` is the
/// dense registry id filled in by [`Program::link`].
#[derive(Debug, Clone, PartialEq)]
pub struct NativeRef {
    pub kind: NativeKind,
    pub name: String,
    pub return_type: FlowType,
    pub target: Option<u32>,
}

/// A named executable unit: its register budget and linear code vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    pub name: String,
    pub register_count: u16,
    pub code: Vec<Instruction>,
}

/// The program container.  Append-only during assembly; immutable afterwards.
#[derive(Debug, Default)]
pub struct Program {
    numbers: Vec<FlowNumber>,
    strings: Vec<Box<[u8]>>,
    ipaddrs: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
    regexes: Vec<RegexValue>,
    matches: Vec<MatchTable>,
    natives: Vec<NativeRef>,
    handlers: Vec<Handler>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- assembly ------------------------------------------------------

    pub fn add_number(&mut self, value: FlowNumber) -> u16 {
        intern(&mut self.numbers, value)
    }

    pub fn add_string(&mut self, bytes: &[u8]) -> u16 {
        if let Some(index) = self.strings.iter().position(|s| &s[..] == bytes) {
            return index as u16;
        }
        self.strings.push(bytes.into());
        (self.strings.len() - 1) as u16
    }

    pub fn add_ipaddr(&mut self, addr: IpAddr) -> u16 {
        intern(&mut self.ipaddrs, addr)
    }

    pub fn add_cidr(&mut self, cidr: Cidr) -> u16 {
        intern(&mut self.cidrs, cidr)
    }

    /// Intern a regex by pattern text, compiling it on first sight.
    pub fn add_regex(&mut self, pattern: &str) -> Result<u16, ProgramError> {
        if let Some(index) = self.regexes.iter().position(|r| r.pattern() == pattern) {
            return Ok(index as u16);
        }
        self.regexes.push(RegexValue::new(pattern)?);
        Ok((self.regexes.len() - 1) as u16)
    }

    /// Match tables are not deduplicated; each `match` statement owns one.
    pub fn add_match(&mut self, table: MatchTable) -> u16 {
        self.matches.push(table);
        (self.matches.len() - 1) as u16
    }

    pub(crate) fn patch_match(&mut self, index: u16, cases: Vec<MatchCase>, else_target: u32) {
        let table = &mut self.matches[index as usize];
        table.cases = cases;
        table.else_target = else_target;
    }

    /// Append a native-symbol reference, deduplicated by kind and name.
    pub fn add_native(
        &mut self,
        kind: NativeKind,
        name: &str,
        return_type: FlowType,
    ) -> Result<u16, ProgramError> {
        if let Some(index) = self
            .natives
            .iter()
            .position(|n| n.kind == kind && n.name == name)
        {
            if self.natives[index].return_type != return_type {
                return Err(ProgramError::NativeTypeConflict {
                    name: name.to_owned(),
                    first: self.natives[index].return_type,
                    second: return_type,
                });
            }
            return Ok(index as u16);
        }
        self.natives.push(NativeRef {
            kind,
            name: name.to_owned(),
            return_type,
            target: None,
        });
        Ok((self.natives.len() - 1) as u16)
    }

    pub(crate) fn add_native_ref(&mut self, native: NativeRef) {
        self.natives.push(native);
    }

    // Raw appenders for the image loader: pool order must survive verbatim,
    // so no deduplication happens here.

    pub(crate) fn push_number_raw(&mut self, value: FlowNumber) {
        self.numbers.push(value);
    }

    pub(crate) fn push_string_raw(&mut self, bytes: Box<[u8]>) {
        self.strings.push(bytes);
    }

    pub(crate) fn push_ipaddr_raw(&mut self, addr: IpAddr) {
        self.ipaddrs.push(addr);
    }

    pub(crate) fn push_cidr_raw(&mut self, cidr: Cidr) {
        self.cidrs.push(cidr);
    }

    pub(crate) fn push_regex_raw(&mut self, regex: RegexValue) {
        self.regexes.push(regex);
    }

    pub fn create_handler(&mut self, name: &str, register_count: u16, code: Vec<Instruction>) -> u16 {
        self.handlers.push(Handler {
            name: name.to_owned(),
            register_count,
            code,
        });
        (self.handlers.len() - 1) as u16
    }

    /// Resolve every native reference against the host registry.
    pub fn link(&mut self, registry: &NativeRegistry) -> Result<(), ProgramError> {
        for native in &mut self.natives {
            let id = registry
                .find(&native.name)
                .ok_or_else(|| ProgramError::UnknownNative(native.name.clone()))?;
            let callback = registry.get(id).expect("id came from find");
            if callback.kind() != native.kind {
                return Err(ProgramError::NativeKindMismatch {
                    name: native.name.clone(),
                    expected: native.kind,
                    found: callback.kind(),
                });
            }
            if callback.return_type() != native.return_type {
                return Err(ProgramError::NativeTypeConflict {
                    name: native.name.clone(),
                    first: native.return_type,
                    second: callback.return_type(),
                });
            }
            native.target = Some(id as u32);
        }
        Ok(())
    }

    // ---- lookup --------------------------------------------------------

    pub fn number(&self, index: usize) -> Option<FlowNumber> {
        self.numbers.get(index).copied()
    }

    pub fn string(&self, index: usize) -> Option<&[u8]> {
        self.strings.get(index).map(|s| &s[..])
    }

    pub fn ipaddr(&self, index: usize) -> Option<IpAddr> {
        self.ipaddrs.get(index).copied()
    }

    pub fn cidr(&self, index: usize) -> Option<&Cidr> {
        self.cidrs.get(index)
    }

    pub fn regex(&self, index: usize) -> Option<&RegexValue> {
        self.regexes.get(index)
    }

    pub fn match_table(&self, index: usize) -> Option<&MatchTable> {
        self.matches.get(index)
    }

    pub fn native(&self, index: usize) -> Option<&NativeRef> {
        self.natives.get(index)
    }

    pub fn numbers(&self) -> &[FlowNumber] {
        &self.numbers
    }

    pub fn strings(&self) -> &[Box<[u8]>] {
        &self.strings
    }

    pub fn ipaddrs(&self) -> &[IpAddr] {
        &self.ipaddrs
    }

    pub fn cidrs(&self) -> &[Cidr] {
        &self.cidrs
    }

    pub fn regexes(&self) -> &[RegexValue] {
        &self.regexes
    }

    pub fn matches(&self) -> &[MatchTable] {
        &self.matches
    }

    pub fn natives(&self) -> &[NativeRef] {
        &self.natives
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn handler(&self, index: usize) -> Option<&Handler> {
        self.handlers.get(index)
    }

    pub fn find_handler(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name == name)
    }

    // ---- validation ----------------------------------------------------

    /// Enforce the structural invariants: every branch and match target in
    /// range, every pool and native index in bounds, every register operand
    /// (including implicit pairs and call windows) within the handler's
    /// register budget, and every native reference linked.
    pub fn validate(&self) -> Result<(), ProgramError> {
        for (handler_index, handler) in self.handlers.iter().enumerate() {
            self.validate_handler(handler_index, handler)?;
        }
        for (index, table) in self.matches.iter().enumerate() {
            let pool_len = match table.op {
                crate::matching::MatchOp::Regex => self.regexes.len(),
                _ => self.strings.len(),
            };
            for case in &table.cases {
                if case.literal as usize >= pool_len {
                    return Err(ProgramError::MatchLiteralOutOfRange {
                        table: index,
                        literal: case.literal,
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_handler(&self, handler_index: usize, handler: &Handler) -> Result<(), ProgramError> {
        let code_len = handler.code.len();
        let fail = |pc: usize, reason: InvalidInstruction| {
            Err(ProgramError::InvalidInstruction {
                handler: handler.name.clone(),
                pc,
                reason,
            })
        };
        let reg = |pc: usize, r: u32| {
            if r < u32::from(handler.register_count) {
                Ok(())
            } else {
                Err(ProgramError::InvalidInstruction {
                    handler: handler.name.clone(),
                    pc,
                    reason: InvalidInstruction::Register(r),
                })
            }
        };
        let target = |pc: usize, t: u16| {
            if (t as usize) < code_len {
                Ok(())
            } else {
                Err(ProgramError::InvalidInstruction {
                    handler: handler.name.clone(),
                    pc,
                    reason: InvalidInstruction::Target(t as u32),
                })
            }
        };
        let pool = |pc: usize, index: u16, len: usize, pool: &'static str| {
            if (index as usize) < len {
                Ok(())
            } else {
                Err(ProgramError::InvalidInstruction {
                    handler: handler.name.clone(),
                    pc,
                    reason: InvalidInstruction::Pool { pool, index },
                })
            }
        };

        if code_len == 0 {
            return Err(ProgramError::EmptyHandler(handler.name.clone()));
        }

        for (pc, insn) in handler.code.iter().enumerate() {
            let Some(op) = insn.opcode() else {
                return fail(pc, InvalidInstruction::Opcode(insn.opcode_raw()));
            };
            let (a, b, c) = (insn.a(), insn.b(), insn.c());
            match op {
                Opcode::Nop | Opcode::Exit => {}
                Opcode::Jmp => target(pc, a)?,
                Opcode::Jn | Opcode::Jz => {
                    reg(pc, a.into())?;
                    target(pc, b)?;
                }
                Opcode::Nticks => reg(pc, a.into())?,
                Opcode::Mov => {
                    reg(pc, a.into())?;
                    reg(pc, b.into())?;
                }
                Opcode::Imov => reg(pc, a.into())?,
                Opcode::Nconst => {
                    reg(pc, a.into())?;
                    pool(pc, b, self.numbers.len(), "numbers")?;
                }
                Opcode::Sconst => {
                    reg(pc, a.into())?;
                    pool(pc, b, self.strings.len(), "strings")?;
                }
                Opcode::Pconst => {
                    reg(pc, a.into())?;
                    pool(pc, b, self.ipaddrs.len(), "ipaddrs")?;
                }
                Opcode::Cconst => {
                    reg(pc, a.into())?;
                    pool(pc, b, self.cidrs.len(), "cidrs")?;
                }
                // unary: A <- op B
                Opcode::Nneg
                | Opcode::Ncmpz
                | Opcode::Bnot
                | Opcode::Slen
                | Opcode::Sisempty
                | Opcode::S2i
                | Opcode::I2s
                | Opcode::P2s
                | Opcode::C2s
                | Opcode::R2s
                | Opcode::Surlenc
                | Opcode::Surldec
                | Opcode::Sreggroup => {
                    reg(pc, a.into())?;
                    reg(pc, b.into())?;
                }
                // binary: A <- B op C
                Opcode::Nadd
                | Opcode::Nsub
                | Opcode::Nmul
                | Opcode::Ndiv
                | Opcode::Nrem
                | Opcode::Nshl
                | Opcode::Nshr
                | Opcode::Npow
                | Opcode::Nand
                | Opcode::Nor
                | Opcode::Nxor
                | Opcode::Ncmpeq
                | Opcode::Ncmpne
                | Opcode::Ncmple
                | Opcode::Ncmpge
                | Opcode::Ncmplt
                | Opcode::Ncmpgt
                | Opcode::Band
                | Opcode::Bor
                | Opcode::Bxor
                | Opcode::Sadd
                | Opcode::Scmpeq
                | Opcode::Scmpne
                | Opcode::Scmple
                | Opcode::Scmpge
                | Opcode::Scmplt
                | Opcode::Scmpgt
                | Opcode::Scmpbeg
                | Opcode::Scmpend
                | Opcode::Scontains
                | Opcode::Pcmpeq
                | Opcode::Pcmpne
                | Opcode::Pincidr => {
                    reg(pc, a.into())?;
                    reg(pc, b.into())?;
                    reg(pc, c.into())?;
                }
                Opcode::Ssubstr => {
                    reg(pc, a.into())?;
                    reg(pc, b.into())?;
                    reg(pc, c.into())?;
                    // offset/length pair
                    reg(pc, u32::from(c) + 1)?;
                }
                Opcode::Sprint => reg(pc, a.into())?,
                Opcode::Smatcheq | Opcode::Smatchbeg | Opcode::Smatchend | Opcode::Smatchr => {
                    reg(pc, a.into())?;
                    pool(pc, b, self.matches.len(), "matches")?;
                    let table = &self.matches[b as usize];
                    for case in &table.cases {
                        if case.target as usize >= code_len {
                            return fail(pc, InvalidInstruction::Target(case.target));
                        }
                    }
                    if table.else_target as usize >= code_len {
                        return fail(pc, InvalidInstruction::Target(table.else_target));
                    }
                }
                Opcode::Sregmatch => {
                    reg(pc, a.into())?;
                    reg(pc, b.into())?;
                    pool(pc, c, self.regexes.len(), "regexes")?;
                }
                Opcode::Asnew | Opcode::Annew => reg(pc, a.into())?,
                Opcode::Asinit | Opcode::Aninit => {
                    reg(pc, a.into())?;
                    reg(pc, c.into())?;
                }
                Opcode::Aniniti => reg(pc, a.into())?,
                Opcode::Call | Opcode::Handler => {
                    pool(pc, a, self.natives.len(), "natives")?;
                    let native = &self.natives[a as usize];
                    if native.target.is_none() {
                        return Err(ProgramError::Unlinked(native.name.clone()));
                    }
                    let kind_ok = match op {
                        Opcode::Call => {
                            matches!(native.kind, NativeKind::Function | NativeKind::Variable)
                        }
                        _ => native.kind == NativeKind::Handler,
                    };
                    if !kind_ok {
                        return fail(pc, InvalidInstruction::CallKind(native.kind));
                    }
                    if b == 0 {
                        return fail(pc, InvalidInstruction::EmptyCallWindow);
                    }
                    // window spans base .. base + argc
                    reg(pc, c.into())?;
                    reg(pc, u32::from(c) + u32::from(b) - 1)?;
                }
            }
        }
        tracing::trace!(
            handler = %handler.name,
            index = handler_index,
            instructions = code_len,
            "handler validated"
        );
        Ok(())
    }
}

fn intern<T: PartialEq + Copy>(pool: &mut Vec<T>, value: T) -> u16 {
    if let Some(index) = pool.iter().position(|v| *v == value) {
        return index as u16;
    }
    pool.push(value);
    (pool.len() - 1) as u16
}

/// Reason an individual instruction failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidInstruction {
    Opcode(u16),
    Register(u32),
    Target(u32),
    Pool { pool: &'static str, index: u16 },
    CallKind(NativeKind),
    EmptyCallWindow,
}

impl std::fmt::Display for InvalidInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidInstruction::Opcode(raw) => write!(f, "unknown opcode {raw:#06x}"),
            InvalidInstruction::Register(r) => write!(f, "register r{r} out of range"),
            InvalidInstruction::Target(t) => write!(f, "branch target {t} outside code"),
            InvalidInstruction::Pool { pool, index } => {
                write!(f, "{pool} pool index {index} out of range")
            }
            InvalidInstruction::CallKind(kind) => {
                write!(f, "native kind {kind:?} not callable by this opcode")
            }
            InvalidInstruction::EmptyCallWindow => f.write_str("call window must include the result slot"),
        }
    }
}

/// Assembly, linking and validation errors.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("invalid regular expression '{pattern}': {source}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("native '{name}' referenced with conflicting return types {first} and {second}")]
    NativeTypeConflict {
        name: String,
        first: FlowType,
        second: FlowType,
    },
    #[error("native '{0}' is not registered")]
    UnknownNative(String),
    #[error("native '{name}' registered as {found:?}, referenced as {expected:?}")]
    NativeKindMismatch {
        name: String,
        expected: NativeKind,
        found: NativeKind,
    },
    #[error("native '{0}' is referenced but the program was never linked")]
    Unlinked(String),
    #[error("handler '{0}' has no code")]
    EmptyHandler(String),
    #[error("handler '{handler}' pc {pc}: {reason}")]
    InvalidInstruction {
        handler: String,
        pc: usize,
        reason: InvalidInstruction,
    },
    #[error("match table {table} references literal {literal} outside its pool")]
    MatchLiteralOutOfRange { table: usize, literal: u32 },
}
