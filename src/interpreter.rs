//! The register VM.
//!
//! A [`Runner`] binds one handler of a linked, validated [`Program`] to one
//! invocation: it owns the register file, the per-run arenas and the regex
//! match slot, and carries the host's opaque user context through to native
//! callbacks.  `run` drives the dispatch loop to a boolean verdict.  The VM
//! never panics: malformed state that validation would have caught, and
//! arena exhaustion, abort the run with a `false` verdict.
//!
//! Register cells are untyped 64-bit values.  Numbers live in the cell
//! directly; strings are tagged handles into the constant pool or the run
//! arena; IPs, CIDRs and regexes are pool indices; arrays are object-arena
//! indices.  The emitter guarantees each cell is only ever consumed at its
//! produced kind.

use std::any::Any;

use thiserror::Error;
use tracing::{error, trace};

use crate::bytecode::{Instruction, Opcode};
use crate::matching::RegexMatch;
use crate::memory::{
    ArenaLimits, ArenaMetrics, ArrayObject, MemoryError, ObjectArena, StringArena,
};
use crate::natives::{NativeRegistry, Params};
use crate::program::{Handler, Program};
use crate::value::{self, FlowNumber};

/// High bit of a string cell marks an arena handle; clear means a constant
/// pool index.
const ARENA_STRING_BIT: u64 = 1 << 63;

/// Conditions that abort a run.  All of them are either emitter bugs that
/// validation catches up front, or arena exhaustion.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("program counter {0} outside handler code")]
    CodeRange(usize),
    #[error("unknown opcode {0:#06x}")]
    BadOpcode(u16),
    #[error("register r{0} out of range")]
    RegisterRange(usize),
    #[error("{pool} pool index {index} out of range")]
    PoolRange { pool: &'static str, index: usize },
    #[error("string handle {0:#x} does not resolve")]
    BadStringHandle(u64),
    #[error("object handle {0:#x} does not resolve")]
    BadObjectHandle(u64),
    #[error("array index {index} out of bounds for object of length {len}")]
    ArrayIndex { index: usize, len: usize },
    #[error("native id {0} is not linked")]
    UnlinkedNative(usize),
    #[error("native id {0} missing from the registry")]
    UnknownNative(usize),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// One VM invocation: a handler plus the per-run state.
pub struct Runner<'run> {
    program: &'run Program,
    handler: &'run Handler,
    registry: &'run NativeRegistry,
    registers: Box<[u64]>,
    strings: StringArena,
    objects: ObjectArena,
    regex_slot: Option<RegexMatch>,
    user_context: Option<&'run mut dyn Any>,
    pending_fault: Option<Fault>,
    ticks: u64,
}

impl<'run> Runner<'run> {
    /// Bind a runner to one handler of `program`.  The handler must belong
    /// to the program and the program must be linked against `registry`.
    pub fn new(
        program: &'run Program,
        handler: &'run Handler,
        registry: &'run NativeRegistry,
    ) -> Self {
        Self::with_limits(program, handler, registry, ArenaLimits::default())
    }

    pub fn with_limits(
        program: &'run Program,
        handler: &'run Handler,
        registry: &'run NativeRegistry,
        limits: ArenaLimits,
    ) -> Self {
        Self {
            program,
            handler,
            registry,
            registers: vec![0; usize::from(handler.register_count)].into_boxed_slice(),
            strings: StringArena::new(limits.string_bytes),
            objects: ObjectArena::new(limits.object_bytes),
            regex_slot: None,
            user_context: None,
            pending_fault: None,
            ticks: 0,
        }
    }

    /// Attach the host's per-request state; natives reach it through
    /// [`Runner::context_mut`].
    pub fn set_user_context(&mut self, context: &'run mut dyn Any) {
        self.user_context = Some(context);
    }

    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_context
            .as_deref_mut()
            .and_then(|context| context.downcast_mut())
    }

    pub fn program(&self) -> &'run Program {
        self.program
    }

    pub fn handler(&self) -> &'run Handler {
        self.handler
    }

    /// Instructions executed so far (the `NTICKS` counter).
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn string_metrics(&self) -> ArenaMetrics {
        self.strings.metrics()
    }

    pub fn object_metrics(&self) -> ArenaMetrics {
        self.objects.metrics()
    }

    /// Execute the handler to its verdict.  Faults log and yield `false`.
    pub fn run(&mut self) -> bool {
        match self.dispatch() {
            Ok(verdict) => verdict,
            Err(fault) => {
                error!(handler = %self.handler.name, %fault, "run aborted");
                false
            }
        }
    }

    /// Like [`Runner::run`] but surfaces the fault; used by hosts that want
    /// to distinguish a clean `false` verdict from an aborted run.
    pub fn run_checked(&mut self) -> Result<bool, Fault> {
        self.dispatch()
    }

    // ---- register and arena access ------------------------------------

    /// Raw cell; out-of-range reads as zero (native window misuse must not
    /// fault the host).
    pub fn register(&self, index: usize) -> u64 {
        self.registers.get(index).copied().unwrap_or(0)
    }

    pub fn set_register(&mut self, index: usize, value: u64) {
        if let Some(cell) = self.registers.get_mut(index) {
            *cell = value;
        }
    }

    /// Allocate a string in the run arena and return its cell.  On arena
    /// exhaustion the empty string comes back and the fault is delivered
    /// when control returns to the dispatch loop.
    pub fn new_string(&mut self, bytes: &[u8]) -> u64 {
        match self.strings.alloc(bytes) {
            Ok(index) => ARENA_STRING_BIT | index as u64,
            Err(fault) => {
                self.pending_fault = Some(Fault::Memory(fault));
                self.empty_string()
            }
        }
    }

    /// Concatenation helper for natives.
    pub fn concat(&mut self, a: &[u8], b: &[u8]) -> u64 {
        let mut joined = Vec::with_capacity(a.len() + b.len());
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        match self.strings.alloc_owned(joined) {
            Ok(index) => ARENA_STRING_BIT | index as u64,
            Err(fault) => {
                self.pending_fault = Some(Fault::Memory(fault));
                self.empty_string()
            }
        }
    }

    /// Cell of the per-run empty string sentinel.
    pub fn empty_string(&self) -> u64 {
        ARENA_STRING_BIT | self.strings.empty() as u64
    }

    /// Resolve a string cell; `None` for handles that do not resolve.
    pub fn string_value(&self, cell: u64) -> Option<&[u8]> {
        if cell & ARENA_STRING_BIT != 0 {
            self.strings.get((cell & !ARENA_STRING_BIT) as usize)
        } else {
            self.program.string(cell as usize)
        }
    }

    /// Resolve an array cell for native argument access.
    pub fn object(&self, cell: u64) -> Option<&ArrayObject> {
        self.objects.get(cell as usize)
    }

    fn reg(&self, index: usize) -> Result<u64, Fault> {
        self.registers
            .get(index)
            .copied()
            .ok_or(Fault::RegisterRange(index))
    }

    fn set_reg(&mut self, index: usize, value: u64) -> Result<(), Fault> {
        match self.registers.get_mut(index) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(Fault::RegisterRange(index)),
        }
    }

    fn str_cell(&self, cell: u64) -> Result<&[u8], Fault> {
        resolve_str(self.program, &self.strings, cell)
    }

    fn alloc_owned(&mut self, bytes: Vec<u8>) -> Result<u64, Fault> {
        Ok(ARENA_STRING_BIT | self.strings.alloc_owned(bytes)? as u64)
    }

    // ---- dispatch ------------------------------------------------------

    fn dispatch(&mut self) -> Result<bool, Fault> {
        let program = self.program;
        let registry = self.registry;
        let handler = self.handler;
        let code: &[Instruction] = &handler.code;
        let mut pc: usize = 0;

        loop {
            let insn = *code.get(pc).ok_or(Fault::CodeRange(pc))?;
            let op = insn
                .opcode()
                .ok_or_else(|| Fault::BadOpcode(insn.opcode_raw()))?;
            self.ticks += 1;
            trace!(pc, %insn, "step");
            let (a, b, c) = (
                usize::from(insn.a()),
                usize::from(insn.b()),
                usize::from(insn.c()),
            );

            match op {
                Opcode::Nop => {}

                // ---- control ------------------------------------------
                Opcode::Exit => return Ok(insn.a() != 0),
                Opcode::Jmp => {
                    pc = a;
                    continue;
                }
                Opcode::Jn => {
                    if self.reg(a)? != 0 {
                        pc = b;
                        continue;
                    }
                }
                Opcode::Jz => {
                    if self.reg(a)? == 0 {
                        pc = b;
                        continue;
                    }
                }
                Opcode::Nticks => {
                    let ticks = self.ticks;
                    self.set_reg(a, ticks)?;
                }

                // ---- copy ---------------------------------------------
                Opcode::Mov => {
                    let v = self.reg(b)?;
                    self.set_reg(a, v)?;
                }
                Opcode::Imov => self.set_reg(a, insn.imm_b() as u64)?,

                // ---- numeric ------------------------------------------
                Opcode::Nconst => {
                    let v = program.number(b).ok_or(Fault::PoolRange {
                        pool: "numbers",
                        index: b,
                    })?;
                    self.set_reg(a, v as u64)?;
                }
                Opcode::Nneg => {
                    let v = self.reg(b)? as FlowNumber;
                    self.set_reg(a, v.wrapping_neg() as u64)?;
                }
                Opcode::Nadd => self.numeric(a, b, c, |x, y| x.wrapping_add(y))?,
                Opcode::Nsub => self.numeric(a, b, c, |x, y| x.wrapping_sub(y))?,
                Opcode::Nmul => self.numeric(a, b, c, |x, y| x.wrapping_mul(y))?,
                // Division and modulo by zero produce 0; handlers have no
                // failure channel.
                Opcode::Ndiv => {
                    self.numeric(a, b, c, |x, y| if y == 0 { 0 } else { x.wrapping_div(y) })?
                }
                Opcode::Nrem => {
                    self.numeric(a, b, c, |x, y| if y == 0 { 0 } else { x.wrapping_rem(y) })?
                }
                Opcode::Nshl => self.numeric(a, b, c, |x, y| x.wrapping_shl((y & 63) as u32))?,
                Opcode::Nshr => self.numeric(a, b, c, |x, y| x.wrapping_shr((y & 63) as u32))?,
                Opcode::Npow => self.numeric(a, b, c, ipow)?,
                Opcode::Nand => {
                    let v = self.reg(b)? & self.reg(c)?;
                    self.set_reg(a, v)?;
                }
                Opcode::Nor => {
                    let v = self.reg(b)? | self.reg(c)?;
                    self.set_reg(a, v)?;
                }
                Opcode::Nxor => {
                    let v = self.reg(b)? ^ self.reg(c)?;
                    self.set_reg(a, v)?;
                }
                Opcode::Ncmpz => {
                    let v = self.reg(b)? as FlowNumber;
                    self.set_reg(a, u64::from(v == 0))?;
                }
                Opcode::Ncmpeq => self.compare(a, b, c, |x, y| x == y)?,
                Opcode::Ncmpne => self.compare(a, b, c, |x, y| x != y)?,
                Opcode::Ncmple => self.compare(a, b, c, |x, y| x <= y)?,
                Opcode::Ncmpge => self.compare(a, b, c, |x, y| x >= y)?,
                Opcode::Ncmplt => self.compare(a, b, c, |x, y| x < y)?,
                Opcode::Ncmpgt => self.compare(a, b, c, |x, y| x > y)?,

                // ---- boolean ------------------------------------------
                Opcode::Bnot => {
                    let v = self.reg(b)?;
                    self.set_reg(a, u64::from(v == 0))?;
                }
                Opcode::Band => {
                    let v = self.reg(b)? != 0 && self.reg(c)? != 0;
                    self.set_reg(a, u64::from(v))?;
                }
                Opcode::Bor => {
                    let v = self.reg(b)? != 0 || self.reg(c)? != 0;
                    self.set_reg(a, u64::from(v))?;
                }
                Opcode::Bxor => {
                    let v = (self.reg(b)? != 0) ^ (self.reg(c)? != 0);
                    self.set_reg(a, u64::from(v))?;
                }

                // ---- strings ------------------------------------------
                Opcode::Sconst => self.set_reg(a, b as u64)?,
                Opcode::Sadd => {
                    let (bv, cv) = (self.reg(b)?, self.reg(c)?);
                    let joined = {
                        let x = self.str_cell(bv)?;
                        let y = resolve_str(program, &self.strings, cv)?;
                        let mut out = Vec::with_capacity(x.len() + y.len());
                        out.extend_from_slice(x);
                        out.extend_from_slice(y);
                        out
                    };
                    let cell = self.alloc_owned(joined)?;
                    self.set_reg(a, cell)?;
                }
                Opcode::Ssubstr => {
                    let sv = self.reg(b)?;
                    let offset = self.reg(c)? as FlowNumber;
                    let length = self.reg(c + 1)? as FlowNumber;
                    let slice = {
                        let subject = self.str_cell(sv)?;
                        let start = offset.clamp(0, subject.len() as FlowNumber) as usize;
                        let avail = subject.len() - start;
                        let take = length.clamp(0, avail as FlowNumber) as usize;
                        subject[start..start + take].to_vec()
                    };
                    let cell = self.alloc_owned(slice)?;
                    self.set_reg(a, cell)?;
                }
                Opcode::Scmpeq => self.compare_str(a, b, c, |o| o.is_eq())?,
                Opcode::Scmpne => self.compare_str(a, b, c, |o| o.is_ne())?,
                Opcode::Scmple => self.compare_str(a, b, c, |o| o.is_le())?,
                Opcode::Scmpge => self.compare_str(a, b, c, |o| o.is_ge())?,
                Opcode::Scmplt => self.compare_str(a, b, c, |o| o.is_lt())?,
                Opcode::Scmpgt => self.compare_str(a, b, c, |o| o.is_gt())?,
                Opcode::Scmpbeg => self.string_test(a, b, c, |x, y| x.starts_with(y))?,
                Opcode::Scmpend => self.string_test(a, b, c, |x, y| x.ends_with(y))?,
                Opcode::Scontains => self.string_test(a, b, c, contains)?,
                Opcode::Slen => {
                    let sv = self.reg(b)?;
                    let len = self.str_cell(sv)?.len();
                    self.set_reg(a, len as u64)?;
                }
                Opcode::Sisempty => {
                    let sv = self.reg(b)?;
                    let empty = self.str_cell(sv)?.is_empty();
                    self.set_reg(a, u64::from(empty))?;
                }
                Opcode::Sprint => {
                    let sv = self.reg(a)?;
                    let text = String::from_utf8_lossy(self.str_cell(sv)?).into_owned();
                    println!("{text}");
                }
                Opcode::Smatcheq | Opcode::Smatchbeg | Opcode::Smatchend | Opcode::Smatchr => {
                    let table = program.match_table(b).ok_or(Fault::PoolRange {
                        pool: "matches",
                        index: b,
                    })?;
                    let subject_cell = self.reg(a)?;
                    let target = {
                        let subject = resolve_str(program, &self.strings, subject_cell)?;
                        table.evaluate(subject, program, &mut self.regex_slot)
                    };
                    pc = target as usize;
                    continue;
                }

                // ---- ip / cidr ----------------------------------------
                Opcode::Pconst => self.set_reg(a, b as u64)?,
                Opcode::Pcmpeq => {
                    let (x, y) = (self.ip_cell(b)?, self.ip_cell(c)?);
                    self.set_reg(a, u64::from(x == y))?;
                }
                Opcode::Pcmpne => {
                    let (x, y) = (self.ip_cell(b)?, self.ip_cell(c)?);
                    self.set_reg(a, u64::from(x != y))?;
                }
                Opcode::Pincidr => {
                    let ip = self.ip_cell(b)?;
                    let index = self.reg(c)? as usize;
                    let cidr = program.cidr(index).ok_or(Fault::PoolRange {
                        pool: "cidrs",
                        index,
                    })?;
                    self.set_reg(a, u64::from(cidr.contains(&ip)))?;
                }
                Opcode::Cconst => self.set_reg(a, b as u64)?,

                // ---- regex --------------------------------------------
                Opcode::Sregmatch => {
                    let subject_cell = self.reg(b)?;
                    let regex = program.regex(c).ok_or(Fault::PoolRange {
                        pool: "regexes",
                        index: c,
                    })?;
                    let capture = {
                        let subject = resolve_str(program, &self.strings, subject_cell)?;
                        regex.compiled().captures(subject).map(|captures| {
                            RegexMatch::new(
                                subject,
                                captures
                                    .iter()
                                    .map(|group| group.map(|m| (m.start(), m.end())))
                                    .collect(),
                            )
                        })
                    };
                    let matched = capture.is_some();
                    if capture.is_some() {
                        self.regex_slot = capture;
                    }
                    self.set_reg(a, u64::from(matched))?;
                }
                Opcode::Sreggroup => {
                    let group = self.reg(b)? as FlowNumber;
                    // Empty slot or out-of-range group reads as "".
                    let bytes: Vec<u8> = usize::try_from(group)
                        .ok()
                        .and_then(|index| {
                            self.regex_slot
                                .as_ref()
                                .and_then(|m| m.group(index))
                                .map(<[u8]>::to_vec)
                        })
                        .unwrap_or_default();
                    let cell = self.alloc_owned(bytes)?;
                    self.set_reg(a, cell)?;
                }

                // ---- conversion ---------------------------------------
                Opcode::S2i => {
                    let sv = self.reg(b)?;
                    let v = value::parse_number(self.str_cell(sv)?);
                    self.set_reg(a, v as u64)?;
                }
                Opcode::I2s => {
                    let v = self.reg(b)? as FlowNumber;
                    let cell = self.alloc_owned(v.to_string().into_bytes())?;
                    self.set_reg(a, cell)?;
                }
                Opcode::P2s => {
                    let ip = self.ip_cell(b)?;
                    let cell = self.alloc_owned(ip.to_string().into_bytes())?;
                    self.set_reg(a, cell)?;
                }
                Opcode::C2s => {
                    let index = self.reg(b)? as usize;
                    let text = program
                        .cidr(index)
                        .ok_or(Fault::PoolRange {
                            pool: "cidrs",
                            index,
                        })?
                        .to_string();
                    let cell = self.alloc_owned(text.into_bytes())?;
                    self.set_reg(a, cell)?;
                }
                Opcode::R2s => {
                    let index = self.reg(b)? as usize;
                    let pattern = program
                        .regex(index)
                        .ok_or(Fault::PoolRange {
                            pool: "regexes",
                            index,
                        })?
                        .pattern()
                        .to_owned();
                    let cell = self.alloc_owned(pattern.into_bytes())?;
                    self.set_reg(a, cell)?;
                }
                Opcode::Surlenc => {
                    let sv = self.reg(b)?;
                    let encoded = value::url_encode(self.str_cell(sv)?);
                    let cell = self.alloc_owned(encoded)?;
                    self.set_reg(a, cell)?;
                }
                Opcode::Surldec => {
                    let sv = self.reg(b)?;
                    let decoded = value::url_decode(self.str_cell(sv)?);
                    let cell = self.alloc_owned(decoded)?;
                    self.set_reg(a, cell)?;
                }

                // ---- arrays -------------------------------------------
                Opcode::Asnew => {
                    let index = self.objects.alloc_strings(b)?;
                    self.set_reg(a, index as u64)?;
                }
                Opcode::Asinit => {
                    let array_cell = self.reg(a)?;
                    let value_cell = self.reg(c)?;
                    let bytes = self.str_cell(value_cell)?.to_vec();
                    self.objects.charge(bytes.len())?;
                    let object = self
                        .objects
                        .get_mut(array_cell as usize)
                        .ok_or(Fault::BadObjectHandle(array_cell))?;
                    match object {
                        ArrayObject::Strings(items) => {
                            let len = items.len();
                            *items.get_mut(b).ok_or(Fault::ArrayIndex { index: b, len })? =
                                bytes.into_boxed_slice();
                        }
                        ArrayObject::Numbers(_) => {
                            return Err(Fault::BadObjectHandle(array_cell))
                        }
                    }
                }
                Opcode::Annew => {
                    let index = self.objects.alloc_numbers(b)?;
                    self.set_reg(a, index as u64)?;
                }
                Opcode::Aninit | Opcode::Aniniti => {
                    let array_cell = self.reg(a)?;
                    let v = if op == Opcode::Aninit {
                        self.reg(c)? as FlowNumber
                    } else {
                        FlowNumber::from(insn.c() as i16)
                    };
                    let object = self
                        .objects
                        .get_mut(array_cell as usize)
                        .ok_or(Fault::BadObjectHandle(array_cell))?;
                    match object {
                        ArrayObject::Numbers(items) => {
                            let len = items.len();
                            *items.get_mut(b).ok_or(Fault::ArrayIndex { index: b, len })? = v;
                        }
                        ArrayObject::Strings(_) => {
                            return Err(Fault::BadObjectHandle(array_cell))
                        }
                    }
                }

                // ---- native invocation --------------------------------
                Opcode::Call | Opcode::Handler => {
                    let native = program.native(a).ok_or(Fault::PoolRange {
                        pool: "natives",
                        index: a,
                    })?;
                    let target = native.target.ok_or(Fault::UnlinkedNative(a))? as usize;
                    let callback = registry.get(target).ok_or(Fault::UnknownNative(target))?;
                    if c + b > self.registers.len() {
                        return Err(Fault::RegisterRange(c + b));
                    }
                    let mut params = Params::new(c, b, self);
                    callback.invoke(&mut params);
                    if let Some(fault) = self.pending_fault.take() {
                        return Err(fault);
                    }
                    if op == Opcode::Handler && self.reg(c)? != 0 {
                        return Ok(true);
                    }
                }
            }
            pc += 1;
        }
    }

    fn numeric(
        &mut self,
        a: usize,
        b: usize,
        c: usize,
        f: impl FnOnce(FlowNumber, FlowNumber) -> FlowNumber,
    ) -> Result<(), Fault> {
        let x = self.reg(b)? as FlowNumber;
        let y = self.reg(c)? as FlowNumber;
        self.set_reg(a, f(x, y) as u64)
    }

    fn compare(
        &mut self,
        a: usize,
        b: usize,
        c: usize,
        f: impl FnOnce(FlowNumber, FlowNumber) -> bool,
    ) -> Result<(), Fault> {
        let x = self.reg(b)? as FlowNumber;
        let y = self.reg(c)? as FlowNumber;
        self.set_reg(a, u64::from(f(x, y)))
    }

    fn compare_str(
        &mut self,
        a: usize,
        b: usize,
        c: usize,
        f: impl FnOnce(std::cmp::Ordering) -> bool,
    ) -> Result<(), Fault> {
        let (bv, cv) = (self.reg(b)?, self.reg(c)?);
        let ordering = {
            let x = self.str_cell(bv)?;
            let y = resolve_str(self.program, &self.strings, cv)?;
            x.cmp(y)
        };
        self.set_reg(a, u64::from(f(ordering)))
    }

    fn string_test(
        &mut self,
        a: usize,
        b: usize,
        c: usize,
        f: impl FnOnce(&[u8], &[u8]) -> bool,
    ) -> Result<(), Fault> {
        let (bv, cv) = (self.reg(b)?, self.reg(c)?);
        let result = {
            let x = self.str_cell(bv)?;
            let y = resolve_str(self.program, &self.strings, cv)?;
            f(x, y)
        };
        self.set_reg(a, u64::from(result))
    }

    fn ip_cell(&self, register: usize) -> Result<std::net::IpAddr, Fault> {
        let index = self.reg(register)? as usize;
        self.program.ipaddr(index).ok_or(Fault::PoolRange {
            pool: "ipaddrs",
            index,
        })
    }
}

fn resolve_str<'x>(
    program: &'x Program,
    strings: &'x StringArena,
    cell: u64,
) -> Result<&'x [u8], Fault> {
    if cell & ARENA_STRING_BIT != 0 {
        strings
            .get((cell & !ARENA_STRING_BIT) as usize)
            .ok_or(Fault::BadStringHandle(cell))
    } else {
        program
            .string(cell as usize)
            .ok_or(Fault::BadStringHandle(cell))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

fn ipow(base: FlowNumber, exp: FlowNumber) -> FlowNumber {
    if exp < 0 {
        return 0;
    }
    let mut result: FlowNumber = 1;
    let mut base = base;
    let mut exp = exp as u64;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    result
}
