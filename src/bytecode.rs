//! Bytecode model of the Flow VM.
//!
//! Every instruction is one 64-bit word: a 16-bit opcode followed by three
//! 16-bit operand fields A, B and C.  The encoding is uniform; whether a
//! field names a register, an immediate, a constant-pool index or a code
//! offset is a static property of the opcode, enforced by the program
//! validator rather than by the word itself.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opcodes {
    ($($name:ident = $value:literal => $mnemonic:literal,)*) => {
        /// Enumeration of all opcodes recognised by the VM.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(u16)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            /// Decode a raw opcode field.  `None` marks malformed bytecode.
            pub fn from_u16(raw: u16) -> Option<Self> {
                match raw {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            /// Assembly mnemonic used by the disassembler.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }
    };
}

opcodes! {
    // control
    Nop = 0 => "nop",
    Exit = 1 => "exit",
    Jmp = 2 => "jmp",
    Jn = 3 => "jn",
    Jz = 4 => "jz",

    // debug
    Nticks = 5 => "nticks",

    // copy
    Mov = 6 => "mov",
    Imov = 7 => "imov",

    // numeric
    Nconst = 8 => "nconst",
    Nneg = 9 => "nneg",
    Nadd = 10 => "nadd",
    Nsub = 11 => "nsub",
    Nmul = 12 => "nmul",
    Ndiv = 13 => "ndiv",
    Nrem = 14 => "nrem",
    Nshl = 15 => "nshl",
    Nshr = 16 => "nshr",
    Npow = 17 => "npow",
    Nand = 18 => "nand",
    Nor = 19 => "nor",
    Nxor = 20 => "nxor",
    Ncmpz = 21 => "ncmpz",
    Ncmpeq = 22 => "ncmpeq",
    Ncmpne = 23 => "ncmpne",
    Ncmple = 24 => "ncmple",
    Ncmpge = 25 => "ncmpge",
    Ncmplt = 26 => "ncmplt",
    Ncmpgt = 27 => "ncmpgt",

    // boolean
    Bnot = 28 => "bnot",
    Band = 29 => "band",
    Bor = 30 => "bor",
    Bxor = 31 => "bxor",

    // string
    Sconst = 32 => "sconst",
    Sadd = 33 => "sadd",
    Ssubstr = 34 => "ssubstr",
    Scmpeq = 35 => "scmpeq",
    Scmpne = 36 => "scmpne",
    Scmple = 37 => "scmple",
    Scmpge = 38 => "scmpge",
    Scmplt = 39 => "scmplt",
    Scmpgt = 40 => "scmpgt",
    Scmpbeg = 41 => "scmpbeg",
    Scmpend = 42 => "scmpend",
    Scontains = 43 => "scontains",
    Slen = 44 => "slen",
    Sisempty = 45 => "sisempty",
    Sprint = 46 => "sprint",
    Smatcheq = 47 => "smatcheq",
    Smatchbeg = 48 => "smatchbeg",
    Smatchend = 49 => "smatchend",
    Smatchr = 50 => "smatchr",

    // ip
    Pconst = 51 => "pconst",
    Pcmpeq = 52 => "pcmpeq",
    Pcmpne = 53 => "pcmpne",
    Pincidr = 54 => "pincidr",

    // cidr
    Cconst = 55 => "cconst",

    // regex
    Sregmatch = 56 => "sregmatch",
    Sreggroup = 57 => "sreggroup",

    // conversion
    S2i = 58 => "s2i",
    I2s = 59 => "i2s",
    P2s = 60 => "p2s",
    C2s = 61 => "c2s",
    R2s = 62 => "r2s",
    Surlenc = 63 => "surlenc",
    Surldec = 64 => "surldec",

    // arrays
    Asnew = 65 => "asnew",
    Asinit = 66 => "asinit",
    Annew = 67 => "annew",
    Aninit = 68 => "aninit",
    Aniniti = 69 => "aniniti",

    // native invocation
    Call = 70 => "call",
    Handler = 71 => "handler",
}

/// One encoded instruction word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instruction(pub u64);

impl Instruction {
    pub fn new(opcode: Opcode, a: u16, b: u16, c: u16) -> Self {
        Self(
            (opcode as u64)
                | (u64::from(a) << 16)
                | (u64::from(b) << 32)
                | (u64::from(c) << 48),
        )
    }

    /// Raw opcode field; may not name a valid opcode.
    pub fn opcode_raw(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn opcode(self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode_raw())
    }

    pub fn a(self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    pub fn b(self) -> u16 {
        ((self.0 >> 32) & 0xffff) as u16
    }

    pub fn c(self) -> u16 {
        ((self.0 >> 48) & 0xffff) as u16
    }

    /// Copy with the A field replaced (branch fixups).
    pub fn with_a(self, a: u16) -> Self {
        Self((self.0 & !0x0000_0000_ffff_0000) | (u64::from(a) << 16))
    }

    /// Copy with the B field replaced (branch fixups).
    pub fn with_b(self, b: u16) -> Self {
        Self((self.0 & !0x0000_ffff_0000_0000) | (u64::from(b) << 32))
    }

    /// A as a sign-extended immediate (`EXIT`).
    pub fn imm_a(self) -> i64 {
        i64::from(self.a() as i16)
    }

    /// B as a sign-extended immediate (`IMOV`).
    pub fn imm_b(self) -> i64 {
        i64::from(self.b() as i16)
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&disassemble(*self))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&disassemble(*self))
    }
}

/// Render one instruction as assembly text.
pub fn disassemble(insn: Instruction) -> String {
    match insn.opcode() {
        Some(op) => format!(
            "{:<9} {:>6} {:>6} {:>6}",
            op.mnemonic(),
            insn.a(),
            insn.b(),
            insn.c()
        ),
        None => format!("<bad opcode {:#06x}>", insn.opcode_raw()),
    }
}

/// Render a whole code vector, one instruction per line, with PCs.
pub fn disassemble_code(code: &[Instruction]) -> String {
    let mut out = String::new();
    for (pc, insn) in code.iter().enumerate() {
        out.push_str(&format!("{pc:>5}: {}\n", disassemble(*insn)));
    }
    out
}
