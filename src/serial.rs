//! On-disk program image.
//!
//! Little-endian throughout.  Header: magic `"FLOW"`, format version, then
//! the counts of every section.  Pools follow in fixed order (numbers,
//! strings, ipaddrs, cidrs, regexes, matches), then the native-symbol table
//! and the handlers.  Regexes travel as their source pattern and are
//! recompiled on load; loaded programs come back unlinked, so hosts must
//! [`Program::link`] and [`Program::validate`] before running anything.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::bytecode::Instruction;
use crate::matching::{MatchCase, MatchOp, MatchTable};
use crate::natives::NativeKind;
use crate::program::{NativeRef, Program, ProgramError, RegexValue};
use crate::value::{Cidr, FlowType};

const MAGIC: [u8; 4] = *b"FLOW";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad magic; not a Flow program image")]
    BadMagic,
    #[error("unsupported image version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid address family {0}")]
    BadIpFamily(u8),
    #[error("invalid match operation {0}")]
    BadMatchOp(u8),
    #[error("invalid native kind {0}")]
    BadNativeKind(u8),
    #[error("invalid value type {0}")]
    BadType(u8),
    #[error("name is not valid UTF-8")]
    BadName,
    #[error(transparent)]
    Program(#[from] ProgramError),
}

/// Serialize a program into `out`.
pub fn write_program(program: &Program, out: &mut impl Write) -> io::Result<()> {
    out.write_all(&MAGIC)?;
    write_u32(out, VERSION)?;
    write_u32(out, program.numbers().len() as u32)?;
    write_u32(out, program.strings().len() as u32)?;
    write_u32(out, program.ipaddrs().len() as u32)?;
    write_u32(out, program.cidrs().len() as u32)?;
    write_u32(out, program.regexes().len() as u32)?;
    write_u32(out, program.matches().len() as u32)?;
    write_u32(out, program.natives().len() as u32)?;
    write_u32(out, program.handlers().len() as u32)?;

    for number in program.numbers() {
        out.write_all(&number.to_le_bytes())?;
    }
    for string in program.strings() {
        write_bytes(out, string)?;
    }
    for addr in program.ipaddrs() {
        write_ip(out, *addr)?;
    }
    for cidr in program.cidrs() {
        write_ip(out, cidr.address())?;
        out.write_all(&[cidr.prefix()])?;
    }
    for regex in program.regexes() {
        write_bytes(out, regex.pattern().as_bytes())?;
    }
    for table in program.matches() {
        let op = match table.op {
            MatchOp::Eq => 0u8,
            MatchOp::Prefix => 1,
            MatchOp::Suffix => 2,
            MatchOp::Regex => 3,
        };
        out.write_all(&[op])?;
        write_u32(out, table.else_target)?;
        write_u32(out, table.cases.len() as u32)?;
        for case in &table.cases {
            write_u32(out, case.literal)?;
            write_u32(out, case.target)?;
        }
    }
    for native in program.natives() {
        let kind = match native.kind {
            NativeKind::Function => 0u8,
            NativeKind::Handler => 1,
            NativeKind::Variable => 2,
        };
        out.write_all(&[kind, type_tag(native.return_type)])?;
        write_name(out, &native.name)?;
    }
    for handler in program.handlers() {
        write_name(out, &handler.name)?;
        out.write_all(&handler.register_count.to_le_bytes())?;
        write_u32(out, handler.code.len() as u32)?;
        for insn in &handler.code {
            out.write_all(&insn.0.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Deserialize a program image.  The result is unlinked and unvalidated.
pub fn read_program(input: &mut impl Read) -> Result<Program, SerialError> {
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(SerialError::BadMagic);
    }
    let version = read_u32(input)?;
    if version != VERSION {
        return Err(SerialError::UnsupportedVersion(version));
    }

    let numbers = read_u32(input)? as usize;
    let strings = read_u32(input)? as usize;
    let ipaddrs = read_u32(input)? as usize;
    let cidrs = read_u32(input)? as usize;
    let regexes = read_u32(input)? as usize;
    let matches = read_u32(input)? as usize;
    let natives = read_u32(input)? as usize;
    let handlers = read_u32(input)? as usize;

    let mut program = Program::new();
    for _ in 0..numbers {
        let mut buf = [0u8; 8];
        input.read_exact(&mut buf)?;
        program.push_number_raw(i64::from_le_bytes(buf));
    }
    for _ in 0..strings {
        program.push_string_raw(read_bytes(input)?.into_boxed_slice());
    }
    for _ in 0..ipaddrs {
        program.push_ipaddr_raw(read_ip(input)?);
    }
    for _ in 0..cidrs {
        let addr = read_ip(input)?;
        let mut prefix = [0u8; 1];
        input.read_exact(&mut prefix)?;
        program.push_cidr_raw(Cidr::new(addr, prefix[0]));
    }
    for _ in 0..regexes {
        let pattern = String::from_utf8(read_bytes(input)?).map_err(|_| SerialError::BadName)?;
        program.push_regex_raw(RegexValue::new(&pattern)?);
    }
    for _ in 0..matches {
        let mut header = [0u8; 1];
        input.read_exact(&mut header)?;
        let op = match header[0] {
            0 => MatchOp::Eq,
            1 => MatchOp::Prefix,
            2 => MatchOp::Suffix,
            3 => MatchOp::Regex,
            other => return Err(SerialError::BadMatchOp(other)),
        };
        let else_target = read_u32(input)?;
        let count = read_u32(input)? as usize;
        let mut cases = Vec::with_capacity(count);
        for _ in 0..count {
            let literal = read_u32(input)?;
            let target = read_u32(input)?;
            cases.push(MatchCase { literal, target });
        }
        program.add_match(MatchTable::new(op, cases, else_target));
    }
    for _ in 0..natives {
        let mut header = [0u8; 2];
        input.read_exact(&mut header)?;
        let kind = match header[0] {
            0 => NativeKind::Function,
            1 => NativeKind::Handler,
            2 => NativeKind::Variable,
            other => return Err(SerialError::BadNativeKind(other)),
        };
        let return_type = type_from_tag(header[1])?;
        let name = read_name(input)?;
        program.add_native_ref(NativeRef {
            kind,
            name,
            return_type,
            target: None,
        });
    }
    for _ in 0..handlers {
        let name = read_name(input)?;
        let mut buf = [0u8; 2];
        input.read_exact(&mut buf)?;
        let register_count = u16::from_le_bytes(buf);
        let code_len = read_u32(input)? as usize;
        let mut code = Vec::with_capacity(code_len);
        for _ in 0..code_len {
            let mut word = [0u8; 8];
            input.read_exact(&mut word)?;
            code.push(Instruction(u64::from_le_bytes(word)));
        }
        program.create_handler(&name, register_count, code);
    }
    Ok(program)
}

fn type_tag(ty: FlowType) -> u8 {
    match ty {
        FlowType::Void => 0,
        FlowType::Boolean => 1,
        FlowType::Number => 2,
        FlowType::String => 3,
        FlowType::IpAddr => 4,
        FlowType::Cidr => 5,
        FlowType::Regex => 6,
        FlowType::HandlerRef => 7,
        FlowType::StringArray => 8,
        FlowType::NumberArray => 9,
    }
}

fn type_from_tag(tag: u8) -> Result<FlowType, SerialError> {
    Ok(match tag {
        0 => FlowType::Void,
        1 => FlowType::Boolean,
        2 => FlowType::Number,
        3 => FlowType::String,
        4 => FlowType::IpAddr,
        5 => FlowType::Cidr,
        6 => FlowType::Regex,
        7 => FlowType::HandlerRef,
        8 => FlowType::StringArray,
        9 => FlowType::NumberArray,
        other => return Err(SerialError::BadType(other)),
    })
}

fn write_u32(out: &mut impl Write, value: u32) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn read_u32(input: &mut impl Read) -> Result<u32, SerialError> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_bytes(out: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    write_u32(out, bytes.len() as u32)?;
    out.write_all(bytes)
}

fn read_bytes(input: &mut impl Read) -> Result<Vec<u8>, SerialError> {
    let len = read_u32(input)? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_name(out: &mut impl Write, name: &str) -> io::Result<()> {
    out.write_all(&(name.len() as u16).to_le_bytes())?;
    out.write_all(name.as_bytes())
}

fn read_name(input: &mut impl Read) -> Result<String, SerialError> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    let len = usize::from(u16::from_le_bytes(buf));
    let mut name = vec![0u8; len];
    input.read_exact(&mut name)?;
    String::from_utf8(name).map_err(|_| SerialError::BadName)
}

/// IPs are 17 bytes on disk: a family tag, then 16 payload bytes with v4
/// zero-padded.
fn write_ip(out: &mut impl Write, addr: IpAddr) -> io::Result<()> {
    let mut payload = [0u8; 16];
    let family = match addr {
        IpAddr::V4(v4) => {
            payload[..4].copy_from_slice(&v4.octets());
            4u8
        }
        IpAddr::V6(v6) => {
            payload.copy_from_slice(&v6.octets());
            6u8
        }
    };
    out.write_all(&[family])?;
    out.write_all(&payload)
}

fn read_ip(input: &mut impl Read) -> Result<IpAddr, SerialError> {
    let mut family = [0u8; 1];
    input.read_exact(&mut family)?;
    let mut payload = [0u8; 16];
    input.read_exact(&mut payload)?;
    match family[0] {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&payload[..4]);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 => Ok(IpAddr::V6(Ipv6Addr::from(payload))),
        other => Err(SerialError::BadIpFamily(other)),
    }
}
