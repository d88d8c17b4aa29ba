//! Value domain of the Flow language.
//!
//! Flow programs compute over a closed set of kinds: 64-bit signed numbers
//! (booleans are numbers in {0,1}), binary-safe strings, IP addresses, CIDR
//! networks, regular expressions, handler references, and homogeneous arrays
//! of string or number.  Reference-kinded values live in constant pools or in
//! per-run arenas; a register only ever holds a 64-bit cell whose
//! interpretation is fixed by the consuming opcode.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numbers are 64-bit two's-complement signed integers.
pub type FlowNumber = i64;

/// Static type of a Flow value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowType {
    Void,
    Boolean,
    Number,
    String,
    IpAddr,
    Cidr,
    Regex,
    HandlerRef,
    StringArray,
    NumberArray,
}

impl FlowType {
    pub fn name(self) -> &'static str {
        match self {
            FlowType::Void => "void",
            FlowType::Boolean => "bool",
            FlowType::Number => "int",
            FlowType::String => "string",
            FlowType::IpAddr => "ip",
            FlowType::Cidr => "cidr",
            FlowType::Regex => "regex",
            FlowType::HandlerRef => "handler",
            FlowType::StringArray => "string[]",
            FlowType::NumberArray => "int[]",
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A CIDR network: an address plus a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Build a network, clamping the prefix to the address family's width.
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            addr,
            prefix: prefix.min(max),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// True if `ip` falls within this network.  Addresses of a different
    /// family never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(host)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*host) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(host)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*host) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix.min(128)))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Debug, Error)]
#[error("invalid CIDR literal '{0}'")]
pub struct CidrParseError(String);

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| CidrParseError(s.into()))?;
        let addr: IpAddr = addr.parse().map_err(|_| CidrParseError(s.into()))?;
        let prefix: u8 = prefix.parse().map_err(|_| CidrParseError(s.into()))?;
        Ok(Cidr::new(addr, prefix))
    }
}

/// A literal as it appears in the typed AST and in IR constants.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(FlowNumber),
    Boolean(bool),
    String(Vec<u8>),
    IpAddr(IpAddr),
    Cidr(Cidr),
    /// Regular expression source pattern; compiled when interned in a pool.
    Regex(String),
    /// Reference to a handler by name; resolved to an index at emission.
    HandlerRef(String),
}

impl Literal {
    pub fn ty(&self) -> FlowType {
        match self {
            Literal::Number(_) => FlowType::Number,
            Literal::Boolean(_) => FlowType::Boolean,
            Literal::String(_) => FlowType::String,
            Literal::IpAddr(_) => FlowType::IpAddr,
            Literal::Cidr(_) => FlowType::Cidr,
            Literal::Regex(_) => FlowType::Regex,
            Literal::HandlerRef(_) => FlowType::HandlerRef,
        }
    }
}

/// String-to-number coercion used by `S2I`.
///
/// Base 10, leading ASCII whitespace allowed, optional sign, parsing stops at
/// the first non-digit.  Overflow saturates rather than wrapping or erroring;
/// the language has no failure channel for conversions.
pub fn parse_number(bytes: &[u8]) -> FlowNumber {
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let negative = match bytes.get(i) {
        Some(b'-') => {
            i += 1;
            true
        }
        Some(b'+') => {
            i += 1;
            false
        }
        _ => false,
    };
    let mut value: FlowNumber = 0;
    while let Some(&digit) = bytes.get(i).filter(|b| b.is_ascii_digit()) {
        let digit = FlowNumber::from(digit - b'0');
        value = match value.checked_mul(10).and_then(|v| {
            if negative {
                v.checked_sub(digit)
            } else {
                v.checked_add(digit)
            }
        }) {
            Some(v) => v,
            None => return if negative { FlowNumber::MIN } else { FlowNumber::MAX },
        };
        i += 1;
    }
    value
}

/// Bytes that survive form-urlencoding untouched.
fn is_form_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'*')
}

/// `application/x-www-form-urlencoded` encoding: space becomes `+`, every
/// byte outside the unreserved set becomes `%HH`.
pub fn url_encode(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if b == b' ' {
            out.push(b'+');
        } else if is_form_unreserved(b) {
            out.push(b);
        } else {
            out.push(b'%');
            out.push(hex_digit(b >> 4));
            out.push(hex_digit(b & 0x0f));
        }
    }
    out
}

/// Inverse of [`url_encode`].  Malformed `%` escapes pass through as literal
/// bytes so decoding is total.
pub fn url_decode(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (bytes.get(i + 1), bytes.get(i + 2)) {
                (Some(&hi), Some(&lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                    out.push(hex_value(hi) << 4 | hex_value(lo));
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn hex_digit(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        _ => b'A' + nibble - 10,
    }
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}
