//! String-keyed jump tables backing the `SMATCH*` opcodes.
//!
//! A match table pairs an operation with a list of `(literal, target)` cases
//! and an else target.  Evaluation takes a subject string and answers the
//! program counter execution continues at.  Literals are indices into the
//! program's string pool, or into the regex pool for `MatchOp::Regex`.

use serde::{Deserialize, Serialize};

use crate::program::Program;

/// How case literals are compared against the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOp {
    /// Bytewise equality.
    Eq,
    /// Subject starts with the literal; the longest prefix wins, ties broken
    /// by insertion order.
    Prefix,
    /// Subject ends with the literal; longest suffix wins.
    Suffix,
    /// Regex literals tested in insertion order; first match wins and its
    /// captures are published to the runner's regex slot.
    Regex,
}

/// One case: a pool literal and the PC to jump to when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchCase {
    pub literal: u32,
    pub target: u32,
}

/// Capture result of the most recent regex match during a run.
///
/// `SREGMATCH` and `MatchOp::Regex` overwrite it; `SREGGROUP` reads from it.
/// Group positions index into an owned copy of the subject, so the result
/// stays valid however the subject register is reused afterwards.
#[derive(Debug, Clone)]
pub struct RegexMatch {
    subject: Box<[u8]>,
    groups: Vec<Option<(usize, usize)>>,
}

impl RegexMatch {
    pub fn new(subject: &[u8], groups: Vec<Option<(usize, usize)>>) -> Self {
        Self {
            subject: subject.into(),
            groups,
        }
    }

    /// Bytes of capture group `n`, if it participated in the match.
    pub fn group(&self, n: usize) -> Option<&[u8]> {
        let (start, end) = (*self.groups.get(n)?)?;
        self.subject.get(start..end)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// A complete match table as stored in the program's pool.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchTable {
    pub op: MatchOp,
    pub cases: Vec<MatchCase>,
    pub else_target: u32,
}

impl MatchTable {
    pub fn new(op: MatchOp, cases: Vec<MatchCase>, else_target: u32) -> Self {
        Self {
            op,
            cases,
            else_target,
        }
    }

    /// Evaluate the table against `subject` and return the target PC.
    ///
    /// Missing pool entries simply never match; the validator rejects such
    /// tables before execution.
    pub fn evaluate(
        &self,
        subject: &[u8],
        program: &Program,
        regex_slot: &mut Option<RegexMatch>,
    ) -> u32 {
        match self.op {
            MatchOp::Eq => {
                for case in &self.cases {
                    if program.string(case.literal as usize) == Some(subject) {
                        return case.target;
                    }
                }
                self.else_target
            }
            MatchOp::Prefix => self.longest(subject, program, |subject, lit| {
                subject.starts_with(lit)
            }),
            MatchOp::Suffix => self.longest(subject, program, |subject, lit| {
                subject.ends_with(lit)
            }),
            MatchOp::Regex => {
                for case in &self.cases {
                    let Some(regex) = program.regex(case.literal as usize) else {
                        continue;
                    };
                    if let Some(captures) = regex.compiled().captures(subject) {
                        *regex_slot = Some(RegexMatch::new(
                            subject,
                            captures
                                .iter()
                                .map(|g| g.map(|m| (m.start(), m.end())))
                                .collect(),
                        ));
                        return case.target;
                    }
                }
                self.else_target
            }
        }
    }

    fn longest(
        &self,
        subject: &[u8],
        program: &Program,
        matches: impl Fn(&[u8], &[u8]) -> bool,
    ) -> u32 {
        let mut best: Option<(usize, u32)> = None;
        for case in &self.cases {
            let Some(literal) = program.string(case.literal as usize) else {
                continue;
            };
            if matches(subject, literal) {
                // Strict `>` keeps the earliest case on equal lengths.
                if best.map_or(true, |(len, _)| literal.len() > len) {
                    best = Some((literal.len(), case.target));
                }
            }
        }
        best.map_or(self.else_target, |(_, target)| target)
    }
}
