//! Host-provided callbacks invoked by the `CALL` and `HANDLER` opcodes.
//!
//! The embedding registers named callbacks before any program is linked:
//! value-producing *functions*, verdict-producing *handlers*, and
//! get-on-reference *variables*.  Registration yields the dense id the
//! emitter bakes into call instructions; at run time only indices are used.
//! Callbacks receive a [`Params`] view over the runner's call window:
//! `argv[0]` is the in-out result slot, `argv[1..argc]` are the arguments.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::interpreter::Runner;
use crate::memory::ArrayObject;
use crate::value::{Cidr, FlowNumber, FlowType};

/// Discriminant of a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeKind {
    /// Value-producing; invoked via `CALL`.
    Function,
    /// Verdict-producing; invoked via `HANDLER`.  A true result slot makes
    /// the runner return immediately.
    Handler,
    /// Zero-argument getter; invoked via `CALL` with a result-only window.
    Variable,
}

/// View over one call window, passed to native callbacks.
///
/// The window spans `argc` registers starting at `base`; natives may mutate
/// any of them and must not assume anything outside the window survives.
pub struct Params<'a, 'run> {
    base: usize,
    argc: usize,
    runner: &'a mut Runner<'run>,
}

impl<'a, 'run> Params<'a, 'run> {
    pub(crate) fn new(base: usize, argc: usize, runner: &'a mut Runner<'run>) -> Self {
        Self { base, argc, runner }
    }

    /// Number of registers in the window, result slot included.
    pub fn window_len(&self) -> usize {
        self.argc
    }

    /// Number of input arguments (`argv[1..argc]`).
    pub fn arg_count(&self) -> usize {
        self.argc.saturating_sub(1)
    }

    fn cell(&self, index: usize) -> u64 {
        if index < self.argc {
            self.runner.register(self.base + index)
        } else {
            0
        }
    }

    fn set_cell(&mut self, index: usize, value: u64) {
        if index < self.argc {
            self.runner.set_register(self.base + index, value);
        }
    }

    /// Raw 64-bit cell at `argv[index]`.
    pub fn raw(&self, index: usize) -> u64 {
        self.cell(index)
    }

    pub fn number(&self, index: usize) -> FlowNumber {
        self.cell(index) as FlowNumber
    }

    pub fn boolean(&self, index: usize) -> bool {
        self.cell(index) != 0
    }

    /// Resolve `argv[index]` as a string; invalid handles read as empty.
    pub fn string(&self, index: usize) -> &[u8] {
        self.runner.string_value(self.cell(index)).unwrap_or(b"")
    }

    pub fn ipaddr(&self, index: usize) -> Option<IpAddr> {
        self.runner.program().ipaddr(self.cell(index) as usize)
    }

    pub fn cidr(&self, index: usize) -> Option<&Cidr> {
        self.runner.program().cidr(self.cell(index) as usize)
    }

    pub fn number_array(&self, index: usize) -> &[FlowNumber] {
        match self.runner.object(self.cell(index)) {
            Some(ArrayObject::Numbers(items)) => items,
            _ => &[],
        }
    }

    pub fn string_array(&self, index: usize) -> &[Box<[u8]>] {
        match self.runner.object(self.cell(index)) {
            Some(ArrayObject::Strings(items)) => items,
            _ => &[],
        }
    }

    /// Verdict slot, as read by the VM after a `HANDLER` invocation.
    pub fn verdict(&self) -> bool {
        self.boolean(0)
    }

    pub fn set_verdict(&mut self, handled: bool) {
        self.set_cell(0, u64::from(handled));
    }

    pub fn set_number(&mut self, value: FlowNumber) {
        self.set_cell(0, value as u64);
    }

    /// Allocate `bytes` in the run's string arena and store the handle in
    /// the result slot.  On arena exhaustion the result degrades to the
    /// empty string; the exhaustion itself surfaces when the VM next
    /// allocates.
    pub fn set_string(&mut self, bytes: &[u8]) {
        let cell = self.runner.new_string(bytes);
        self.set_cell(0, cell);
    }

    /// Escape hatch to the runner, e.g. for the user context.
    pub fn runner(&mut self) -> &mut Runner<'run> {
        self.runner
    }
}

type NativeFn = Box<dyn Fn(&mut Params<'_, '_>) + Send + Sync>;

/// One registered callback.
pub struct NativeCallback {
    kind: NativeKind,
    name: String,
    return_type: FlowType,
    callback: NativeFn,
}

impl NativeCallback {
    pub fn kind(&self) -> NativeKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_type(&self) -> FlowType {
        self.return_type
    }

    pub fn invoke(&self, params: &mut Params<'_, '_>) {
        (self.callback)(params)
    }
}

impl fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCallback")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .finish_non_exhaustive()
    }
}

/// Serialisable description of a registered callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeDescriptor {
    pub kind: NativeKind,
    pub name: String,
    pub return_type: FlowType,
}

/// The registry.  Populated at startup, read-only while Runners execute.
#[derive(Debug, Default)]
pub struct NativeRegistry {
    callbacks: Vec<NativeCallback>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &mut self,
        kind: NativeKind,
        name: &str,
        return_type: FlowType,
        callback: NativeFn,
    ) -> usize {
        self.callbacks.push(NativeCallback {
            kind,
            name: name.to_owned(),
            return_type,
            callback,
        });
        self.callbacks.len() - 1
    }

    pub fn register_function(
        &mut self,
        name: &str,
        return_type: FlowType,
        callback: impl Fn(&mut Params<'_, '_>) + Send + Sync + 'static,
    ) -> usize {
        self.register(NativeKind::Function, name, return_type, Box::new(callback))
    }

    pub fn register_handler(
        &mut self,
        name: &str,
        callback: impl Fn(&mut Params<'_, '_>) + Send + Sync + 'static,
    ) -> usize {
        self.register(NativeKind::Handler, name, FlowType::Boolean, Box::new(callback))
    }

    pub fn register_variable(
        &mut self,
        name: &str,
        return_type: FlowType,
        callback: impl Fn(&mut Params<'_, '_>) + Send + Sync + 'static,
    ) -> usize {
        self.register(NativeKind::Variable, name, return_type, Box::new(callback))
    }

    /// Remove a callback by name.  Later ids shift down, so this is only
    /// sound before any program is linked.
    pub fn unregister(&mut self, name: &str) -> bool {
        match self.callbacks.iter().position(|c| c.name == name) {
            Some(index) => {
                self.callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    /// Linear lookup by name; used for linking only.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.callbacks.iter().position(|c| c.name == name)
    }

    pub fn get(&self, id: usize) -> Option<&NativeCallback> {
        self.callbacks.get(id)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Enumerate registered callbacks for documentation and telemetry.
    pub fn descriptors(&self) -> Vec<NativeDescriptor> {
        self.callbacks
            .iter()
            .map(|c| NativeDescriptor {
                kind: c.kind,
                name: c.name.clone(),
                return_type: c.return_type,
            })
            .collect()
    }
}
