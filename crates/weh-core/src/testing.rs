//! In-memory guest used by unit tests.

use std::collections::BTreeMap;
use std::path::Path;

use weh_common::abi::WASM_PAGE_SIZE;
use weh_common::{GuestTrap, Interrupt};
use weh_host::{CapturedOutput, EmbedderHost};

use crate::context::{GuestEnv, GuestInstance, HostContext};
use crate::descriptor::{HostFunctionDescriptor, HostResult};
use crate::memory::MemoryView;
use crate::value::{Signature, WasmValue};

pub(crate) type MockFunc = Box<dyn FnMut(&mut MockState, &[WasmValue]) -> HostResult + Send>;

/// Observable state shared with mock exports.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub calls: Vec<String>,
    pub threw: Option<(i32, i32)>,
    pub stack_pointer: i32,
    /// `(addr, value)` words written to memory after the export returns.
    pub writes: Vec<(u32, u32)>,
}

pub(crate) struct MockEnv {
    pub ctx: HostContext,
    pub memory: Vec<u8>,
    pub max_pages: u64,
    pub exports: BTreeMap<String, MockFunc>,
    pub signatures: BTreeMap<String, Signature>,
    pub table: Vec<MockFunc>,
    pub state: MockState,
}

impl MockEnv {
    pub fn new(host: EmbedderHost) -> Self {
        Self::with_context(HostContext::new(host))
    }

    pub fn with_context(ctx: HostContext) -> Self {
        Self {
            ctx,
            memory: vec![0; WASM_PAGE_SIZE as usize],
            max_pages: 16,
            exports: BTreeMap::new(),
            signatures: BTreeMap::new(),
            table: Vec::new(),
            state: MockState::default(),
        }
    }

    pub fn export(
        &mut self,
        name: &str,
        func: impl FnMut(&mut MockState, &[WasmValue]) -> HostResult + Send + 'static,
    ) {
        self.exports.insert(name.to_string(), Box::new(func));
    }

    /// Register an export with an explicit signature; plain exports are `() -> ()`.
    pub fn export_typed(
        &mut self,
        name: &str,
        signature: Signature,
        func: impl FnMut(&mut MockState, &[WasmValue]) -> HostResult + Send + 'static,
    ) {
        self.signatures.insert(name.to_string(), signature);
        self.export(name, func);
    }

    pub fn call(&mut self, functions: &[HostFunctionDescriptor], module: &str, name: &str, args: &[WasmValue]) -> HostResult {
        let function = functions
            .iter()
            .find(|f| f.module() == module && f.name() == name)
            .unwrap_or_else(|| panic!("no host function {module}::{name}"));
        function.call(self, args)
    }

    pub fn view(&mut self) -> MemoryView<'_> {
        MemoryView::new(&mut self.memory)
    }
}

impl GuestEnv for MockEnv {
    fn context(&mut self) -> &mut HostContext {
        &mut self.ctx
    }

    fn memory(&mut self) -> Result<(&mut HostContext, MemoryView<'_>), GuestTrap> {
        Ok((&mut self.ctx, MemoryView::new(&mut self.memory)))
    }

    fn grow_memory(&mut self, delta_pages: u64) -> Result<Option<u64>, GuestTrap> {
        let pages = self.memory.len() as u64 / WASM_PAGE_SIZE;
        if pages + delta_pages > self.max_pages {
            return Ok(None);
        }
        self.memory.resize(((pages + delta_pages) * WASM_PAGE_SIZE) as usize, 0);
        Ok(Some(pages))
    }

    fn has_export(&mut self, name: &str) -> bool {
        self.exports.contains_key(name)
    }

    fn call_export(&mut self, name: &str, args: &[WasmValue]) -> Result<Option<WasmValue>, Interrupt> {
        self.state.calls.push(name.to_string());
        let func = self.exports.get_mut(name).ok_or_else(|| GuestTrap::Engine {
            message: format!("no export {name}"),
            code: None,
        })?;
        let result = func(&mut self.state, args);
        for (addr, value) in std::mem::take(&mut self.state.writes) {
            MemoryView::new(&mut self.memory).write_u32(addr, value)?;
        }
        result
    }

    fn call_indirect(&mut self, index: u32, args: &[WasmValue]) -> Result<Option<WasmValue>, Interrupt> {
        self.state.calls.push(format!("table[{index}]"));
        let func = self.table.get_mut(index as usize).ok_or_else(|| GuestTrap::Engine {
            message: "undefined element".to_string(),
            code: Some("TableOutOfBounds".to_string()),
        })?;
        func(&mut self.state, args)
    }
}

impl GuestInstance for MockEnv {
    fn engine_name(&self) -> &'static str {
        "mock"
    }

    fn export_signature(&mut self, name: &str) -> Option<Signature> {
        if !self.exports.contains_key(name) {
            return None;
        }
        Some(self.signatures.get(name).cloned().unwrap_or_else(|| Signature::new([], [])))
    }
}

/// A host with captured stdout and, optionally, `dir` preopened as `/data`.
pub(crate) fn host(dir: Option<&Path>) -> (EmbedderHost, CapturedOutput) {
    let stdout = CapturedOutput::new();
    let mut builder = EmbedderHost::builder().stdout(stdout.clone()).arg("prog").arg("--flag");
    if let Some(dir) = dir {
        builder = builder.preopen(dir, "/data");
    }
    (builder.build().unwrap(), stdout)
}
