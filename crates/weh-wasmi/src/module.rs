//! Module compilation for the interpreter.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};
use wasmi::core::ValType;
use wasmi::{Engine, ExternType, FuncType, Module};

use weh_common::RuntimeError;
use weh_core::{ImportKind, ImportSpec, Signature, ValueType};

/// A validated module ready for instantiation.
#[derive(Clone)]
pub struct WasmiModule {
    inner: Module,
    content_hash: String,
}

impl WasmiModule {
    /// Compile binary or text input.
    ///
    /// Text is converted with the `wat` crate first.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn compile(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let binary = wat::parse_bytes(bytes)
            .map_err(|e| RuntimeError::compilation_failed(format!("WAT parsing failed: {e}")))?;
        let module = Module::new(engine, &binary[..])
            .map_err(|e| RuntimeError::compilation_failed(format!("Module validation failed: {e}")))?;

        let content_hash = compute_hash(bytes);
        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
        })
    }

    /// Get the content hash of the source bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get the inner wasmi module.
    pub fn as_module(&self) -> &Module {
        &self.inner
    }

    /// The module's imports in engine-neutral form.
    pub fn imports(&self) -> Vec<ImportSpec> {
        self.inner
            .imports()
            .map(|import| ImportSpec::new(import.module(), import.name(), import_kind(import.ty())))
            .collect()
    }
}

impl std::fmt::Debug for WasmiModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmiModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn import_kind(ty: &ExternType) -> ImportKind {
    match ty {
        ExternType::Func(func) => match signature(func) {
            Some(signature) => ImportKind::Function(signature),
            None => ImportKind::Other(format!("function {func:?}")),
        },
        ExternType::Memory(_) => ImportKind::Memory,
        ExternType::Table(_) => ImportKind::Table,
        ExternType::Global(_) => ImportKind::Global,
    }
}

/// Engine-neutral signature; `None` for reference types.
pub(crate) fn signature(func: &FuncType) -> Option<Signature> {
    let params = func.params().iter().map(value_type).collect::<Option<Vec<_>>>()?;
    let results = func.results().iter().map(value_type).collect::<Option<Vec<_>>>()?;
    Some(Signature::new(params, results))
}

fn value_type(ty: &ValType) -> Option<ValueType> {
    match ty {
        ValType::I32 => Some(ValueType::I32),
        ValType::I64 => Some(ValueType::I64),
        ValType::F32 => Some(ValueType::F32),
        ValType::F64 => Some(ValueType::F64),
        _ => None,
    }
}

pub(crate) fn val_type(ty: ValueType) -> ValType {
    match ty {
        ValueType::I32 => ValType::I32,
        ValueType::I64 => ValType::I64,
        ValueType::F32 => ValType::F32,
        ValueType::F64 => ValType::F64,
    }
}
