//! WebAssembly module compilation.
//!
//! [`CompiledModule`] wraps a Wasmtime [`Module`] with a content hash for
//! logging and the engine-neutral view of its imports.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, FuncType, Module, ValType};

use weh_common::RuntimeError;
use weh_core::{ImportKind, ImportSpec, Signature, ValueType};

/// A compiled core WebAssembly module.
///
/// Cloning is cheap; the underlying Wasmtime module is reference counted.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,
    content_hash: String,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid or compilation fails.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes)
            .map_err(|e| RuntimeError::compilation_failed(format!("Core module compilation failed: {e}")))?;

        let content_hash = compute_hash(bytes);
        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
        })
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat)
            .map_err(|e| RuntimeError::compilation_failed(format!("WAT compilation failed: {e}")))?;

        let content_hash = compute_hash(wat.as_bytes());
        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
        })
    }

    /// Compile binary or text input, telling them apart by the magic number.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails or text input is not UTF-8.
    pub fn compile(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        if bytes.starts_with(WASM_MAGIC) {
            return Self::from_bytes(engine, bytes);
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| RuntimeError::compilation_failed("Invalid Wasm: bad magic number"))?;
        Self::from_wat(engine, text)
    }

    /// Get the content hash of the source bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get the inner Wasmtime module.
    pub fn as_module(&self) -> &Module {
        &self.inner
    }

    /// The module's imports in engine-neutral form.
    pub fn imports(&self) -> Vec<ImportSpec> {
        self.inner
            .imports()
            .map(|import| ImportSpec::new(import.module(), import.name(), import_kind(&import.ty())))
            .collect()
    }

    /// Returns `true` if the module exports a function called `name`.
    pub fn exports_func(&self, name: &str) -> bool {
        self.inner
            .get_export(name)
            .is_some_and(|ty| matches!(ty, ExternType::Func(_)))
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

const WASM_MAGIC: &[u8] = b"\0asm";

/// Validate WebAssembly header (magic number).
fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
    if bytes.len() < 8 {
        return Err(RuntimeError::compilation_failed("Invalid Wasm: file too small"));
    }
    if &bytes[0..4] != WASM_MAGIC {
        return Err(RuntimeError::compilation_failed("Invalid Wasm: bad magic number"));
    }
    Ok(())
}

/// Compute a hash of the given bytes.
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
        #[allow(unreachable_patterns)]
        other => ImportKind::Other(format!("{other:?}")),
    }
}

/// Engine-neutral signature; `None` for `v128` or reference types.
pub(crate) fn signature(func: &FuncType) -> Option<Signature> {
    let params = func.params().map(|ty| value_type(&ty)).collect::<Option<Vec<_>>>()?;
    let results = func.results().map(|ty| value_type(&ty)).collect::<Option<Vec<_>>>()?;
    Some(Signature::new(params, results))
}

pub(crate) fn value_type(ty: &ValType) -> Option<ValueType> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmtimeEngine;
    use weh_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmtimeEngine {
        WasmtimeEngine::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_validate_wasm_header() {
        assert!(validate_wasm_header(MINIMAL_WASM).is_ok());
        assert!(validate_wasm_header(&[0x00, 0x61]).is_err());
        assert!(validate_wasm_header(&[0, 0, 0, 0, 1, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16); // 64-bit hex
    }

    #[test]
    fn test_module_compilation() {
        let module = CompiledModule::from_bytes(engine().inner(), MINIMAL_WASM).unwrap();
        assert!(module.imports().is_empty());
        assert!(!module.content_hash().is_empty());
    }

    #[test]
    fn test_compile_detects_text() {
        let module = CompiledModule::compile(engine().inner(), b"(module (func (export \"run\")))").unwrap();
        assert!(module.exports_func("run"));
        assert!(!module.exports_func("missing"));

        assert!(CompiledModule::compile(engine().inner(), &[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_imports_are_engine_neutral() {
        let wat = r#"
            (module
                (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
                (import "env" "memory" (memory 1))
                (import "env" "__indirect_function_table" (table 4 funcref))
                (import "env" "__stack_pointer" (global (mut i32)))
                (import "env" "takes_ref" (func (param externref)))
            )
        "#;
        let module = CompiledModule::from_wat(engine().inner(), wat).unwrap();
        let imports = module.imports();

        assert_eq!(
            imports[0].kind,
            ImportKind::Function(Signature::new([ValueType::I32; 4], [ValueType::I32]))
        );
        assert!(imports[1].is_env_memory());
        assert!(imports[2].is_env_table());
        assert_eq!(imports[3].kind, ImportKind::Global);
        assert!(matches!(imports[4].kind, ImportKind::Other(_)));
    }
}
