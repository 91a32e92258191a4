//! Engine-neutral wasm values and function signatures.

use std::fmt;

use weh_common::GuestTrap;

/// A wasm value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    /// Decode an Emscripten signature letter (`i`, `j`, `f`, `d`).
    pub fn from_sig_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(Self::I32),
            'j' => Some(Self::I64),
            'f' => Some(Self::F32),
            'd' => Some(Self::F64),
            _ => None,
        }
    }

    /// The zero value of this type.
    pub fn zero(self) -> WasmValue {
        match self {
            Self::I32 => WasmValue::I32(0),
            Self::I64 => WasmValue::I64(0),
            Self::F32 => WasmValue::F32(0.0),
            Self::F64 => WasmValue::F64(0.0),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A wasm value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WasmValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl WasmValue {
    /// Type of the value.
    pub fn ty(&self) -> ValueType {
        match self {
            Self::I32(_) => ValueType::I32,
            Self::I64(_) => ValueType::I64,
            Self::F32(_) => ValueType::F32,
            Self::F64(_) => ValueType::F64,
        }
    }

    /// The value as an `i32`, if it is one.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as an `i64`, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Parameter and result types of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    params: Vec<ValueType>,
    results: Vec<ValueType>,
}

impl Signature {
    /// Create a signature.
    pub fn new(params: impl Into<Vec<ValueType>>, results: impl Into<Vec<ValueType>>) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    /// Parameter types.
    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    /// Result types.
    pub fn results(&self) -> &[ValueType] {
        &self.results
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |types: &[ValueType]| {
            types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "({}) -> ({})", join(&self.params), join(&self.results))
    }
}

/// Typed access to host function arguments.
///
/// Adapters check types before dispatch; a mismatch here means a broken
/// adapter, and is reported as a trap rather than a panic.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a>(&'a [WasmValue]);

impl<'a> Args<'a> {
    /// Wrap raw arguments.
    pub fn new(values: &'a [WasmValue]) -> Self {
        Self(values)
    }

    /// All raw arguments.
    pub fn as_slice(&self) -> &'a [WasmValue] {
        self.0
    }

    fn get(&self, index: usize) -> Result<WasmValue, GuestTrap> {
        self.0.get(index).copied().ok_or_else(|| {
            GuestTrap::invalid_argument(format!("missing argument {index}"))
        })
    }

    /// Argument `index` as `i32`.
    pub fn i32(&self, index: usize) -> Result<i32, GuestTrap> {
        self.get(index)?.as_i32().ok_or_else(|| {
            GuestTrap::invalid_argument(format!("argument {index} is not an i32"))
        })
    }

    /// Argument `index` as `u32` (guest pointers, lengths, fds).
    #[allow(clippy::cast_sign_loss)]
    pub fn u32(&self, index: usize) -> Result<u32, GuestTrap> {
        self.i32(index).map(|v| v as u32)
    }

    /// Argument `index` as `i64`.
    pub fn i64(&self, index: usize) -> Result<i64, GuestTrap> {
        self.get(index)?.as_i64().ok_or_else(|| {
            GuestTrap::invalid_argument(format!("argument {index} is not an i64"))
        })
    }

    /// Argument `index` as `u64`.
    #[allow(clippy::cast_sign_loss)]
    pub fn u64(&self, index: usize) -> Result<u64, GuestTrap> {
        self.i64(index).map(|v| v as u64)
    }
}
