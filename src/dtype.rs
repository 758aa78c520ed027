//! Element types understood by the dispatch layer.

use std::fmt::Debug;

use half::{bf16, f16};

use crate::error::{DispatchError, DispatchResult};
use crate::ffi::dlpack::{
    DLDataType, KDL_BFLOAT, KDL_BOOL, KDL_FLOAT, KDL_FLOAT8_E4M3FN, KDL_FLOAT8_E5M2, KDL_INT,
    KDL_UINT,
};

/// Scalar element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool,
    U8,
    I8,
    I32,
    U32,
    I64,
    U64,
    F16,
    BF16,
    F32,
    F64,
    F8E4M3,
    F8E5M2,
}

impl ScalarType {
    pub const ALL: [ScalarType; 13] = [
        ScalarType::Bool,
        ScalarType::U8,
        ScalarType::I8,
        ScalarType::I32,
        ScalarType::U32,
        ScalarType::I64,
        ScalarType::U64,
        ScalarType::F16,
        ScalarType::BF16,
        ScalarType::F32,
        ScalarType::F64,
        ScalarType::F8E4M3,
        ScalarType::F8E5M2,
    ];

    /// Short code used inside module identifiers.
    ///
    /// The table is closed: types without an entry cannot name a module.
    pub fn filename_code(self) -> Option<&'static str> {
        match self {
            ScalarType::F16 => Some("f16"),
            ScalarType::BF16 => Some("bf16"),
            ScalarType::F8E4M3 => Some("e4m3"),
            ScalarType::F8E5M2 => Some("e5m2"),
            ScalarType::I8 => Some("i8"),
            ScalarType::U8 => Some("u8"),
            ScalarType::I32 => Some("i32"),
            ScalarType::U32 => Some("u32"),
            ScalarType::I64 => Some("i64"),
            ScalarType::U64 => Some("u64"),
            ScalarType::Bool | ScalarType::F32 | ScalarType::F64 => None,
        }
    }

    pub fn filename_safe(self) -> DispatchResult<&'static str> {
        self.filename_code()
            .ok_or(DispatchError::UnsupportedDtype(self))
    }

    pub fn size_bytes(self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::F8E4M3 | ScalarType::F8E5M2 => 1,
            ScalarType::F16 | ScalarType::BF16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::U64 | ScalarType::F64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ScalarType::U8
                | ScalarType::I8
                | ScalarType::I32
                | ScalarType::U32
                | ScalarType::I64
                | ScalarType::U64
        )
    }

    pub fn to_dl(self) -> DLDataType {
        let (code, bits) = match self {
            ScalarType::Bool => (KDL_BOOL, 8),
            ScalarType::U8 => (KDL_UINT, 8),
            ScalarType::I8 => (KDL_INT, 8),
            ScalarType::I32 => (KDL_INT, 32),
            ScalarType::U32 => (KDL_UINT, 32),
            ScalarType::I64 => (KDL_INT, 64),
            ScalarType::U64 => (KDL_UINT, 64),
            ScalarType::F16 => (KDL_FLOAT, 16),
            ScalarType::BF16 => (KDL_BFLOAT, 16),
            ScalarType::F32 => (KDL_FLOAT, 32),
            ScalarType::F64 => (KDL_FLOAT, 64),
            ScalarType::F8E4M3 => (KDL_FLOAT8_E4M3FN, 8),
            ScalarType::F8E5M2 => (KDL_FLOAT8_E5M2, 8),
        };
        DLDataType {
            code,
            bits,
            lanes: 1,
        }
    }

    /// Inverse of [`ScalarType::to_dl`]. Vector lanes are not supported.
    pub fn from_dl(dtype: DLDataType) -> Option<Self> {
        if dtype.lanes != 1 {
            return None;
        }
        Self::ALL.into_iter().find(|ty| ty.to_dl() == dtype)
    }
}

/// Host element with a fixed [`ScalarType`].
pub trait Element: bytemuck::Pod + Debug + Send + Sync + 'static {
    const DTYPE: ScalarType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: ScalarType = ScalarType::$dtype;
        })*
    };
}

impl_element! {
    u8 => U8,
    i8 => I8,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f16 => F16,
    bf16 => BF16,
    f32 => F32,
    f64 => F64,
}
