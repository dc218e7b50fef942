//! Scalar element types shared by kernels, buffers and backends.
//!
//! Every type carries a stable integer type code. Callers binding scalar kernel
//! arguments pass the code together with the value's bytes, and backends decode
//! it back with [`DType::from_code`].

pub mod ext;

#[cfg(any(test, feature = "proptest"))]
pub mod proptest_gen;


pub use ext::HasDType;

/// Integer type code as it crosses the kernel argument boundary.
pub type TypeCode = i32;

/// Scalar data types usable as kernel arguments and buffer elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::FromRepr, strum::IntoStaticStr)]
#[repr(u32)]
pub enum DType {
    Bool = 0,

    // Interleaved signed/unsigned, ordered by width.
    Int8 = 1,
    UInt8 = 2,
    Int16 = 3,
    UInt16 = 4,
    Int32 = 5,
    UInt32 = 6,
    Int64 = 7,
    UInt64 = 8,

    Float16 = 9,
    BFloat16 = 10,
    Float32 = 11,
    Float64 = 12,

    /// Pointer-sized unsigned integer (`size_t` on the device side).
    Index = 13,
}

impl DType {
    /// Decode a type code. Returns `None` for codes no type is registered under.
    pub fn from_code(code: TypeCode) -> Option<Self> {
        u32::try_from(code).ok().and_then(Self::from_repr)
    }

    pub const fn code(self) -> TypeCode {
        self as TypeCode
    }

    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 => 4,
            Self::Int64 => 8,
            Self::UInt8 => 1,
            Self::UInt16 => 2,
            Self::UInt32 => 4,
            Self::UInt64 => 8,
            Self::Float16 => 2,
            Self::BFloat16 => 2,
            Self::Float32 => 4,
            Self::Float64 => 8,
            Self::Index => size_of::<usize>(),
        }
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }

    pub const fn is_int(&self) -> bool {
        self.is_signed() || self.is_unsigned() || matches!(self, Self::Index)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64)
    }

    /// C spelling used when declaring kernel parameters of this type.
    pub const fn c_style(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "signed char",
            Self::Int16 => "short",
            Self::Int32 => "int",
            Self::Int64 => "long long",
            Self::UInt8 => "unsigned char",
            Self::UInt16 => "unsigned short",
            Self::UInt32 => "unsigned int",
            Self::UInt64 => "unsigned long long",
            Self::Float16 => "half",
            Self::BFloat16 => "__bf16",
            Self::Float32 => "float",
            Self::Float64 => "double",
            Self::Index => "size_t",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name: &'static str = self.into();
        f.write_str(name)
    }
}
