use super::*;

/// Host types with a fixed device representation.
pub trait HasDType: Copy {
    const DTYPE: DType;

    /// Write the native-endian representation into `out`, which is exactly
    /// `Self::DTYPE.bytes()` long.
    fn encode(self, out: &mut [u8]);
}

macro_rules! impl_dtype_ext {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl HasDType for $ty {
            const DTYPE: DType = $dtype;

            fn encode(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes());
            }
        })*
    };
}

impl_dtype_ext! {
    i8 => DType::Int8, i16 => DType::Int16, i32 => DType::Int32, i64 => DType::Int64,
    u8 => DType::UInt8, u16 => DType::UInt16, u32 => DType::UInt32, u64 => DType::UInt64,
    f32 => DType::Float32, f64 => DType::Float64,
    half::f16 => DType::Float16, half::bf16 => DType::BFloat16,
    usize => DType::Index,
}

impl HasDType for bool {
    const DTYPE: DType = DType::Bool;

    fn encode(self, out: &mut [u8]) {
        out[0] = self as u8;
    }
}
