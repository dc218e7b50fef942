use crate::*;
use proptest::prelude::*;
use strum::VariantArray;

#[rustfmt::skip]
impl DType {
    pub fn int_generator() -> impl Strategy<Value = Self> {
        prop_oneof![
            Just(DType::Int8), Just(DType::Int16), Just(DType::Int32), Just(DType::Int64),
            Just(DType::UInt8), Just(DType::UInt16), Just(DType::UInt32), Just(DType::UInt64),
            Just(DType::Index)
        ]
    }

    pub fn float_generator() -> impl Strategy<Value = Self> {
        prop_oneof![Just(DType::Float16), Just(DType::BFloat16), Just(DType::Float32), Just(DType::Float64)]
    }

    pub fn generator() -> impl Strategy<Value = Self> {
        proptest::sample::select(DType::VARIANTS)
    }
}
