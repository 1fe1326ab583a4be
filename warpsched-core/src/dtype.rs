use std::fmt;

use half::f16;

/// Tensor element types understood by the kernel templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    U8,
    I32,
    F16,
    F32,
}

impl DType {
    pub const fn size_in_bytes(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 => 4,
            DType::F16 => 2,
            DType::F32 => 4,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::F16 => "f16",
            DType::F32 => "f32",
        }
    }

    /// Type name in emitted kernel source.
    pub const fn c_name(&self) -> &'static str {
        match self {
            DType::U8 => "unsigned char",
            DType::I32 => "int",
            DType::F16 => "__half",
            DType::F32 => "float",
        }
    }

    /// Extra header the emitted source needs for this type, if any.
    pub const fn c_dep(&self) -> Option<&'static str> {
        match self {
            DType::F16 => Some("#include <cuda_fp16.h>"),
            _ => None,
        }
    }

    /// Format a scalar constant as it appears in kernel source. F16 goes
    /// through its exact bit pattern so the emitted text never depends on
    /// host float printing of a non-representable value.
    pub fn format_const(&self, v: f64) -> String {
        match self {
            DType::U8 => format!("{}", v as u8),
            DType::I32 => format!("{}", v as i32),
            DType::F16 => format!("__ushort_as_half(0x{:04x})", f16::from_f64(v).to_bits()),
            DType::F32 => format!("{:?}f", v as f32),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
