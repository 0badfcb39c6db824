use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// DType — Element data types
//
// Every buffer and every shape descriptor carries a DType. Buffers hold raw
// bytes; the DType is what turns a byte range into numbers. Kernels run in
// f64 and convert at the load/store boundary through `load` / `store`, so a
// single kernel body serves every element type.
//
//   Bool            — stored as one byte, 0 or 1
//   I8 .. U64       — fixed-width integers
//   F16 / BF16      — half precision, via the `half` crate
//   F32 / F64       — IEEE floats

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    pub const ALL: [DType; 13] = [
        DType::Bool,
        DType::I8,
        DType::U8,
        DType::I16,
        DType::U16,
        DType::I32,
        DType::U32,
        DType::I64,
        DType::U64,
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
    ];

    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    pub fn is_integer(&self) -> bool {
        !self.is_float() && !self.is_bool()
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, DType::Bool)
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// The numpy `descr` string for this type, little-endian.
    /// BF16 has no numpy equivalent.
    pub fn npy_descr(&self) -> Option<&'static str> {
        let s = match self {
            DType::Bool => "|b1",
            DType::I8 => "|i1",
            DType::U8 => "|u1",
            DType::I16 => "<i2",
            DType::U16 => "<u2",
            DType::I32 => "<i4",
            DType::U32 => "<u4",
            DType::I64 => "<i8",
            DType::U64 => "<u8",
            DType::F16 => "<f2",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
            DType::BF16 => return None,
        };
        Some(s)
    }

    /// Inverse of [`DType::npy_descr`]. `=` (native) is accepted as
    /// little-endian; big-endian descriptors are rejected.
    pub fn from_npy_descr(descr: &str) -> Option<DType> {
        let mut chars = descr.chars();
        let order = chars.next()?;
        let body = chars.as_str();
        if !matches!(order, '<' | '|' | '=') {
            return None;
        }
        let dt = match body {
            "b1" => DType::Bool,
            "i1" => DType::I8,
            "u1" => DType::U8,
            "i2" => DType::I16,
            "u2" => DType::U16,
            "i4" => DType::I32,
            "u4" => DType::U32,
            "i8" => DType::I64,
            "u8" => DType::U64,
            "f2" => DType::F16,
            "f4" => DType::F32,
            "f8" => DType::F64,
            _ => return None,
        };
        Some(dt)
    }

    /// Read element `index` of a byte slice holding elements of this type.
    ///
    /// Panics if the element lies outside `bytes`; callers bound-check
    /// descriptors against buffer lengths before any kernel runs.
    pub fn load(&self, bytes: &[u8], index: usize) -> f64 {
        let size = self.size_in_bytes();
        let chunk = &bytes[index * size..(index + 1) * size];
        match self {
            DType::Bool => {
                if chunk[0] != 0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::I8 => read::<i8>(chunk),
            DType::U8 => read::<u8>(chunk),
            DType::I16 => read::<i16>(chunk),
            DType::U16 => read::<u16>(chunk),
            DType::I32 => read::<i32>(chunk),
            DType::U32 => read::<u32>(chunk),
            DType::I64 => read::<i64>(chunk),
            DType::U64 => read::<u64>(chunk),
            DType::F16 => read::<half::f16>(chunk),
            DType::BF16 => read::<half::bf16>(chunk),
            DType::F32 => read::<f32>(chunk),
            DType::F64 => read::<f64>(chunk),
        }
    }

    /// Write `value` into element `index`, converting to this type.
    pub fn store(&self, bytes: &mut [u8], index: usize, value: f64) {
        let size = self.size_in_bytes();
        let chunk = &mut bytes[index * size..(index + 1) * size];
        match self {
            DType::Bool => chunk[0] = u8::from(value != 0.0),
            DType::I8 => write::<i8>(chunk, value),
            DType::U8 => write::<u8>(chunk, value),
            DType::I16 => write::<i16>(chunk, value),
            DType::U16 => write::<u16>(chunk, value),
            DType::I32 => write::<i32>(chunk, value),
            DType::U32 => write::<u32>(chunk, value),
            DType::I64 => write::<i64>(chunk, value),
            DType::U64 => write::<u64>(chunk, value),
            DType::F16 => write::<half::f16>(chunk, value),
            DType::BF16 => write::<half::bf16>(chunk, value),
            DType::F32 => write::<f32>(chunk, value),
            DType::F64 => write::<f64>(chunk, value),
        }
    }
}

impl DType {
    /// Bytes of element `index`.
    pub fn element<'a>(&self, bytes: &'a [u8], index: usize) -> &'a [u8] {
        let size = self.size_in_bytes();
        &bytes[index * size..(index + 1) * size]
    }

    /// Mutable bytes of element `index`.
    pub fn element_mut<'a>(&self, bytes: &'a mut [u8], index: usize) -> &'a mut [u8] {
        let size = self.size_in_bytes();
        &mut bytes[index * size..(index + 1) * size]
    }

    /// Total order between two encoded elements of this type. Exact for
    /// every type, including 64-bit integers beyond f64 precision.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            DType::I64 => {
                bytemuck::pod_read_unaligned::<i64>(a).cmp(&bytemuck::pod_read_unaligned(b))
            }
            DType::U64 => {
                bytemuck::pod_read_unaligned::<u64>(a).cmp(&bytemuck::pod_read_unaligned(b))
            }
            _ => self.load(a, 0).total_cmp(&self.load(b, 0)),
        }
    }

    /// Integer value of one encoded element, for integer types only.
    fn load_int(&self, chunk: &[u8]) -> Option<i128> {
        let v = match self {
            DType::I8 => i128::from(bytemuck::pod_read_unaligned::<i8>(chunk)),
            DType::U8 => i128::from(chunk[0]),
            DType::I16 => i128::from(bytemuck::pod_read_unaligned::<i16>(chunk)),
            DType::U16 => i128::from(bytemuck::pod_read_unaligned::<u16>(chunk)),
            DType::I32 => i128::from(bytemuck::pod_read_unaligned::<i32>(chunk)),
            DType::U32 => i128::from(bytemuck::pod_read_unaligned::<u32>(chunk)),
            DType::I64 => i128::from(bytemuck::pod_read_unaligned::<i64>(chunk)),
            DType::U64 => i128::from(bytemuck::pod_read_unaligned::<u64>(chunk)),
            _ => return None,
        };
        Some(v)
    }

    /// Encode `v` into one element of this integer type, saturating at the
    /// type's bounds like a float conversion does.
    fn store_int(&self, chunk: &mut [u8], v: i128) {
        fn put<T: bytemuck::Pod + TryFrom<i128> + num_traits::Bounded>(chunk: &mut [u8], v: i128) {
            let t = T::try_from(v).unwrap_or_else(|_| {
                if v < 0 {
                    T::min_value()
                } else {
                    T::max_value()
                }
            });
            chunk.copy_from_slice(bytemuck::bytes_of(&t));
        }
        match self {
            DType::I8 => put::<i8>(chunk, v),
            DType::U8 => put::<u8>(chunk, v),
            DType::I16 => put::<i16>(chunk, v),
            DType::U16 => put::<u16>(chunk, v),
            DType::I32 => put::<i32>(chunk, v),
            DType::U32 => put::<u32>(chunk, v),
            DType::I64 => put::<i64>(chunk, v),
            DType::U64 => put::<u64>(chunk, v),
            _ => {}
        }
    }

    /// Convert one encoded element of this type into `dst`, an element of
    /// type `to`. Same-type copies move the bytes unchanged and
    /// integer-to-integer conversion never goes through f64.
    pub fn convert_element(&self, src: &[u8], to: DType, dst: &mut [u8]) {
        if *self == to {
            dst.copy_from_slice(src);
            return;
        }
        if to.is_integer() {
            if let Some(v) = self.load_int(src) {
                to.store_int(dst, v);
                return;
            }
        }
        to.store(dst, 0, self.load(src, 0));
    }
}

fn read<T: WithDType>(chunk: &[u8]) -> f64 {
    bytemuck::pod_read_unaligned::<T>(chunk).to_f64()
}

fn write<T: WithDType>(chunk: &mut [u8], value: f64) {
    chunk.copy_from_slice(bytemuck::bytes_of(&T::from_f64(value)));
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Bool => "bool",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I16 => "i16",
            DType::U16 => "u16",
            DType::I32 => "i32",
            DType::U32 => "u32",
            DType::I64 => "i64",
            DType::U64 => "u64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DType::ALL
            .iter()
            .copied()
            .find(|d| d.to_string() == s.to_ascii_lowercase())
            .ok_or_else(|| Error::msg(format!("unknown dtype '{s}'")))
    }
}

// WithDType — Rust element types that can back a buffer
//
// The bridge between Rust's type system and the runtime DType tag. Typed
// buffer helpers (`DataBuffer::write_host_slice::<f32>` etc.) are generic
// over this trait; `Pod` makes the byte reinterpretation sound.

/// Trait implemented by Rust types that can be stored in a buffer.
pub trait WithDType:
    Copy + Send + Sync + 'static + bytemuck::Pod + num_traits::NumCast + fmt::Debug
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

macro_rules! with_dtype_cast {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl WithDType for $ty {
                const DTYPE: DType = DType::$dt;
                fn to_f64(self) -> f64 {
                    self as f64
                }
                fn from_f64(v: f64) -> Self {
                    v as $ty
                }
            }
        )*
    };
}

with_dtype_cast!(
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        half::f16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        half::bf16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::Bool.size_in_bytes(), 1);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::U64.size_in_bytes(), 8);
    }

    #[test]
    fn test_load_store_converts() {
        let mut bytes = vec![0u8; 3 * 4];
        DType::I32.store(&mut bytes, 1, -7.9);
        assert_eq!(DType::I32.load(&bytes, 1), -7.0);
        DType::F32.store(&mut bytes, 2, 0.5);
        assert_eq!(DType::F32.load(&bytes, 2), 0.5);
    }

    #[test]
    fn test_load_is_alignment_agnostic() {
        // f64 stored at an odd byte position inside a larger slice
        let mut bytes = vec![0u8; 17];
        DType::F64.store(&mut bytes[1..], 1, 2.25);
        assert_eq!(DType::F64.load(&bytes[1..], 1), 2.25);
    }

    #[test]
    fn test_wide_integers_stay_exact() {
        let big = (1i64 << 53) + 1;
        let (a, b) = (big.to_ne_bytes(), (1i64 << 53).to_ne_bytes());
        assert_eq!(DType::I64.compare(&a, &b), Ordering::Greater);
        assert_eq!(DType::U64.compare(&u64::MAX.to_ne_bytes(), &(u64::MAX - 1).to_ne_bytes()), Ordering::Greater);

        let mut out = [0u8; 8];
        DType::I64.convert_element(&a, DType::U64, &mut out);
        assert_eq!(u64::from_ne_bytes(out), big as u64);
        DType::I64.convert_element(&a, DType::I64, &mut out);
        assert_eq!(out, a);

        let mut small = [0u8; 1];
        DType::I64.convert_element(&a, DType::I8, &mut small);
        assert_eq!(small[0] as i8, i8::MAX);
        DType::I64.convert_element(&(-5i64).to_ne_bytes(), DType::U8, &mut small);
        assert_eq!(small[0], 0);
    }

    #[test]
    fn test_bool_store_normalises() {
        let mut bytes = vec![0u8; 2];
        DType::Bool.store(&mut bytes, 0, 3.0);
        assert_eq!(bytes[0], 1);
        assert_eq!(DType::Bool.load(&bytes, 0), 1.0);
    }

    #[test]
    fn test_npy_descr_roundtrip() {
        for dt in DType::ALL {
            if let Some(d) = dt.npy_descr() {
                assert_eq!(DType::from_npy_descr(d), Some(dt));
            }
        }
        assert_eq!(DType::from_npy_descr(">f4"), None);
        assert_eq!(DType::from_npy_descr("=f8"), Some(DType::F64));
    }

    #[test]
    fn test_from_str() {
        assert_eq!("F32".parse::<DType>().unwrap(), DType::F32);
        assert_eq!("bf16".parse::<DType>().unwrap(), DType::BF16);
        assert!("f128".parse::<DType>().is_err());
    }
}
