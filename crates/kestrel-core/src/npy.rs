// =============================================================================
// Numpy boundary — `.npy` header parsing and writing
// =============================================================================
//
//   ┌──────────┬─────────┬──────────────┬─────────────────────┬───────────┐
//   │ 6 bytes  │ 2 bytes │ 2 or 4 bytes │ header (ASCII/UTF8) │ raw data  │
//   │ \x93NUMPY│ major,  │ header len   │ python dict literal │           │
//   │          │ minor   │ (LE)         │ padded with spaces  │           │
//   └──────────┴─────────┴──────────────┴─────────────────────┴───────────┘
//
// Version 1 uses a u16 header length, versions 2 and 3 a u32. The header looks
// like:
//
//   {'descr': '<f4', 'fortran_order': False, 'shape': (3, 4), }
//
// Only the three keys above are read. Big-endian data is rejected.

use std::sync::Arc;

use crate::buffer::DataBuffer;
use crate::descriptor::ShapeDescriptor;
use crate::device::DeviceRuntime;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Order;

pub const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// What a `.npy` header says about the data that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    /// Dense descriptor for the stored array.
    pub descriptor: ShapeDescriptor,
    /// Byte offset of the first data element.
    pub data_offset: usize,
    pub version: (u8, u8),
}

fn npy_err(s: impl Into<String>) -> Error {
    Error::Npy(s.into())
}

/// Parse the header at the start of a `.npy` byte image.
pub fn parse_header(bytes: &[u8]) -> Result<NpyHeader> {
    if bytes.len() < 10 || bytes[..6] != NPY_MAGIC[..] {
        return Err(npy_err("missing \\x93NUMPY magic"));
    }
    let version = (bytes[6], bytes[7]);
    let (header_len, start) = match version.0 {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(npy_err("truncated header length"));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        v => return Err(npy_err(format!("unsupported format version {v}"))),
    };
    let end = start + header_len;
    if bytes.len() < end {
        return Err(npy_err(format!(
            "header claims {header_len} bytes but only {} remain",
            bytes.len() - start
        )));
    }
    let text = std::str::from_utf8(&bytes[start..end])
        .map_err(|_| npy_err("header is not valid UTF-8"))?;

    let descr = parse_quoted(dict_value(text, "descr")?)?;
    let dtype = DType::from_npy_descr(descr)
        .ok_or_else(|| npy_err(format!("unsupported descr '{descr}'")))?;
    let fortran = parse_bool(dict_value(text, "fortran_order")?)?;
    let dims = parse_tuple(dict_value(text, "shape")?)?;
    let order = if fortran { Order::F } else { Order::C };

    Ok(NpyHeader {
        descriptor: ShapeDescriptor::dense(dims, dtype, order)?,
        data_offset: end,
        version,
    })
}

/// Text following `'key':` in the header dict.
fn dict_value<'a>(text: &'a str, key: &str) -> Result<&'a str> {
    let pattern_single = format!("'{key}'");
    let pattern_double = format!("\"{key}\"");
    let (at, pat_len) = text
        .find(&pattern_single)
        .map(|i| (i, pattern_single.len()))
        .or_else(|| text.find(&pattern_double).map(|i| (i, pattern_double.len())))
        .ok_or_else(|| npy_err(format!("header has no '{key}' entry")))?;
    let rest = text[at + pat_len..].trim_start();
    let rest = rest
        .strip_prefix(':')
        .ok_or_else(|| npy_err(format!("expected ':' after '{key}'")))?;
    Ok(rest.trim_start())
}

fn parse_quoted(s: &str) -> Result<&str> {
    let quote = s
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| npy_err("expected a quoted string"))?;
    let body = &s[1..];
    let close = body
        .find(quote)
        .ok_or_else(|| npy_err("unterminated string"))?;
    Ok(&body[..close])
}

fn parse_bool(s: &str) -> Result<bool> {
    if s.starts_with("True") {
        Ok(true)
    } else if s.starts_with("False") {
        Ok(false)
    } else {
        Err(npy_err("expected True or False"))
    }
}

fn parse_tuple(s: &str) -> Result<Vec<usize>> {
    let body = s
        .strip_prefix('(')
        .ok_or_else(|| npy_err("shape must be a tuple"))?;
    let close = body
        .find(')')
        .ok_or_else(|| npy_err("unterminated shape tuple"))?;
    body[..close]
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| npy_err(format!("bad extent '{p}'")))
        })
        .collect()
}

/// Parse a whole `.npy` image and copy its data into a new host buffer.
pub fn read_npy(
    runtime: Arc<dyn DeviceRuntime>,
    bytes: &[u8],
) -> Result<(ShapeDescriptor, DataBuffer)> {
    let header = parse_header(bytes)?;
    let desc = header.descriptor;
    let need = desc
        .length()
        .checked_mul(desc.dtype().size_in_bytes())
        .ok_or_else(|| npy_err(format!("shape {} is too large to load", desc.shape())))?;
    let data = &bytes[header.data_offset..];
    if data.len() < need {
        return Err(npy_err(format!(
            "data section has {} bytes, {need} required",
            data.len()
        )));
    }
    let buf = DataBuffer::allocate(runtime, desc.length(), desc.dtype(), false)?;
    buf.write_primary(|dst| dst.copy_from_slice(&data[..need]))?;
    tracing::debug!(dims = ?desc.dims(), dtype = %desc.dtype(), "loaded npy array");
    Ok((desc, buf))
}

/// Serialise the array described by `desc` over `buf` as a version 1 `.npy`
/// image. Elements are written in row-major logical order whatever the
/// descriptor's strides.
pub fn write_npy(desc: &ShapeDescriptor, buf: &DataBuffer) -> Result<Vec<u8>> {
    let descr = desc.dtype().npy_descr().ok_or_else(|| Error::UnsupportedDType {
        op: "write_npy".into(),
        dtype: desc.dtype(),
    })?;
    if desc.dtype() != buf.dtype() {
        return Err(npy_err(format!(
            "descriptor dtype {} does not match buffer dtype {}",
            desc.dtype(),
            buf.dtype()
        )));
    }
    if desc.required_len() > buf.len() {
        return Err(Error::shape(format!(
            "descriptor addresses {} elements but buffer holds {}",
            desc.required_len(),
            buf.len()
        )));
    }

    let shape = match desc.dims() {
        [] => "()".to_string(),
        [d] => format!("({d},)"),
        dims => {
            let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    };
    let mut header = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape}, }}");
    // total prefix (magic + version + len + header + '\n') is a multiple of 64
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');
    let header_len =
        u16::try_from(header.len()).map_err(|_| npy_err("header too long for version 1"))?;

    let size = desc.dtype().size_in_bytes();
    let mut out = Vec::with_capacity(10 + header.len() + desc.length() * size);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    buf.read_primary(|bytes| {
        for off in desc.offsets() {
            out.extend_from_slice(&bytes[off * size..(off + 1) * size]);
        }
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmulatedRuntime;

    fn image(version: u8, header: &str, data: &[u8]) -> Vec<u8> {
        let mut out = NPY_MAGIC.to_vec();
        out.extend_from_slice(&[version, 0]);
        if version == 1 {
            out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        } else {
            out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        }
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_parse_v1() {
        let img = image(1, "{'descr': '<f4', 'fortran_order': False, 'shape': (3, 4), }\n", &[]);
        let h = parse_header(&img).unwrap();
        assert_eq!(h.descriptor.dims(), &[3, 4]);
        assert_eq!(h.descriptor.dtype(), DType::F32);
        assert_eq!(h.descriptor.order(), Order::C);
        assert_eq!(h.version, (1, 0));
        assert_eq!(h.data_offset, img.len());
    }

    #[test]
    fn test_parse_v2_fortran_and_scalar() {
        let img = image(2, "{'descr': '<i8', 'fortran_order': True, 'shape': (2, 5), }", &[]);
        let h = parse_header(&img).unwrap();
        assert_eq!(h.descriptor.order(), Order::F);
        assert_eq!(h.descriptor.strides(), &[1, 2]);

        let img = image(3, "{'descr': '<f8', 'fortran_order': False, 'shape': (), }", &[]);
        let h = parse_header(&img).unwrap();
        assert!(h.descriptor.is_scalar());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_header(b"NOTNUMPY12").is_err());
        let img = image(1, "{'descr': '>f4', 'fortran_order': False, 'shape': (3,), }", &[]);
        assert!(matches!(parse_header(&img), Err(Error::Npy(_))));
        let img = image(1, "{'descr': '<f4', 'shape': (3,), }", &[]);
        assert!(parse_header(&img).is_err());
    }

    #[test]
    fn test_huge_shape_is_an_error() {
        let huge = 1usize << 62;
        let header = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({huge}, {huge}), }}");
        let err = parse_header(&image(1, &header, &[])).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Shape);

        let header = format!("{{'descr': '<f8', 'fortran_order': True, 'shape': ({huge}, 1), }}");
        let rt: Arc<dyn DeviceRuntime> = Arc::new(EmulatedRuntime::host_only());
        assert!(read_npy(rt, &image(1, &header, &[])).is_err());
    }

    #[test]
    fn test_write_then_read_transposed() {
        let rt: Arc<dyn DeviceRuntime> = Arc::new(EmulatedRuntime::host_only());
        let buf = DataBuffer::from_slice(Arc::clone(&rt), &[1i32, 2, 3, 4, 5, 6]).unwrap();
        let desc = ShapeDescriptor::dense(vec![2, 3], DType::I32, Order::C)
            .unwrap()
            .transpose(0, 1)
            .unwrap();
        let img = write_npy(&desc, &buf).unwrap();
        let h = parse_header(&img).unwrap();
        assert_eq!(h.data_offset % 64, 0);
        let (d, loaded) = read_npy(rt, &img).unwrap();
        assert_eq!(d.dims(), &[3, 2]);
        assert_eq!(loaded.to_vec::<i32>().unwrap(), vec![1, 4, 2, 5, 3, 6]);
    }
}
