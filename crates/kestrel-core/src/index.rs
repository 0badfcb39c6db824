use crate::error::{Error, Result};
use crate::shape::{Order, Shape};

// Index helpers — conversion between multi-indices and flat indices
//
// Flat indices here are positions in a dense array of the given extents and
// storage order, not storage offsets of an arbitrary strided descriptor.

/// What to do with a coordinate outside `[0, extent)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipMode {
    /// Out-of-range coordinates are an error.
    #[default]
    Throw,
    /// Coordinates wrap around modulo the extent.
    Wrap,
    /// Coordinates are clamped to `[0, extent - 1]`.
    Clip,
}

impl ClipMode {
    /// Integer mode as used by callers across the flat boundary: 0 throw,
    /// 1 wrap, 2 clip.
    pub fn from_code(code: i32) -> Option<ClipMode> {
        match code {
            0 => Some(ClipMode::Throw),
            1 => Some(ClipMode::Wrap),
            2 => Some(ClipMode::Clip),
            _ => None,
        }
    }
}

fn resolve(coord: i64, extent: usize, axis: usize, mode: ClipMode) -> Result<usize> {
    let n = extent as i64;
    if (0..n).contains(&coord) {
        return Ok(coord as usize);
    }
    match mode {
        ClipMode::Throw => Err(Error::shape(format!(
            "index {coord} out of bounds for axis {axis} with extent {extent}"
        ))),
        _ if n == 0 => Err(Error::shape(format!("axis {axis} has extent 0"))),
        ClipMode::Wrap => Ok(coord.rem_euclid(n) as usize),
        ClipMode::Clip => Ok(coord.clamp(0, n - 1) as usize),
    }
}

/// Flat index of the multi-index `indices` in a dense array of `shape`.
pub fn ravel_multi_index(
    indices: &[i64],
    shape: &[usize],
    order: Order,
    mode: ClipMode,
) -> Result<usize> {
    if indices.len() != shape.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![shape.len()],
            got: vec![indices.len()],
        });
    }
    let strides = Shape::from(shape).strides_for(order);
    let mut flat = 0usize;
    for (axis, ((&c, &extent), &stride)) in indices.iter().zip(shape).zip(&strides).enumerate() {
        flat += resolve(c, extent, axis, mode)? * stride as usize;
    }
    Ok(flat)
}

/// Multi-index of the flat position `flat` in a dense array of `shape`.
pub fn unravel_index(flat: usize, shape: &[usize], order: Order) -> Result<Vec<usize>> {
    let total: usize = shape.iter().product();
    if flat >= total {
        return Err(Error::shape(format!(
            "flat index {flat} out of bounds for {} elements",
            total
        )));
    }
    let mut out = vec![0usize; shape.len()];
    let mut rest = flat;
    let axes: Vec<usize> = match order {
        Order::C => (0..shape.len()).rev().collect(),
        Order::F => (0..shape.len()).collect(),
    };
    for a in axes {
        out[a] = rest % shape[a];
        rest /= shape[a];
    }
    Ok(out)
}

/// Batched [`ravel_multi_index`]: `coords` holds one row of `rank`
/// coordinates per index.
pub fn ravel_many(
    coords: &[i64],
    shape: &[usize],
    order: Order,
    mode: ClipMode,
) -> Result<Vec<usize>> {
    let rank = shape.len().max(1);
    if coords.len() % rank != 0 {
        return Err(Error::shape(format!(
            "{} coordinates do not split into rows of {rank}",
            coords.len()
        )));
    }
    coords
        .chunks(rank)
        .map(|row| ravel_multi_index(row, shape, order, mode))
        .collect()
}

/// Batched [`unravel_index`]; rows of coordinates are concatenated.
pub fn unravel_many(flat: &[usize], shape: &[usize], order: Order) -> Result<Vec<usize>> {
    let mut out = Vec::with_capacity(flat.len() * shape.len());
    for &f in flat {
        out.extend(unravel_index(f, shape, order)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ravel_c_and_f() {
        assert_eq!(ravel_multi_index(&[1, 2], &[3, 4], Order::C, ClipMode::Throw).unwrap(), 6);
        assert_eq!(ravel_multi_index(&[1, 2], &[3, 4], Order::F, ClipMode::Throw).unwrap(), 7);
    }

    #[test]
    fn test_clip_modes() {
        assert!(ravel_multi_index(&[3, 0], &[3, 4], Order::C, ClipMode::Throw).is_err());
        assert_eq!(ravel_multi_index(&[3, -1], &[3, 4], Order::C, ClipMode::Wrap).unwrap(), 3);
        assert_eq!(ravel_multi_index(&[7, -5], &[3, 4], Order::C, ClipMode::Clip).unwrap(), 8);
        assert_eq!(ClipMode::from_code(1), Some(ClipMode::Wrap));
        assert_eq!(ClipMode::from_code(9), None);
    }

    #[test]
    fn test_unravel() {
        assert_eq!(unravel_index(6, &[3, 4], Order::C).unwrap(), vec![1, 2]);
        assert_eq!(unravel_index(7, &[3, 4], Order::F).unwrap(), vec![1, 2]);
        assert!(unravel_index(12, &[3, 4], Order::C).is_err());
        assert_eq!(unravel_index(0, &[], Order::C).unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn test_batched() {
        let flat = ravel_many(&[0, 0, 1, 1, 2, 3], &[3, 4], Order::C, ClipMode::Throw).unwrap();
        assert_eq!(flat, vec![0, 5, 11]);
        let back = unravel_many(&flat, &[3, 4], Order::C).unwrap();
        assert_eq!(back, vec![0, 0, 1, 1, 2, 3]);
        assert!(ravel_many(&[0, 0, 1], &[3, 4], Order::C, ClipMode::Throw).is_err());
    }
}
