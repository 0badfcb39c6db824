use std::fmt;

// Shape — Per-axis extents and storage order
//
// A Shape only lists how long each axis is. How those elements sit in memory
// is the job of the strides carried by a ShapeDescriptor; Shape can produce
// the default (dense) strides for either storage order:
//
//   [2, 3, 4] row-major    → strides [12, 4, 1]   (last axis contiguous)
//   [2, 3, 4] column-major → strides [1, 2, 6]    (first axis contiguous)
//
// A rank-0 shape is a scalar with one element. Any zero extent makes the
// array empty.

/// Storage order of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Order {
    /// Row-major (C order): the last axis varies fastest.
    #[default]
    C,
    /// Column-major (Fortran order): the first axis varies fastest.
    F,
}

impl Order {
    pub fn as_char(&self) -> char {
        match self {
            Order::C => 'c',
            Order::F => 'f',
        }
    }

    pub fn from_char(c: char) -> Option<Order> {
        match c {
            'c' | 'C' => Some(Order::C),
            'f' | 'F' => Some(Order::F),
            _ => None,
        }
    }
}

/// N-dimensional extents of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of extents.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The extents as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar has one element; any zero extent
    /// gives zero.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.0.contains(&0)
    }

    /// Dense strides (in elements) for the given storage order.
    pub fn strides_for(&self, order: Order) -> Vec<isize> {
        let rank = self.rank();
        let mut strides = vec![0isize; rank];
        if rank == 0 {
            return strides;
        }
        match order {
            Order::C => {
                strides[rank - 1] = 1;
                for i in (0..rank - 1).rev() {
                    strides[i] = strides[i + 1] * self.0[i + 1].max(1) as isize;
                }
            }
            Order::F => {
                strides[0] = 1;
                for i in 1..rank {
                    strides[i] = strides[i - 1] * self.0[i - 1].max(1) as isize;
                }
            }
        }
        strides
    }

    /// Row-major strides; shorthand for `strides_for(Order::C)`.
    pub fn stride_contiguous(&self) -> Vec<isize> {
        self.strides_for(Order::C)
    }

    /// Extent of axis `d`.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::AxisOutOfRange {
            axis: d as i64,
            rank: self.rank(),
        })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert!(s.stride_contiguous().is_empty());
    }

    #[test]
    fn test_c_strides() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.strides_for(Order::C), vec![12, 4, 1]);
        assert_eq!(s.elem_count(), 24);
    }

    #[test]
    fn test_f_strides() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.strides_for(Order::F), vec![1, 2, 6]);
    }

    #[test]
    fn test_empty_shape() {
        let s = Shape::from((3, 0, 2));
        assert!(s.is_empty());
        assert_eq!(s.elem_count(), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
