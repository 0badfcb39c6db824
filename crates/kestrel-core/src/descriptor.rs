use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::{Order, Shape};

// ShapeDescriptor — Logical shape + physical layout of an array
//
// A descriptor decouples the *logical* shape of an array from how its data is
// arranged in the backing buffer. Transpose, permute, slicing and most
// reshapes only produce a new descriptor over the same bytes.
//
// KEY CONCEPTS:
//
// 1. **Strides** are in elements and signed. A negative stride walks an axis
//    backwards; the descriptor offset then points at the element with the
//    highest address along that axis.
//
// 2. **Element-wise stride (EWS)**: if every element can be reached as
//    `offset + i * ews` for a single ews, the array is contiguous under one
//    stride and kernels may skip multi-index arithmetic. Axes of extent 1
//    never break contiguity. When no single stride works, EWS is None and
//    kernels fall back to full multi-index iteration.
//
// 3. **Logical order**: element `i` of an array is the element whose
//    multi-index is the row-major unravelling of `i`, whatever the storage
//    order. Every kernel pairs operands through this order, so a C-order
//    input and an F-order output still line up element for element.
//
// Descriptors are immutable. Every transformation returns a new one.

/// Maximum supported rank.
pub const MAX_RANK: usize = 32;

/// Encoded rank, extents, strides, element type and order of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeDescriptor {
    shape: Shape,
    strides: Vec<isize>,
    /// Element offset into the backing buffer where index [0, .., 0] lives.
    offset: usize,
    dtype: DType,
    order: Order,
    ews: Option<isize>,
}

impl ShapeDescriptor {
    /// Describe an array with explicit strides.
    pub fn new(
        extents: impl Into<Shape>,
        strides: Vec<isize>,
        dtype: DType,
        order: Order,
    ) -> Result<Self> {
        Self::with_offset(extents.into(), strides, 0, dtype, order)
    }

    /// Describe a dense array in the given storage order.
    pub fn dense(extents: impl Into<Shape>, dtype: DType, order: Order) -> Result<Self> {
        let shape = extents.into();
        check_extents(&shape)?;
        let strides = shape.strides_for(order);
        Self::with_offset(shape, strides, 0, dtype, order)
    }

    /// Describe a rank-0 array.
    pub fn scalar(dtype: DType) -> Self {
        ShapeDescriptor {
            shape: Shape::new(vec![]),
            strides: vec![],
            offset: 0,
            dtype,
            order: Order::C,
            ews: Some(1),
        }
    }

    pub(crate) fn with_offset(
        shape: Shape,
        strides: Vec<isize>,
        offset: usize,
        dtype: DType,
        order: Order,
    ) -> Result<Self> {
        if shape.rank() > MAX_RANK {
            return Err(Error::RankTooLarge {
                rank: shape.rank(),
                max: MAX_RANK,
            });
        }
        if shape.rank() != strides.len() {
            return Err(Error::StrideLengthMismatch {
                extents: shape.rank(),
                strides: strides.len(),
            });
        }
        check_extents(&shape)?;
        check_reach(shape.dims(), &strides, offset)?;
        let ews = compute_ews(shape.dims(), &strides, order);
        let desc = ShapeDescriptor {
            shape,
            strides,
            offset,
            dtype,
            order,
            ews,
        };
        if let Some((lo, _)) = desc.index_span() {
            if lo < 0 {
                return Err(Error::shape(format!(
                    "strides {:?} with offset {} address negative element {}",
                    desc.strides, offset, lo
                )));
            }
        }
        Ok(desc)
    }

    /// Derive a view over the same storage. `offset` is relative to this
    /// descriptor's own offset; every element the view addresses must lie
    /// inside the range this descriptor addresses.
    pub fn derive_view(
        &self,
        extents: impl Into<Shape>,
        strides: Vec<isize>,
        offset: isize,
    ) -> Result<Self> {
        let base = self.offset as isize + offset;
        if base < 0 {
            return Err(Error::shape(format!(
                "view offset {offset} moves before the start of storage"
            )));
        }
        let view = Self::with_offset(
            extents.into(),
            strides,
            base as usize,
            self.dtype,
            self.order,
        )?;
        if let Some((vlo, vhi)) = view.index_span() {
            let (plo, phi) = self
                .index_span()
                .ok_or_else(|| Error::shape("cannot take a non-empty view of an empty array"))?;
            if vlo < plo || vhi > phi {
                return Err(Error::shape(format!(
                    "view addresses elements {vlo}..={vhi} outside parent range {plo}..={phi}"
                )));
            }
        }
        Ok(view)
    }

    /// Same layout, different element type.
    pub fn with_dtype(&self, dtype: DType) -> Self {
        ShapeDescriptor {
            dtype,
            ..self.clone()
        }
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn order(&self) -> Order {
        self.order
    }

    /// Number of elements.
    pub fn length(&self) -> usize {
        self.shape.elem_count()
    }

    /// True when any extent is zero.
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.length() == 1 && !self.is_empty()
    }

    /// At most one axis has an extent other than 1.
    pub fn is_vector(&self) -> bool {
        self.dims().iter().filter(|&&d| d != 1).count() <= 1
    }

    /// Element-wise stride, or None when no single stride reaches every
    /// element.
    pub fn element_wise_stride(&self) -> Option<isize> {
        self.ews
    }

    /// Stride that walks the elements in *logical* (row-major index) order,
    /// if one exists. Differs from the EWS for F-order arrays, whose
    /// contiguous walk is column-major.
    pub fn logical_stride(&self) -> Option<isize> {
        match self.order {
            Order::C => self.ews,
            Order::F if self.is_vector() => self.ews,
            Order::F => compute_ews(self.dims(), &self.strides, Order::C),
        }
    }

    /// Lowest and highest element index addressed, or None for empty arrays.
    pub fn index_span(&self) -> Option<(isize, isize)> {
        if self.is_empty() {
            return None;
        }
        let mut lo = self.offset as isize;
        let mut hi = self.offset as isize;
        for (&d, &s) in self.dims().iter().zip(&self.strides) {
            let reach = (d as isize - 1) * s;
            if reach < 0 {
                lo += reach;
            } else {
                hi += reach;
            }
        }
        Some((lo, hi))
    }

    /// Minimum buffer length (in elements) needed to back this descriptor.
    pub fn required_len(&self) -> usize {
        self.index_span().map(|(_, hi)| hi as usize + 1).unwrap_or(0)
    }

    /// Storage index of a multi-dimensional index:
    /// `offset + sum(index[i] * stride[i])`.
    pub fn offset_of(&self, index: &[usize]) -> usize {
        let mut flat = self.offset as isize;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx as isize * self.strides[i];
        }
        flat as usize
    }

    /// Storage index of logical element `i`.
    pub fn offset_of_logical(&self, i: usize) -> usize {
        if let Some(s) = self.logical_stride() {
            return (self.offset as isize + i as isize * s) as usize;
        }
        let mut rem = i;
        let mut flat = self.offset as isize;
        for axis in (0..self.rank()).rev() {
            let d = self.dims()[axis];
            flat += (rem % d) as isize * self.strides[axis];
            rem /= d;
        }
        flat as usize
    }

    /// Iterator over storage indices of every element, in logical order.
    pub fn offsets(&self) -> OffsetIter {
        OffsetIter::new(self)
    }

    // Views

    /// Swap two axes. No data moves.
    pub fn transpose(&self, a: usize, b: usize) -> Result<Self> {
        let rank = self.rank();
        if a >= rank || b >= rank {
            return Err(Error::AxisOutOfRange {
                axis: a.max(b) as i64,
                rank,
            });
        }
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(a, b);
        self.permute(&perm)
    }

    /// Reorder axes: axis `i` of the result is axis `perm[i]` of `self`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self> {
        let rank = self.rank();
        if perm.len() != rank {
            return Err(Error::shape(format!(
                "permutation {perm:?} does not match rank {rank}"
            )));
        }
        let mut seen = vec![false; rank];
        for &p in perm {
            if p >= rank {
                return Err(Error::AxisOutOfRange {
                    axis: p as i64,
                    rank,
                });
            }
            if seen[p] {
                return Err(Error::DuplicateAxis { axis: p });
            }
            seen[p] = true;
        }
        let dims: Vec<usize> = perm.iter().map(|&p| self.dims()[p]).collect();
        let strides: Vec<isize> = perm.iter().map(|&p| self.strides[p]).collect();
        Self::with_offset(Shape::new(dims), strides, self.offset, self.dtype, self.order)
    }

    /// Reshape without copying. Elements are read in `order`; only possible
    /// when the array is contiguous when walked in that order.
    pub fn reshape(&self, extents: impl Into<Shape>, order: Order) -> Result<Self> {
        let shape = extents.into();
        if shape.elem_count() != self.length() {
            return Err(Error::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: shape.dims().to_vec(),
            });
        }
        let walk = match order {
            Order::C => self.logical_stride(),
            Order::F => compute_ews(self.dims(), &self.strides, Order::F),
        };
        let Some(step) = walk.or_else(|| self.is_empty().then_some(1)) else {
            return Err(Error::shape(format!(
                "array with strides {:?} cannot be reshaped to {} without a copy",
                self.strides, shape
            )));
        };
        let strides = shape
            .strides_for(order)
            .into_iter()
            .map(|s| s * step)
            .collect();
        Self::with_offset(shape, strides, self.offset, self.dtype, order)
    }
}

/// Extents whose product (zeros counted as 1) does not fit in an isize
/// cannot be addressed.
fn check_extents(shape: &Shape) -> Result<()> {
    shape
        .dims()
        .iter()
        .try_fold(1isize, |acc, &d| {
            isize::try_from(d.max(1)).ok().and_then(|d| acc.checked_mul(d))
        })
        .map(|_| ())
        .ok_or_else(|| Error::shape(format!("extents {shape} overflow the address space")))
}

/// Every element index `offset + sum(i * stride)` must be representable.
fn check_reach(dims: &[usize], strides: &[isize], offset: usize) -> Result<()> {
    let overflow = || {
        Error::shape(format!(
            "extents {dims:?} with strides {strides:?} and offset {offset} overflow the address space"
        ))
    };
    let mut lo = isize::try_from(offset).map_err(|_| overflow())?;
    let mut hi = lo;
    for (&d, &s) in dims.iter().zip(strides) {
        if d == 0 {
            return Ok(());
        }
        let reach = isize::try_from(d - 1)
            .ok()
            .and_then(|d| d.checked_mul(s))
            .ok_or_else(overflow)?;
        if reach < 0 {
            lo = lo.checked_add(reach).ok_or_else(overflow)?;
        } else {
            hi = hi.checked_add(reach).ok_or_else(overflow)?;
        }
    }
    Ok(())
}

/// EWS rule: walk axes from fastest to slowest for the storage order,
/// skipping extent-1 axes; the first stride seen is the candidate and each
/// later stride must equal the previous stride times the previous extent.
fn compute_ews(dims: &[usize], strides: &[isize], order: Order) -> Option<isize> {
    if dims.contains(&0) {
        return None;
    }
    let axes: Vec<usize> = match order {
        Order::C => (0..dims.len()).rev().collect(),
        Order::F => (0..dims.len()).collect(),
    };
    let mut ews: Option<isize> = None;
    let mut expected = 0isize;
    for axis in axes {
        let (d, s) = (dims[axis], strides[axis]);
        if d == 1 {
            continue;
        }
        match ews {
            None => {
                if s <= 0 {
                    return None;
                }
                ews = Some(s);
                expected = s.checked_mul(d as isize)?;
            }
            Some(_) => {
                if s != expected {
                    return None;
                }
                expected = expected.checked_mul(d as isize)?;
            }
        }
    }
    Some(ews.unwrap_or(1))
}

// OffsetIter — Storage indices of every element in logical order
//
// When a single logical stride exists this is just `offset + i * stride`.
// Otherwise it keeps a multi-index and steps it like an odometer, rightmost
// axis first.

/// Iterator that yields the storage index of each element of a descriptor.
pub struct OffsetIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<isize>,
    /// Storage index of `current`.
    flat: isize,
    linear: Option<isize>,
    remaining: usize,
    started: bool,
}

impl OffsetIter {
    fn new(desc: &ShapeDescriptor) -> Self {
        OffsetIter {
            current: vec![0; desc.rank()],
            dims: desc.dims().to_vec(),
            strides: desc.strides().to_vec(),
            flat: desc.offset() as isize,
            linear: desc.logical_stride(),
            remaining: desc.length(),
            started: false,
        }
    }

    fn advance(&mut self) {
        if let Some(s) = self.linear {
            self.flat += s;
            return;
        }
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.flat += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.flat -= self.strides[i] * self.dims[i] as isize;
            self.current[i] = 0;
        }
    }
}

impl Iterator for OffsetIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat as usize)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for OffsetIter {}
