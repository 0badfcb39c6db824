// Kernels — host implementations of every op family
//
// Dispatch snapshots each input into a `HostArray` (the read phase), hands
// the snapshots to a family kernel, then commits what the kernel produced to
// the output buffer. Kernels never touch a live buffer, so an output that
// aliases an input reads the pre-op values everywhere.
//
// All arithmetic runs in f64; dtypes are converted at load and at commit.
// Copy and Identity move encoded elements instead, so they are exact for
// every dtype.
// Loops over at least `element_threshold` elements (or `tad_threshold` tiles)
// run on the rayon pool.
//
// Helper fast path: contiguous F32 operands of a few exact elementwise ops are
// processed directly as f32 slices. Results are identical to the generic path
// (single IEEE operations round the same either way).

use std::sync::Arc;

use rayon::prelude::*;

use kestrel_core::{DType, Error, RandomGenerator, Result, ShapeDescriptor, TadPlanner};

use crate::exec::context::{OpArgs, Operand};
use crate::exec::ops::{BinaryOp, Op, RandomOp, TransformOp};

/// Host snapshot of one operand.
#[derive(Debug, Clone)]
pub struct HostArray {
    bytes: Vec<u8>,
    desc: Arc<ShapeDescriptor>,
}

impl HostArray {
    /// Copy the operand's current host bytes.
    pub fn snapshot(operand: &Operand) -> Result<HostArray> {
        let bytes = operand.buffer.read_primary(|b| b.to_vec())?;
        Ok(HostArray {
            bytes,
            desc: Arc::clone(&operand.shape),
        })
    }

    pub fn desc(&self) -> &ShapeDescriptor {
        &self.desc
    }

    pub fn len(&self) -> usize {
        self.desc.length()
    }

    pub fn is_empty(&self) -> bool {
        self.desc.is_empty()
    }

    /// Element at storage index `index`.
    pub fn at(&self, index: usize) -> f64 {
        self.desc.dtype().load(&self.bytes, index)
    }

    /// Element at logical position `i`.
    pub fn logical(&self, i: usize) -> f64 {
        self.at(self.desc.offset_of_logical(i))
    }

    /// All elements in logical order.
    pub fn values(&self) -> Vec<f64> {
        self.desc.offsets().map(|o| self.at(o)).collect()
    }

    /// Encoded bytes of the element at storage index `index`.
    pub fn element(&self, index: usize) -> &[u8] {
        self.desc.dtype().element(&self.bytes, index)
    }

    /// All elements in logical order, encoded as `to`. Values move without
    /// passing through f64 when the types allow it.
    pub fn elements_as(&self, to: DType) -> Vec<u8> {
        let from = self.desc.dtype();
        let size = to.size_in_bytes();
        let mut out = vec![0u8; self.len() * size];
        for (chunk, o) in out.chunks_exact_mut(size).zip(self.desc.offsets()) {
            from.convert_element(self.element(o), to, chunk);
        }
        out
    }

    /// Contiguous f32 contents, if this operand qualifies for helper kernels.
    fn contiguous_f32(&self) -> Option<Vec<f32>> {
        if self.desc.dtype() != DType::F32 || self.desc.logical_stride() != Some(1) {
            return None;
        }
        let start = self.desc.offset() * 4;
        let end = start + self.len() * 4;
        Some(
            self.bytes[start..end]
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<f32>)
                .collect(),
        )
    }
}

/// What a kernel hands back for commit.
#[derive(Debug)]
pub enum Produced {
    /// One value per output element, in logical order.
    Logical(Vec<f64>),
    /// Values keyed by storage index of the output.
    Addressed(Vec<(usize, f64)>),
    /// Raw F32 values in logical order from a helper kernel.
    HelperF32(Vec<f32>),
    /// Elements already encoded in the output dtype, in logical order.
    Encoded(Vec<u8>),
}

/// Everything a kernel may look at.
pub struct KernelInput<'a> {
    pub op: Op,
    pub inputs: &'a [HostArray],
    pub output: &'a ShapeDescriptor,
    pub args: OpArgs<'a>,
    pub planner: &'a TadPlanner,
    pub rng: Option<&'a RandomGenerator>,
    pub element_threshold: usize,
    pub tad_threshold: usize,
    pub helpers: bool,
}

pub type KernelFn = fn(&KernelInput<'_>) -> Result<Produced>;

/// `f(i)` for `i in 0..n`, in parallel from `threshold` elements on.
pub(crate) fn fill<F>(n: usize, threshold: usize, f: F) -> Vec<f64>
where
    F: Fn(usize) -> f64 + Sync + Send,
{
    if n >= threshold.max(1) {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}

fn misrouted(op: &Op, family: &str) -> Error {
    Error::execution(format!("op {op} routed to the {family} kernel"))
}

/// Axis list covering every axis when `dims` is empty.
pub(crate) fn axes_or_all(dims: &[i64], rank: usize) -> Vec<i64> {
    if dims.is_empty() {
        (0..rank as i64).collect()
    } else {
        dims.to_vec()
    }
}

fn helper_transform(op: TransformOp) -> Option<fn(f32) -> f32> {
    let f: fn(f32) -> f32 = match op {
        TransformOp::Abs => f32::abs,
        TransformOp::Neg => |x| -x,
        TransformOp::Square => |x| x * x,
        TransformOp::Sqrt => f32::sqrt,
        TransformOp::Relu => |x| x.max(0.0),
        _ => return None,
    };
    Some(f)
}

fn helper_binary(op: BinaryOp) -> Option<fn(f32, f32) -> f32> {
    let f: fn(f32, f32) -> f32 = match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| a / b,
        BinaryOp::Max => f32::max,
        BinaryOp::Min => f32::min,
        _ => return None,
    };
    Some(f)
}

// Elementwise families

pub fn transform(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::Transform(t) = k.op else {
        return Err(misrouted(&k.op, "transform"));
    };
    let x = &k.inputs[0];
    if t == TransformOp::Identity {
        return Ok(Produced::Encoded(x.elements_as(k.output.dtype())));
    }
    if k.helpers && k.output.dtype() == DType::F32 {
        if let (Some(f), Some(xs)) = (helper_transform(t), x.contiguous_f32()) {
            return Ok(Produced::HelperF32(xs.into_iter().map(f).collect()));
        }
    }
    Ok(Produced::Logical(fill(x.len(), k.element_threshold, |i| {
        t.apply(x.logical(i))
    })))
}

pub fn pairwise(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::Pairwise(b) = k.op else {
        return Err(misrouted(&k.op, "pairwise"));
    };
    let (x, y) = (&k.inputs[0], &k.inputs[1]);
    if b == BinaryOp::Copy {
        return Ok(Produced::Encoded(y.elements_as(k.output.dtype())));
    }
    if k.helpers && k.output.dtype() == DType::F32 {
        if let (Some(f), Some(xs), Some(ys)) =
            (helper_binary(b), x.contiguous_f32(), y.contiguous_f32())
        {
            return Ok(Produced::HelperF32(
                xs.into_iter().zip(ys).map(|(a, c)| f(a, c)).collect(),
            ));
        }
    }
    Ok(Produced::Logical(fill(x.len(), k.element_threshold, |i| {
        b.apply(x.logical(i), y.logical(i))
    })))
}

pub fn scalar(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::Scalar(b) = k.op else {
        return Err(misrouted(&k.op, "scalar"));
    };
    let x = &k.inputs[0];
    let s = match k.inputs.get(1) {
        Some(s) => s.logical(0),
        None => k
            .args
            .t_args
            .first()
            .copied()
            .ok_or_else(|| Error::execution("scalar op has no scalar operand"))?,
    };
    Ok(Produced::Logical(fill(x.len(), k.element_threshold, |i| {
        b.apply(x.logical(i), s)
    })))
}

/// Apply `f(tile, value)` to every element of every tile of `x`, writing to
/// the matching element of the matching tile of the output.
fn along_tiles<F>(k: &KernelInput<'_>, f: F) -> Result<Produced>
where
    F: Fn(usize, usize, f64) -> f64 + Sync + Send,
{
    let x = &k.inputs[0];
    let xp = k.planner.plan(x.desc(), k.args.dimensions)?;
    let zp = k.planner.plan(k.output, k.args.dimensions)?;
    if xp.num_tiles() != zp.num_tiles() || xp.tile_length() != zp.tile_length() {
        return Err(Error::ShapeMismatch {
            expected: x.desc().dims().to_vec(),
            got: k.output.dims().to_vec(),
        });
    }
    let per_tile = |t: usize| -> Vec<(usize, f64)> {
        zp.tile_indices(t)
            .zip(xp.tile_indices(t))
            .enumerate()
            .map(|(j, (zi, xi))| (zi, f(t, j, x.at(xi))))
            .collect()
    };
    let tiles = xp.num_tiles();
    let out: Vec<(usize, f64)> = if tiles >= k.tad_threshold.max(1) {
        (0..tiles).into_par_iter().flat_map_iter(per_tile).collect()
    } else {
        (0..tiles).flat_map(per_tile).collect()
    };
    Ok(Produced::Addressed(out))
}

pub fn scalar_along_dimension(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::ScalarAlongDimension(b) = k.op else {
        return Err(misrouted(&k.op, "scalar_along_dimension"));
    };
    let scalars = k.inputs[1].values();
    along_tiles(k, |t, _, v| b.apply(v, scalars[t]))
}

pub fn broadcast(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::Broadcast(b) = k.op else {
        return Err(misrouted(&k.op, "broadcast"));
    };
    let y = k.inputs[1].values();
    along_tiles(k, |_, j, v| b.apply(v, y[j]))
}

// Reducing families

/// One value per tile of `inputs[0]` over the axes in `dimensions` (all axes
/// when empty). Tile `t` lands at logical position `t` of the output.
fn per_tile<F>(k: &KernelInput<'_>, f: F) -> Result<Produced>
where
    F: Fn(&[f64]) -> f64 + Sync + Send,
{
    let x = &k.inputs[0];
    let axes = axes_or_all(k.args.dimensions, x.desc().rank());
    let pack = k.planner.plan(x.desc(), &axes)?;
    let n = k.output.length();
    // Empty inputs still produce one reduced value per kept position.
    let threshold = if pack.num_tiles() >= k.tad_threshold.max(1) {
        0
    } else {
        usize::MAX
    };
    Ok(Produced::Logical(fill(n, threshold, |t| {
        if t < pack.num_tiles() {
            let tile: Vec<f64> = pack.tile_indices(t).map(|i| x.at(i)).collect();
            f(&tile)
        } else {
            f(&[])
        }
    })))
}

pub fn reduce(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::Reduce(r) = k.op else {
        return Err(misrouted(&k.op, "reduce"));
    };
    per_tile(k, |tile| r.reduce(tile.iter().copied()))
}

pub fn index_reduce(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::IndexReduce(r) = k.op else {
        return Err(misrouted(&k.op, "index_reduce"));
    };
    per_tile(k, |tile| r.reduce(tile.iter().copied()))
}

pub fn summary_stats(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::SummaryStats(s) = k.op else {
        return Err(misrouted(&k.op, "summary_stats"));
    };
    let bias_corrected = k.args.b_args.first().copied().unwrap_or(false);
    per_tile(k, |tile| s.reduce(tile, bias_corrected))
}

pub fn reduce3(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::Reduce3(r) = k.op else {
        return Err(misrouted(&k.op, "reduce3"));
    };
    let (x, y) = (&k.inputs[0], &k.inputs[1]);
    let axes = axes_or_all(k.args.dimensions, x.desc().rank());
    let xp = k.planner.plan(x.desc(), &axes)?;
    let yp = k.planner.plan(y.desc(), &axes)?;
    let threshold = if xp.num_tiles() >= k.tad_threshold.max(1) {
        0
    } else {
        usize::MAX
    };
    Ok(Produced::Logical(fill(k.output.length(), threshold, |t| {
        if t < xp.num_tiles() {
            let pairs = xp
                .tile_indices(t)
                .zip(yp.tile_indices(t))
                .map(|(a, b)| (x.at(a), y.at(b)));
            r.reduce(pairs)
        } else {
            r.reduce(std::iter::empty())
        }
    })))
}

// Random

pub fn random(k: &KernelInput<'_>) -> Result<Produced> {
    let Op::Random(r) = k.op else {
        return Err(misrouted(&k.op, "random"));
    };
    let rng = k
        .rng
        .ok_or_else(|| Error::execution("random op needs a bound random generator"))?;
    let arg = |i: usize, default: f64| k.args.t_args.get(i).copied().unwrap_or(default);
    let base = rng.node_state();
    let n = k.output.length();
    let values = match r {
        RandomOp::Uniform => {
            let (lo, hi) = (arg(0, 0.0), arg(1, 1.0));
            fill(n, k.element_threshold, |i| {
                rng.relative_uniform(base + i as i64, lo, hi)
            })
        }
        RandomOp::Gaussian => {
            let (mean, std) = (arg(0, 0.0), arg(1, 1.0));
            fill(n, k.element_threshold, |i| {
                rng.relative_gaussian(base + i as i64, mean, std)
            })
        }
        RandomOp::Bernoulli => {
            let p = arg(0, 0.5);
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::execution(format!(
                    "bernoulli probability {p} outside [0, 1]"
                )));
            }
            fill(n, k.element_threshold, |i| {
                rng.relative_bernoulli(base + i as i64, p)
            })
        }
    };
    Ok(Produced::Logical(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{DataBuffer, EmulatedRuntime, Order, ShapeRegistry};

    fn host(values: &[f64], dims: &[usize]) -> HostArray {
        let rt = Arc::new(EmulatedRuntime::host_only());
        let buf = DataBuffer::from_slice(rt, values).unwrap();
        let desc = ShapeDescriptor::dense(dims, DType::F64, Order::C).unwrap();
        HostArray::snapshot(&Operand::new(Arc::new(buf), Arc::new(desc))).unwrap()
    }

    fn run(op: Op, inputs: &[HostArray], out: &ShapeDescriptor, dims: &[i64]) -> Produced {
        let planner = TadPlanner::new(Arc::new(ShapeRegistry::new()));
        let k = KernelInput {
            op,
            inputs,
            output: out,
            args: OpArgs {
                dimensions: dims,
                ..Default::default()
            },
            planner: &planner,
            rng: None,
            element_threshold: 4,
            tad_threshold: 2,
            helpers: false,
        };
        let f = match op.family() {
            crate::exec::ops::OpFamily::Reduce => reduce,
            crate::exec::ops::OpFamily::Broadcast => broadcast,
            _ => transform,
        };
        f(&k).unwrap()
    }

    #[test]
    fn test_fill_parallel_matches_serial() {
        let a = fill(100, 1, |i| i as f64 * 2.0);
        let b = fill(100, usize::MAX, |i| i as f64 * 2.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_reduce_rows() {
        let x = host(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let out = ShapeDescriptor::dense(vec![2], DType::F64, Order::C).unwrap();
        let Produced::Logical(v) = run(Op::Reduce(crate::exec::ops::ReduceOp::Sum), &[x], &out, &[1])
        else {
            panic!("expected logical output");
        };
        assert_eq!(v, vec![6.0, 15.0]);
    }

    #[test]
    fn test_broadcast_addresses_every_element_once() {
        let x = host(&[0.0; 6], &[2, 3]);
        let y = host(&[1.0, 2.0, 3.0], &[3]);
        let out = ShapeDescriptor::dense(vec![2, 3], DType::F64, Order::C).unwrap();
        let Produced::Addressed(mut v) = run(Op::Broadcast(BinaryOp::Add), &[x, y], &out, &[1])
        else {
            panic!("expected addressed output");
        };
        v.sort_by_key(|(i, _)| *i);
        let values: Vec<f64> = v.iter().map(|(_, x)| *x).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_transform_reads_strided_input() {
        let x = host(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let t = HostArray {
            desc: Arc::new(x.desc().transpose(0, 1).unwrap()),
            bytes: x.bytes.clone(),
        };
        let out = ShapeDescriptor::dense(vec![2, 2], DType::F64, Order::C).unwrap();
        let Produced::Logical(v) = run(Op::Transform(TransformOp::Neg), &[t], &out, &[]) else {
            panic!("expected logical output");
        };
        assert_eq!(v, vec![-1.0, -3.0, -2.0, -4.0]);
    }
}
