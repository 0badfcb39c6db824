// OpRegistry — Family table: arity, TAD requirement, shape rule, kernel
//
// Built once per engine. Dispatch looks up the family of the requested op
// and runs the generic pipeline with that family's entries:
//
//   arity check → infer output shape → validate/allocate outputs
//               → read inputs → kernel → commit output
//
// Shape rules only look at descriptors and arguments, so callers can ask for
// output shapes (`calculate_output_shapes`) before allocating anything.

use std::collections::HashMap;
use std::fmt;

use kestrel_core::tad::normalize_axes;
use kestrel_core::{DType, Error, Order, Result, ShapeDescriptor};

use crate::exec::context::OpArgs;
use crate::exec::kernels::{self, KernelFn};
use crate::exec::ops::{BinaryOp, Op, OpFamily, ReduceOp};

/// Output-shape rule of a family.
pub type InferFn = fn(&Op, &[&ShapeDescriptor], &OpArgs<'_>) -> Result<Vec<ShapeDescriptor>>;

/// Calling contract of one op family.
#[derive(Clone, Copy)]
pub struct FamilySpec {
    pub family: OpFamily,
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub outputs: usize,
    /// Kernels iterate TAD tiles of the input(s).
    pub requires_tad: bool,
    /// Output has fewer elements than the input; bound outputs only need a
    /// matching element count (keep-dims layouts are accepted).
    pub reducing: bool,
    pub infer: InferFn,
    pub kernel: KernelFn,
}

impl fmt::Debug for FamilySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FamilySpec")
            .field("family", &self.family)
            .field("inputs", &(self.min_inputs..=self.max_inputs))
            .field("outputs", &self.outputs)
            .field("requires_tad", &self.requires_tad)
            .field("reducing", &self.reducing)
            .finish_non_exhaustive()
    }
}

/// One entry of [`OpRegistry::all_operations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpInfo {
    pub family: OpFamily,
    pub code: i32,
    pub name: &'static str,
}

/// Table of op families.
#[derive(Debug)]
pub struct OpRegistry {
    families: HashMap<OpFamily, FamilySpec>,
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OpRegistry {
    pub fn new() -> Self {
        let specs = [
            FamilySpec {
                family: OpFamily::Transform,
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                requires_tad: false,
                reducing: false,
                infer: infer_same,
                kernel: kernels::transform,
            },
            FamilySpec {
                family: OpFamily::Pairwise,
                min_inputs: 2,
                max_inputs: 2,
                outputs: 1,
                requires_tad: false,
                reducing: false,
                infer: infer_pairwise,
                kernel: kernels::pairwise,
            },
            FamilySpec {
                family: OpFamily::Scalar,
                min_inputs: 1,
                max_inputs: 2,
                outputs: 1,
                requires_tad: false,
                reducing: false,
                infer: infer_scalar,
                kernel: kernels::scalar,
            },
            FamilySpec {
                family: OpFamily::ScalarAlongDimension,
                min_inputs: 2,
                max_inputs: 2,
                outputs: 1,
                requires_tad: true,
                reducing: false,
                infer: infer_along_dimension,
                kernel: kernels::scalar_along_dimension,
            },
            FamilySpec {
                family: OpFamily::Broadcast,
                min_inputs: 2,
                max_inputs: 2,
                outputs: 1,
                requires_tad: true,
                reducing: false,
                infer: infer_broadcast,
                kernel: kernels::broadcast,
            },
            FamilySpec {
                family: OpFamily::Reduce,
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                requires_tad: true,
                reducing: true,
                infer: infer_reduce,
                kernel: kernels::reduce,
            },
            FamilySpec {
                family: OpFamily::IndexReduce,
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                requires_tad: true,
                reducing: true,
                infer: infer_reduce,
                kernel: kernels::index_reduce,
            },
            FamilySpec {
                family: OpFamily::Reduce3,
                min_inputs: 2,
                max_inputs: 2,
                outputs: 1,
                requires_tad: true,
                reducing: true,
                infer: infer_reduce3,
                kernel: kernels::reduce3,
            },
            FamilySpec {
                family: OpFamily::SummaryStats,
                min_inputs: 1,
                max_inputs: 1,
                outputs: 1,
                requires_tad: true,
                reducing: true,
                infer: infer_reduce,
                kernel: kernels::summary_stats,
            },
            FamilySpec {
                family: OpFamily::Random,
                min_inputs: 0,
                max_inputs: 1,
                outputs: 1,
                requires_tad: false,
                reducing: false,
                infer: infer_random,
                kernel: kernels::random,
            },
        ];
        OpRegistry {
            families: specs.into_iter().map(|s| (s.family, s)).collect(),
        }
    }

    pub fn spec(&self, family: OpFamily) -> Result<&FamilySpec> {
        self.families
            .get(&family)
            .ok_or_else(|| Error::execution(format!("op family {family} is not registered")))
    }

    /// Resolve a numeric (family, code) identifier.
    pub fn resolve(&self, family: OpFamily, code: i32) -> Result<Op> {
        self.spec(family)?;
        Op::from_code(family, code)
    }

    /// Every registered op, ordered by family then code.
    pub fn all_operations(&self) -> Vec<OpInfo> {
        let mut out: Vec<OpInfo> = Op::all()
            .into_iter()
            .filter(|op| self.families.contains_key(&op.family()))
            .map(|op| OpInfo {
                family: op.family(),
                code: op.code(),
                name: op.name(),
            })
            .collect();
        out.sort_by_key(|i| (i.family, i.code));
        out
    }

    /// Output descriptors `op` would produce for `inputs` and `args`.
    pub fn calculate_output_shapes(
        &self,
        op: &Op,
        inputs: &[&ShapeDescriptor],
        args: &OpArgs<'_>,
    ) -> Result<Vec<ShapeDescriptor>> {
        let spec = self.spec(op.family())?;
        check_arity(spec, inputs.len())?;
        (spec.infer)(op, inputs, args)
    }
}

pub(crate) fn check_arity(spec: &FamilySpec, got: usize) -> Result<()> {
    if got < spec.min_inputs || got > spec.max_inputs {
        let want = if spec.min_inputs == spec.max_inputs {
            spec.min_inputs.to_string()
        } else {
            format!("{}..={}", spec.min_inputs, spec.max_inputs)
        };
        return Err(Error::execution(format!(
            "{} ops take {want} inputs, got {got}",
            spec.family
        )));
    }
    Ok(())
}

// Shape rules

fn dense(dims: &[usize], dtype: DType) -> Result<ShapeDescriptor> {
    ShapeDescriptor::dense(dims, dtype, Order::C)
}

fn float_or_default(dtype: DType) -> DType {
    if dtype.is_float() {
        dtype
    } else {
        DType::F32
    }
}

fn infer_same(_: &Op, inputs: &[&ShapeDescriptor], _: &OpArgs<'_>) -> Result<Vec<ShapeDescriptor>> {
    let x = inputs[0];
    Ok(vec![dense(x.dims(), x.dtype())?])
}

fn binary_dtype(op: &BinaryOp, x: DType) -> DType {
    match op {
        BinaryOp::Equals | BinaryOp::GreaterThan | BinaryOp::LessThan => DType::Bool,
        _ => x,
    }
}

fn binary_of(op: &Op) -> Option<&BinaryOp> {
    match op {
        Op::Pairwise(b) | Op::Scalar(b) | Op::ScalarAlongDimension(b) | Op::Broadcast(b) => Some(b),
        _ => None,
    }
}

fn infer_pairwise(
    op: &Op,
    inputs: &[&ShapeDescriptor],
    _: &OpArgs<'_>,
) -> Result<Vec<ShapeDescriptor>> {
    let (x, y) = (inputs[0], inputs[1]);
    if x.dims() != y.dims() && x.length() != y.length() {
        return Err(Error::ShapeMismatch {
            expected: x.dims().to_vec(),
            got: y.dims().to_vec(),
        });
    }
    let dtype = binary_of(op).map_or(x.dtype(), |b| binary_dtype(b, x.dtype()));
    Ok(vec![dense(x.dims(), dtype)?])
}

fn infer_scalar(
    op: &Op,
    inputs: &[&ShapeDescriptor],
    args: &OpArgs<'_>,
) -> Result<Vec<ShapeDescriptor>> {
    let x = inputs[0];
    match inputs.get(1) {
        Some(s) if s.length() != 1 => {
            return Err(Error::shape(format!(
                "scalar operand must hold one element, got {:?}",
                s.dims()
            )))
        }
        None if args.t_args.is_empty() => {
            return Err(Error::execution(
                "scalar op needs a scalar input or a float argument",
            ))
        }
        _ => {}
    }
    let dtype = binary_of(op).map_or(x.dtype(), |b| binary_dtype(b, x.dtype()));
    Ok(vec![dense(x.dims(), dtype)?])
}

/// Product of the extents on the axes named by `dims`.
fn tile_length(x: &ShapeDescriptor, dims: &[i64]) -> Result<usize> {
    let axes = normalize_axes(dims, x.rank())?;
    Ok(axes.iter().map(|&a| x.dims()[a]).product())
}

fn infer_along_dimension(
    op: &Op,
    inputs: &[&ShapeDescriptor],
    args: &OpArgs<'_>,
) -> Result<Vec<ShapeDescriptor>> {
    let (x, scalars) = (inputs[0], inputs[1]);
    if args.dimensions.is_empty() {
        return Err(Error::execution("scalar-along-dimension needs dimensions"));
    }
    let tiles = x.length() / tile_length(x, args.dimensions)?.max(1);
    if scalars.length() != tiles {
        return Err(Error::shape(format!(
            "{} scalars supplied for {tiles} tiles",
            scalars.length()
        )));
    }
    let dtype = binary_of(op).map_or(x.dtype(), |b| binary_dtype(b, x.dtype()));
    Ok(vec![dense(x.dims(), dtype)?])
}

fn infer_broadcast(
    op: &Op,
    inputs: &[&ShapeDescriptor],
    args: &OpArgs<'_>,
) -> Result<Vec<ShapeDescriptor>> {
    let (x, y) = (inputs[0], inputs[1]);
    if args.dimensions.is_empty() {
        return Err(Error::execution("broadcast needs dimensions"));
    }
    let tile = tile_length(x, args.dimensions)?;
    if y.length() != tile {
        let axes = normalize_axes(args.dimensions, x.rank())?;
        return Err(Error::ShapeMismatch {
            expected: axes.iter().map(|&a| x.dims()[a]).collect(),
            got: y.dims().to_vec(),
        });
    }
    let dtype = binary_of(op).map_or(x.dtype(), |b| binary_dtype(b, x.dtype()));
    Ok(vec![dense(x.dims(), dtype)?])
}

/// Kept extents after reducing `dims` (all axes when empty). With
/// `keep_dims` the reduced axes stay as extent 1.
fn reduced_dims(x: &ShapeDescriptor, dims: &[i64], keep_dims: bool) -> Result<Vec<usize>> {
    let axes = if dims.is_empty() {
        (0..x.rank()).collect()
    } else {
        normalize_axes(dims, x.rank())?
    };
    Ok(x.dims()
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keep_dims) {
            (false, _) => Some(d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect())
}

fn infer_reduce(
    op: &Op,
    inputs: &[&ShapeDescriptor],
    args: &OpArgs<'_>,
) -> Result<Vec<ShapeDescriptor>> {
    let x = inputs[0];
    let keep = args.b_args.first().copied().unwrap_or(false) && !matches!(op, Op::SummaryStats(_));
    let dims = reduced_dims(x, args.dimensions, keep)?;
    let dtype = match op {
        Op::Reduce(ReduceOp::CountNonZero) | Op::IndexReduce(_) => DType::I64,
        Op::Reduce(ReduceOp::Any | ReduceOp::All) => DType::Bool,
        Op::Reduce(ReduceOp::Mean | ReduceOp::Norm2) | Op::SummaryStats(_) => {
            float_or_default(x.dtype())
        }
        _ => x.dtype(),
    };
    Ok(vec![dense(&dims, dtype)?])
}

fn infer_reduce3(
    _: &Op,
    inputs: &[&ShapeDescriptor],
    args: &OpArgs<'_>,
) -> Result<Vec<ShapeDescriptor>> {
    let (x, y) = (inputs[0], inputs[1]);
    if x.dims() != y.dims() {
        return Err(Error::ShapeMismatch {
            expected: x.dims().to_vec(),
            got: y.dims().to_vec(),
        });
    }
    let dims = reduced_dims(x, args.dimensions, false)?;
    Ok(vec![dense(&dims, float_or_default(x.dtype()))?])
}

fn infer_random(
    op: &Op,
    inputs: &[&ShapeDescriptor],
    args: &OpArgs<'_>,
) -> Result<Vec<ShapeDescriptor>> {
    let dtype = args.d_args.first().copied().unwrap_or(DType::F32);
    if !dtype.is_float() {
        return Err(Error::UnsupportedDType {
            op: op.to_string(),
            dtype,
        });
    }
    let dims: Vec<usize> = match inputs.first() {
        Some(template) => template.dims().to_vec(),
        None => args
            .i_args
            .iter()
            .map(|&d| {
                usize::try_from(d).map_err(|_| Error::shape(format!("negative extent {d}")))
            })
            .collect::<Result<_>>()?,
    };
    Ok(vec![dense(&dims, dtype)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ops::{IndexReduceOp, RandomOp, TransformOp};

    fn desc(dims: &[usize], dtype: DType) -> ShapeDescriptor {
        ShapeDescriptor::dense(dims, dtype, Order::C).unwrap()
    }

    #[test]
    fn test_every_family_registered() {
        let reg = OpRegistry::new();
        for f in OpFamily::ALL {
            assert!(reg.spec(f).is_ok());
        }
        let ops = reg.all_operations();
        assert_eq!(ops.len(), Op::all().len());
        assert!(ops.windows(2).all(|w| (w[0].family, w[0].code) < (w[1].family, w[1].code)));
    }

    #[test]
    fn test_reduce_shapes() {
        let reg = OpRegistry::new();
        let x = desc(&[3, 4, 5], DType::F32);
        let dims = [1i64];
        let args = OpArgs {
            dimensions: &dims,
            ..Default::default()
        };
        let out = reg
            .calculate_output_shapes(&Op::Reduce(ReduceOp::Sum), &[&x], &args)
            .unwrap();
        assert_eq!(out[0].dims(), &[3, 5]);

        let keep = [true];
        let args = OpArgs {
            dimensions: &dims,
            b_args: &keep,
            ..Default::default()
        };
        let out = reg
            .calculate_output_shapes(&Op::Reduce(ReduceOp::Sum), &[&x], &args)
            .unwrap();
        assert_eq!(out[0].dims(), &[3, 1, 5]);

        let out = reg
            .calculate_output_shapes(
                &Op::IndexReduce(IndexReduceOp::IndexMax),
                &[&x],
                &OpArgs::default(),
            )
            .unwrap();
        assert!(out[0].is_scalar());
        assert_eq!(out[0].dtype(), DType::I64);
    }

    #[test]
    fn test_arity_checked() {
        let reg = OpRegistry::new();
        let x = desc(&[2], DType::F32);
        let err = reg
            .calculate_output_shapes(&Op::Pairwise(BinaryOp::Add), &[&x], &OpArgs::default())
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[test]
    fn test_broadcast_shape_rule() {
        let reg = OpRegistry::new();
        let x = desc(&[3, 4], DType::F32);
        let y = desc(&[4], DType::F32);
        let bad = desc(&[3], DType::F32);
        let dims = [1i64];
        let args = OpArgs {
            dimensions: &dims,
            ..Default::default()
        };
        let op = Op::Broadcast(BinaryOp::Add);
        assert_eq!(
            reg.calculate_output_shapes(&op, &[&x, &y], &args).unwrap()[0].dims(),
            &[3, 4]
        );
        assert!(reg.calculate_output_shapes(&op, &[&x, &bad], &args).is_err());
    }

    #[test]
    fn test_random_shape_from_args() {
        let reg = OpRegistry::new();
        let ints = [2i64, 3];
        let args = OpArgs {
            i_args: &ints,
            ..Default::default()
        };
        let out = reg
            .calculate_output_shapes(&Op::Random(RandomOp::Uniform), &[], &args)
            .unwrap();
        assert_eq!(out[0].dims(), &[2, 3]);

        let ints_dt = [DType::I32];
        let args = OpArgs {
            i_args: &ints,
            d_args: &ints_dt,
            ..Default::default()
        };
        assert!(matches!(
            reg.calculate_output_shapes(&Op::Random(RandomOp::Uniform), &[], &args),
            Err(Error::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn test_comparison_outputs_bool() {
        let reg = OpRegistry::new();
        let x = desc(&[2], DType::F64);
        let out = reg
            .calculate_output_shapes(&Op::Pairwise(BinaryOp::Equals), &[&x, &x], &OpArgs::default())
            .unwrap();
        assert_eq!(out[0].dtype(), DType::Bool);
        let out = reg
            .calculate_output_shapes(&Op::Transform(TransformOp::Exp), &[&x], &OpArgs::default())
            .unwrap();
        assert_eq!(out[0].dtype(), DType::F64);
    }
}
