// =============================================================================
// Exec — Op dispatch
// =============================================================================
//
// Everything between "run op X on these buffers" and the bytes landing in
// the output:
//
//   ops       op families, stable codes, scalar arithmetic
//   registry  per-family arity, TAD requirement, shape rule, kernel
//   context   bindings + arguments for one invocation
//   kernels   host kernels over input snapshots
//   dispatch  the generic pipeline and the per-family entry points
//   special   data movement outside the families (gather, scatter, sort, ...)
//
// USAGE:
//   let engine = Engine::default();
//   let x = engine.operand_from_slice(&[1.0f32, 2.0, 3.0], &[3])?;
//   let mut ctx = engine.context();
//   ctx.set_input(0, x);
//   ctx.set_t_args(vec![1.0]);
//   ctx.execute(&engine, Op::Scalar(BinaryOp::Add))?;
//   let y = ctx.output(0);

pub mod context;
pub mod dispatch;
pub mod kernels;
pub mod ops;
pub mod registry;
mod special;

pub use context::{ExecutionContext, ExecutionMode, OpArgs, Operand};
pub use dispatch::LaunchExtras;
pub use ops::{
    BinaryOp, IndexReduceOp, Op, OpFamily, RandomOp, Reduce3Op, ReduceOp, SummaryStatsOp,
    TransformOp,
};
pub use registry::{FamilySpec, OpInfo, OpRegistry};
pub use special::ArrayInspection;
