// Dispatch — the generic execution pipeline and per-family entry points
//
//   1. gather inputs, check arity and operand/buffer consistency
//   2. infer the output descriptor from input shapes + arguments
//   3. validate the bound output, alias input 0 (in-place), or allocate
//   4. refuse aliasing without the in-place flag, and inputs resident only
//      on a device other than the context's
//   5. snapshot inputs, run the family kernel, commit to the output
//
// Steps 1–4 only look at metadata, so every validation error is raised
// before any data moves. Failures are recorded in the engine's last-error
// slot on the way out.

use std::sync::Arc;
use std::time::Instant;

use kestrel_core::{
    Coherence, DataBuffer, DType, Error, RandomGenerator, Result, ShapeDescriptor, StreamHandle,
};

use crate::engine::Engine;
use crate::exec::context::{ExecutionContext, Operand};
use crate::exec::kernels::{axes_or_all, HostArray, KernelInput, Produced};
use crate::exec::ops::{BinaryOp, Op, OpFamily, TransformOp};
use crate::exec::registry::{check_arity, FamilySpec};

/// Stream/device handles and flags passed to the per-family entry points.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchExtras {
    pub stream: Option<StreamHandle>,
    /// Write into input 0 when no output is given.
    pub in_place: bool,
}

impl LaunchExtras {
    pub fn on_stream(stream: StreamHandle) -> Self {
        LaunchExtras {
            stream: Some(stream),
            in_place: false,
        }
    }

    pub fn in_place() -> Self {
        LaunchExtras {
            stream: None,
            in_place: true,
        }
    }
}

fn overlaps(a: &DataBuffer, b: &DataBuffer) -> bool {
    a.same_storage(b) && a.offset() < b.offset() + b.len() && b.offset() < a.offset() + a.len()
}

fn check_operand(role: &str, index: usize, operand: &Operand) -> Result<()> {
    let buf = &operand.buffer;
    if buf.is_released() {
        return Err(Error::UseAfterRelease { buffer: buf.id() });
    }
    if operand.shape.dtype() != buf.dtype() {
        return Err(Error::execution(format!(
            "{role} {index}: shape says {} but buffer {} holds {}",
            operand.shape.dtype(),
            buf.id(),
            buf.dtype()
        )));
    }
    if operand.shape.required_len() > buf.len() {
        return Err(Error::shape(format!(
            "{role} {index}: shape {:?} needs {} elements, buffer {} has {}",
            operand.dims(),
            operand.shape.required_len(),
            buf.id(),
            buf.len()
        )));
    }
    Ok(())
}

/// Dtype combinations the kernels refuse.
fn check_dtypes(op: &Op, inputs: &[Operand], output: &Operand) -> Result<()> {
    let unsupported = |dtype: DType| Error::UnsupportedDType {
        op: op.to_string(),
        dtype,
    };
    let bool_input = inputs.iter().find(|o| o.dtype().is_bool());
    match op {
        Op::Transform(
            TransformOp::Exp
            | TransformOp::Log
            | TransformOp::Sqrt
            | TransformOp::Sigmoid
            | TransformOp::Tanh
            | TransformOp::Sin
            | TransformOp::Cos
            | TransformOp::Reciprocal,
        ) => {
            if let Some(o) = bool_input {
                return Err(unsupported(o.dtype()));
            }
        }
        Op::Pairwise(b) | Op::Scalar(b) | Op::ScalarAlongDimension(b) | Op::Broadcast(b) => {
            let arithmetic = !matches!(
                b,
                BinaryOp::Copy
                    | BinaryOp::Max
                    | BinaryOp::Min
                    | BinaryOp::Equals
                    | BinaryOp::GreaterThan
                    | BinaryOp::LessThan
            );
            if arithmetic {
                if let Some(o) = bool_input {
                    return Err(unsupported(o.dtype()));
                }
            }
        }
        Op::Random(_) if !output.dtype().is_float() => return Err(unsupported(output.dtype())),
        _ => {}
    }
    Ok(())
}

impl Engine {
    /// Run `op` with the bindings and arguments of `ctx`. When no output is
    /// bound (and the op is not in place), a fresh output is allocated and
    /// bound as output 0.
    #[tracing::instrument(level = "debug", skip_all, fields(op = %op, node = ctx.node_id()))]
    pub fn execute(&self, ctx: &mut ExecutionContext, op: Op) -> Result<()> {
        self.stats.record_dispatch();
        let result = self.dispatch(ctx, op);
        if result.is_err() {
            self.stats.record_failure();
        }
        self.last_error().track(result)
    }

    fn dispatch(&self, ctx: &mut ExecutionContext, op: Op) -> Result<()> {
        let started = self.config().verbose.then(Instant::now);
        let spec = self.ops().spec(op.family())?;
        let inputs = gather_inputs(ctx)?;
        check_arity(spec, inputs.len())?;
        for (i, operand) in inputs.iter().enumerate() {
            check_operand("input", i, operand)?;
        }

        let descs: Vec<&ShapeDescriptor> = inputs.iter().map(|o| o.shape.as_ref()).collect();
        let mut inferred = (spec.infer)(&op, &descs, &ctx.args())?;
        if inferred.len() != spec.outputs {
            return Err(Error::execution(format!(
                "shape rule for {op} produced {} outputs, family declares {}",
                inferred.len(),
                spec.outputs
            )));
        }
        let want = inferred.remove(0);
        if spec.requires_tad {
            // plan before any data moves so bad axis sets fail early
            let x = &inputs[0].shape;
            self.tads().plan(x, &axes_or_all(ctx.args().dimensions, x.rank()))?;
        }
        let (output, fresh) = self.resolve_output(ctx, spec, &inputs, want)?;
        check_dtypes(&op, &inputs, &output)?;

        if !ctx.is_in_place() {
            if let Some(i) = inputs.iter().position(|x| overlaps(&x.buffer, &output.buffer)) {
                return Err(Error::execution(format!(
                    "output aliases input {i}; set the in-place flag to allow it"
                )));
            }
        }
        self.check_residency(ctx, &inputs, &output)?;

        let hosts = inputs
            .iter()
            .map(HostArray::snapshot)
            .collect::<Result<Vec<_>>>()?;
        let helpers_before = self.stats.helper_hits();
        let produced = {
            let config = self.config();
            let kernel_input = KernelInput {
                op,
                inputs: &hosts,
                output: &output.shape,
                args: ctx.args(),
                planner: self.tads(),
                rng: ctx.random(),
                element_threshold: config.element_threshold,
                tad_threshold: config.tad_threshold,
                helpers: ctx.helpers_allowed(),
            };
            (spec.kernel)(&kernel_input)?
        };
        if matches!(produced, Produced::HelperF32(_)) {
            self.stats.record_helper();
        }
        commit(&output, produced)?;

        if let Some(stream) = ctx.stream() {
            output.buffer.sync_to_secondary()?;
            self.runtime().synchronize_stream(stream)?;
        }
        if let (Op::Random(_), Some(rng)) = (op, ctx.random_mut()) {
            rng.skip(output.shape.length() as i64);
        }
        if self.config().debug {
            tracing::debug!(
                op = %op,
                output = ?output.dims(),
                fresh,
                helper = self.stats.helper_hits() > helpers_before,
                "dispatched"
            );
        }
        if let Some(started) = started {
            let elapsed = started.elapsed();
            self.stats.record_timing(elapsed);
            let input_dims: Vec<&[usize]> = inputs.iter().map(|x| x.dims()).collect();
            tracing::info!(
                op = %op,
                inputs = ?input_dims,
                output = ?output.dims(),
                elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
                "dispatch timing"
            );
        }
        if fresh || ctx.output(0).is_none() {
            ctx.set_output(0, output);
        }
        Ok(())
    }

    fn resolve_output(
        &self,
        ctx: &ExecutionContext,
        spec: &FamilySpec,
        inputs: &[Operand],
        want: ShapeDescriptor,
    ) -> Result<(Operand, bool)> {
        if let Some(bound) = ctx.output(0) {
            check_operand("output", 0, bound)?;
            let lenient = spec.reducing || ctx.shape_function_override();
            let fits = bound.dims() == want.dims()
                || (lenient && bound.shape.length() == want.length());
            if !fits {
                return Err(Error::ShapeMismatch {
                    expected: want.dims().to_vec(),
                    got: bound.dims().to_vec(),
                });
            }
            return Ok((bound.clone(), false));
        }

        if ctx.is_in_place() {
            let target = inputs.first().ok_or_else(|| {
                Error::execution("in-place execution needs an input to write into")
            })?;
            if target.dims() != want.dims() {
                return Err(Error::execution(format!(
                    "in-place output must have the shape of input 0: {:?} vs {:?}",
                    want.dims(),
                    target.dims()
                )));
            }
            return Ok((target.clone(), false));
        }

        let buffer = DataBuffer::allocate(
            Arc::clone(self.runtime()),
            want.length(),
            want.dtype(),
            false,
        )?;
        if let Some(device) = ctx.device() {
            buffer.set_device_id(device)?;
        }
        let shape = self.shapes().intern(want);
        Ok((Operand::new(Arc::new(buffer), shape), true))
    }

    fn check_residency(
        &self,
        ctx: &ExecutionContext,
        inputs: &[Operand],
        output: &Operand,
    ) -> Result<()> {
        let Some(device) = ctx.device() else {
            return Ok(());
        };
        for (role, operand) in inputs
            .iter()
            .map(|o| ("input", o))
            .chain(std::iter::once(("output", output)))
        {
            let buf = &operand.buffer;
            if buf.locality() == Coherence::SecondaryValid && buf.device_id() != device {
                return Err(Error::execution(format!(
                    "{role} buffer {} is only valid on device {}, context runs on device {device}; \
                     transfer it first",
                    buf.id(),
                    buf.device_id()
                )));
            }
        }
        Ok(())
    }

    fn launch(
        &self,
        extras: &LaunchExtras,
        op: Op,
        inputs: &[&Operand],
        output: Option<&Operand>,
        fill: impl FnOnce(&mut ExecutionContext),
    ) -> Result<Operand> {
        let mut ctx = self.context();
        for (i, x) in inputs.iter().enumerate() {
            ctx.set_input(i, (*x).clone());
        }
        if let Some(z) = output {
            ctx.set_output(0, z.clone());
        }
        if let Some(stream) = extras.stream {
            ctx.bind_stream(stream);
        }
        ctx.set_in_place(extras.in_place);
        fill(&mut ctx);
        self.execute(&mut ctx, op)?;
        ctx.output(0)
            .cloned()
            .ok_or_else(|| Error::execution("dispatch finished without an output"))
    }

    fn resolve(&self, family: OpFamily, code: i32) -> Result<Op> {
        self.last_error().track(self.ops().resolve(family, code))
    }

    /// Index of the winning element per tile along `dimensions`.
    pub fn exec_index_reduce(
        &self,
        extras: &LaunchExtras,
        code: i32,
        x: &Operand,
        z: Option<&Operand>,
        dimensions: &[i64],
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::IndexReduce, code)?;
        self.launch(extras, op, &[x], z, |ctx| ctx.set_dimensions(dimensions))
    }

    /// Reduce along `dimensions` (all axes when empty).
    pub fn exec_reduce(
        &self,
        extras: &LaunchExtras,
        code: i32,
        x: &Operand,
        z: Option<&Operand>,
        dimensions: &[i64],
        keep_dims: bool,
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::Reduce, code)?;
        self.launch(extras, op, &[x], z, |ctx| {
            ctx.set_dimensions(dimensions);
            ctx.set_b_args(vec![keep_dims]);
        })
    }

    /// Pairwise reduction of `x` and `y` along `dimensions`.
    pub fn exec_reduce3(
        &self,
        extras: &LaunchExtras,
        code: i32,
        x: &Operand,
        y: &Operand,
        z: Option<&Operand>,
        dimensions: &[i64],
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::Reduce3, code)?;
        self.launch(extras, op, &[x, y], z, |ctx| ctx.set_dimensions(dimensions))
    }

    /// Combine every tile of `x` along `dimensions` with `y`.
    pub fn exec_broadcast(
        &self,
        extras: &LaunchExtras,
        code: i32,
        x: &Operand,
        y: &Operand,
        z: Option<&Operand>,
        dimensions: &[i64],
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::Broadcast, code)?;
        self.launch(extras, op, &[x, y], z, |ctx| ctx.set_dimensions(dimensions))
    }

    pub fn exec_pairwise(
        &self,
        extras: &LaunchExtras,
        code: i32,
        x: &Operand,
        y: &Operand,
        z: Option<&Operand>,
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::Pairwise, code)?;
        self.launch(extras, op, &[x, y], z, |_| {})
    }

    pub fn exec_scalar(
        &self,
        extras: &LaunchExtras,
        code: i32,
        x: &Operand,
        scalar: f64,
        z: Option<&Operand>,
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::Scalar, code)?;
        self.launch(extras, op, &[x], z, |ctx| ctx.set_t_args(vec![scalar]))
    }

    /// One scalar per tile of `x` along `dimensions`.
    pub fn exec_scalar_along_dimension(
        &self,
        extras: &LaunchExtras,
        code: i32,
        x: &Operand,
        scalars: &Operand,
        z: Option<&Operand>,
        dimensions: &[i64],
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::ScalarAlongDimension, code)?;
        self.launch(extras, op, &[x, scalars], z, |ctx| {
            ctx.set_dimensions(dimensions)
        })
    }

    pub fn exec_transform(
        &self,
        extras: &LaunchExtras,
        code: i32,
        x: &Operand,
        z: Option<&Operand>,
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::Transform, code)?;
        self.launch(extras, op, &[x], z, |_| {})
    }

    /// Variance or standard deviation along `dimensions`.
    pub fn exec_summary_stats(
        &self,
        extras: &LaunchExtras,
        code: i32,
        x: &Operand,
        z: Option<&Operand>,
        dimensions: &[i64],
        bias_corrected: bool,
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::SummaryStats, code)?;
        self.launch(extras, op, &[x], z, |ctx| {
            ctx.set_dimensions(dimensions);
            ctx.set_b_args(vec![bias_corrected]);
        })
    }

    /// Fill `z` from `rng`. `params` are the distribution parameters
    /// (`[lo, hi]`, `[mean, std]` or `[p]`). The generator advances past the
    /// values drawn.
    pub fn exec_random(
        &self,
        extras: &LaunchExtras,
        code: i32,
        rng: &mut RandomGenerator,
        z: &Operand,
        params: &[f64],
    ) -> Result<Operand> {
        let op = self.resolve(OpFamily::Random, code)?;
        let mut drawn = rng.clone();
        let out = self.launch(extras, op, &[z], Some(z), |ctx| {
            ctx.set_t_args(params.to_vec());
            ctx.set_d_args(vec![z.dtype()]);
            ctx.set_in_place(true);
            ctx.bind_random(rng.clone());
        })?;
        drawn.skip(out.shape.length() as i64);
        *rng = drawn;
        Ok(out)
    }
}

fn gather_inputs(ctx: &ExecutionContext) -> Result<Vec<Operand>> {
    (0..ctx.input_slots())
        .map(|i| {
            ctx.input(i)
                .cloned()
                .ok_or_else(|| Error::execution(format!("input slot {i} is not bound")))
        })
        .collect()
}

/// Write kernel results into the output's host side.
fn commit(output: &Operand, produced: Produced) -> Result<()> {
    let desc = output.shape.as_ref();
    let dtype = desc.dtype();
    let n = desc.length();
    match &produced {
        Produced::Logical(v) if v.len() != n => {
            return Err(Error::execution(format!(
                "kernel produced {} values for {n} output elements",
                v.len()
            )))
        }
        Produced::HelperF32(v) if v.len() != n => {
            return Err(Error::execution(format!(
                "helper produced {} values for {n} output elements",
                v.len()
            )))
        }
        Produced::Encoded(b) if b.len() != n * dtype.size_in_bytes() => {
            return Err(Error::execution(format!(
                "kernel produced {} bytes for {n} {dtype} output elements",
                b.len()
            )))
        }
        _ => {}
    }
    output.buffer.write_primary(|bytes| match produced {
        Produced::Logical(values) => {
            for (o, v) in desc.offsets().zip(values) {
                dtype.store(bytes, o, v);
            }
        }
        Produced::Addressed(values) => {
            for (o, v) in values {
                dtype.store(bytes, o, v);
            }
        }
        Produced::HelperF32(values) => {
            if dtype == DType::F32 && desc.logical_stride() == Some(1) {
                let start = desc.offset() * 4;
                bytes[start..start + values.len() * 4]
                    .copy_from_slice(bytemuck::cast_slice(&values));
            } else {
                for (o, v) in desc.offsets().zip(values) {
                    dtype.store(bytes, o, f64::from(v));
                }
            }
        }
        Produced::Encoded(elements) => {
            let size = dtype.size_in_bytes();
            for (o, chunk) in desc.offsets().zip(elements.chunks_exact(size)) {
                dtype.element_mut(bytes, o).copy_from_slice(chunk);
            }
        }
    })
}
