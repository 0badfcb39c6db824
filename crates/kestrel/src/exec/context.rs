// ExecutionContext — Bindings and arguments for one op invocation
//
// A context is filled, executed, and then either purged for reuse or
// dropped. It is owned by one caller at a time (`execute` takes `&mut self`),
// so no locking happens here; buffers it points at carry their own.

use std::sync::Arc;

use kestrel_core::{
    DType, DataBuffer, DeviceId, RandomGenerator, Result, ShapeDescriptor, StreamHandle,
};

use crate::engine::Engine;
use crate::exec::ops::Op;

/// A buffer paired with the descriptor used to address it.
#[derive(Debug, Clone)]
pub struct Operand {
    pub buffer: Arc<DataBuffer>,
    pub shape: Arc<ShapeDescriptor>,
}

impl Operand {
    pub fn new(buffer: Arc<DataBuffer>, shape: Arc<ShapeDescriptor>) -> Self {
        Operand { buffer, shape }
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.shape.dtype()
    }

    /// Elements in logical (row-major index) order, converted to f64.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let dtype = self.shape.dtype();
        let shape = &self.shape;
        self.buffer
            .read_primary(|bytes| shape.offsets().map(|o| dtype.load(bytes, o)).collect())
    }

    /// Elements in logical order, converted to `T` through f64.
    pub fn to_vec<T: kestrel_core::WithDType>(&self) -> Result<Vec<T>> {
        Ok(self.to_f64_vec()?.into_iter().map(T::from_f64).collect())
    }
}

/// Execution mode tag; ops that behave differently under training can
/// consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Undefined,
    Training,
    Inference,
}

/// Borrowed view of a context's argument lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpArgs<'a> {
    pub t_args: &'a [f64],
    pub i_args: &'a [i64],
    pub b_args: &'a [bool],
    pub d_args: &'a [DType],
    pub dimensions: &'a [i64],
}

/// Inputs, outputs and arguments for one op invocation.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    node_id: i64,
    inputs: Vec<Option<Operand>>,
    outputs: Vec<Option<Operand>>,
    t_args: Vec<f64>,
    i_args: Vec<i64>,
    b_args: Vec<bool>,
    d_args: Vec<DType>,
    dimensions: Vec<i64>,
    rng: Option<RandomGenerator>,
    stream: Option<StreamHandle>,
    device: Option<DeviceId>,
    in_place: bool,
    mode: ExecutionMode,
    helpers_allowed: bool,
    shape_function_override: bool,
}

fn put(slots: &mut Vec<Option<Operand>>, index: usize, operand: Operand) {
    if slots.len() <= index {
        slots.resize(index + 1, None);
    }
    slots[index] = Some(operand);
}

impl ExecutionContext {
    /// Fresh context. Helper kernels are allowed by default; an engine's
    /// [`Engine::context`] applies its configured default instead.
    pub fn new() -> Self {
        ExecutionContext {
            helpers_allowed: true,
            ..Default::default()
        }
    }

    /// Context for graph node `node_id`.
    pub fn for_node(node_id: i64) -> Self {
        ExecutionContext {
            node_id,
            ..Self::new()
        }
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    pub fn bind_input(&mut self, index: usize, buffer: Arc<DataBuffer>, shape: Arc<ShapeDescriptor>) {
        put(&mut self.inputs, index, Operand::new(buffer, shape));
    }

    pub fn bind_output(
        &mut self,
        index: usize,
        buffer: Arc<DataBuffer>,
        shape: Arc<ShapeDescriptor>,
    ) {
        put(&mut self.outputs, index, Operand::new(buffer, shape));
    }

    pub fn set_input(&mut self, index: usize, operand: Operand) {
        put(&mut self.inputs, index, operand);
    }

    pub fn set_output(&mut self, index: usize, operand: Operand) {
        put(&mut self.outputs, index, operand);
    }

    pub fn input(&self, index: usize) -> Option<&Operand> {
        self.inputs.get(index).and_then(Option::as_ref)
    }

    pub fn output(&self, index: usize) -> Option<&Operand> {
        self.outputs.get(index).and_then(Option::as_ref)
    }

    /// Number of input slots, bound or not.
    pub fn input_slots(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_slots(&self) -> usize {
        self.outputs.len()
    }

    pub fn set_t_args(&mut self, args: impl Into<Vec<f64>>) {
        self.t_args = args.into();
    }

    pub fn set_i_args(&mut self, args: impl Into<Vec<i64>>) {
        self.i_args = args.into();
    }

    pub fn set_b_args(&mut self, args: impl Into<Vec<bool>>) {
        self.b_args = args.into();
    }

    pub fn set_d_args(&mut self, args: impl Into<Vec<DType>>) {
        self.d_args = args.into();
    }

    /// Set float, integer and boolean arguments in one call.
    pub fn set_args(&mut self, floats: &[f64], ints: &[i64], bools: &[bool]) {
        self.t_args = floats.to_vec();
        self.i_args = ints.to_vec();
        self.b_args = bools.to_vec();
    }

    /// Axes for TAD-based families. Negative axes count from the end.
    pub fn set_dimensions(&mut self, dims: impl Into<Vec<i64>>) {
        self.dimensions = dims.into();
    }

    pub fn args(&self) -> OpArgs<'_> {
        OpArgs {
            t_args: &self.t_args,
            i_args: &self.i_args,
            b_args: &self.b_args,
            d_args: &self.d_args,
            dimensions: &self.dimensions,
        }
    }

    pub fn bind_random(&mut self, rng: RandomGenerator) {
        self.rng = Some(rng);
    }

    pub fn random(&self) -> Option<&RandomGenerator> {
        self.rng.as_ref()
    }

    pub fn random_mut(&mut self) -> Option<&mut RandomGenerator> {
        self.rng.as_mut()
    }

    /// Take the generator back out, e.g. to carry its advanced state on.
    pub fn take_random(&mut self) -> Option<RandomGenerator> {
        self.rng.take()
    }

    /// Bind a device stream. The stream's device becomes the context's
    /// device.
    pub fn bind_stream(&mut self, stream: StreamHandle) {
        self.device = Some(stream.device());
        self.stream = Some(stream);
    }

    pub fn stream(&self) -> Option<StreamHandle> {
        self.stream
    }

    pub fn set_device(&mut self, device: DeviceId) {
        self.device = Some(device);
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    /// Allow output 0 to alias input 0. With no output bound, the op writes
    /// straight into input 0.
    pub fn set_in_place(&mut self, in_place: bool) {
        self.in_place = in_place;
    }

    pub fn is_in_place(&self) -> bool {
        self.in_place
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn allow_helpers(&mut self, allowed: bool) {
        self.helpers_allowed = allowed;
    }

    pub fn helpers_allowed(&self) -> bool {
        self.helpers_allowed
    }

    /// Skip validation of bound outputs against inferred shapes; only
    /// element counts are checked.
    pub fn set_shape_function_override(&mut self, on: bool) {
        self.shape_function_override = on;
    }

    pub fn shape_function_override(&self) -> bool {
        self.shape_function_override
    }

    /// Run `op` with the current bindings.
    pub fn execute(&mut self, engine: &Engine, op: Op) -> Result<()> {
        engine.execute(self, op)
    }

    /// Drop all bindings and arguments but keep flags, so the context can
    /// be refilled for another invocation.
    pub fn purge(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
        self.t_args.clear();
        self.i_args.clear();
        self.b_args.clear();
        self.d_args.clear();
        self.dimensions.clear();
    }

    /// Back to the state of [`ExecutionContext::new`].
    pub fn reset(&mut self) {
        *self = Self::for_node(self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{EmulatedRuntime, Order};

    fn operand(values: &[f32]) -> Operand {
        let rt = Arc::new(EmulatedRuntime::host_only());
        let buf = Arc::new(DataBuffer::from_slice(rt, values).unwrap());
        let shape = Arc::new(ShapeDescriptor::dense(values.len(), DType::F32, Order::C).unwrap());
        Operand::new(buf, shape)
    }

    #[test]
    fn test_bind_sparse_slots() {
        let mut ctx = ExecutionContext::new();
        ctx.set_input(2, operand(&[1.0]));
        assert_eq!(ctx.input_slots(), 3);
        assert!(ctx.input(0).is_none());
        assert!(ctx.input(2).is_some());
    }

    #[test]
    fn test_purge_keeps_flags() {
        let mut ctx = ExecutionContext::new();
        ctx.set_input(0, operand(&[1.0, 2.0]));
        ctx.set_t_args(vec![1.5]);
        ctx.set_dimensions(vec![0]);
        ctx.set_in_place(true);
        ctx.set_mode(ExecutionMode::Training);
        ctx.purge();
        assert_eq!(ctx.input_slots(), 0);
        assert!(ctx.args().t_args.is_empty());
        assert!(ctx.args().dimensions.is_empty());
        assert!(ctx.is_in_place());
        assert_eq!(ctx.mode(), ExecutionMode::Training);

        ctx.reset();
        assert!(!ctx.is_in_place());
        assert!(ctx.helpers_allowed());
    }

    #[test]
    fn test_operand_logical_read() {
        let op = operand(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = Operand::new(
            Arc::clone(&op.buffer),
            Arc::new(
                ShapeDescriptor::dense(vec![2, 3], DType::F32, Order::C)
                    .unwrap()
                    .transpose(0, 1)
                    .unwrap(),
            ),
        );
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }
}
