// Engine — the service object every entry point hangs off
//
// Owns the shape registry, the TAD planner, the op table, the device runtime,
// the stored graphs and the last-error slot. Nothing here is global: tests
// and embedders build as many engines as they like, each with fresh caches.
//
// The engine is `Sync`; independent contexts may execute on it concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_core::{
    DType, DataBuffer, DeviceId, DeviceInfo, DeviceRuntime, EmulatedRuntime, EventHandle,
    LastError, Order, Result, ShapeDescriptor, ShapeRegistry, StreamHandle, TadPlanner,
    WithDType,
};

use crate::config::EngineConfig;
use crate::exec::context::{ExecutionContext, Operand};
use crate::exec::registry::OpRegistry;
use crate::graph::runtime::GraphRuntime;

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    dispatches: AtomicU64,
    failures: AtomicU64,
    helper_hits: AtomicU64,
    timed: AtomicU64,
    timed_nanos: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_helper(&self) {
        self.helper_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timing(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.timed.fetch_add(1, Ordering::Relaxed);
        self.timed_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Dispatches served by a helper kernel instead of the generic path.
    pub fn helper_hits(&self) -> u64 {
        self.helper_hits.load(Ordering::Relaxed)
    }

    /// Successful dispatches timed because the engine runs verbose.
    pub fn timed_dispatches(&self) -> u64 {
        self.timed.load(Ordering::Relaxed)
    }

    /// Wall time summed over the timed dispatches.
    pub fn timed_total(&self) -> Duration {
        Duration::from_nanos(self.timed_nanos.load(Ordering::Relaxed))
    }
}

/// Execution engine.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    shapes: Arc<ShapeRegistry>,
    tads: Arc<TadPlanner>,
    ops: OpRegistry,
    runtime: Arc<dyn DeviceRuntime>,
    pub(crate) graphs: GraphRuntime,
    last_error: LastError,
    pub(crate) stats: EngineStats,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    /// Engine on a single emulated device.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_runtime(config, Arc::new(EmulatedRuntime::default()))
    }

    pub fn with_runtime(config: EngineConfig, runtime: Arc<dyn DeviceRuntime>) -> Self {
        let shapes = Arc::new(ShapeRegistry::new());
        let tads = Arc::new(TadPlanner::new(Arc::clone(&shapes)));
        tracing::debug!(
            devices = runtime.device_count(),
            element_threshold = config.element_threshold,
            tad_threshold = config.tad_threshold,
            "engine created"
        );
        Engine {
            config,
            shapes,
            tads,
            ops: OpRegistry::new(),
            runtime,
            graphs: GraphRuntime::new(),
            last_error: LastError::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shapes(&self) -> &Arc<ShapeRegistry> {
        &self.shapes
    }

    pub fn tads(&self) -> &Arc<TadPlanner> {
        &self.tads
    }

    pub fn ops(&self) -> &OpRegistry {
        &self.ops
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn last_error(&self) -> &LastError {
        &self.last_error
    }

    /// Code of the most recent failure, 0 if none since the last clear.
    pub fn last_error_code(&self) -> i32 {
        self.last_error.code()
    }

    pub fn last_error_message(&self) -> String {
        self.last_error.message()
    }

    pub fn clear_last_error(&self) {
        self.last_error.clear()
    }

    /// A fresh context carrying this engine's defaults.
    pub fn context(&self) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.allow_helpers(self.config.helpers_allowed);
        ctx
    }

    // Operands

    /// Interned dense descriptor.
    pub fn describe(&self, dims: &[usize], dtype: DType) -> Result<Arc<ShapeDescriptor>> {
        self.last_error.track(self.shapes.dense(dims, dtype, Order::C))
    }

    /// Host-valid operand holding a copy of `data`, shaped `dims` (row-major).
    pub fn operand_from_slice<T: WithDType>(&self, data: &[T], dims: &[usize]) -> Result<Operand> {
        let result = (|| -> Result<Operand> {
            let shape = self.shapes.dense(dims, T::DTYPE, Order::C)?;
            if shape.length() != data.len() {
                return Err(kestrel_core::Error::ShapeMismatch {
                    expected: dims.to_vec(),
                    got: vec![data.len()],
                });
            }
            let buffer = DataBuffer::from_slice(Arc::clone(&self.runtime), data)?;
            Ok(Operand::new(Arc::new(buffer), shape))
        })();
        self.last_error.track(result)
    }

    /// Zero-filled dense operand.
    pub fn allocate_operand(&self, dims: &[usize], dtype: DType) -> Result<Operand> {
        let result = (|| -> Result<Operand> {
            let shape = self.shapes.dense(dims, dtype, Order::C)?;
            let buffer =
                DataBuffer::allocate(Arc::clone(&self.runtime), shape.length(), dtype, false)?;
            Ok(Operand::new(Arc::new(buffer), shape))
        })();
        self.last_error.track(result)
    }

    /// Pair an existing buffer with a descriptor, interning the descriptor.
    pub fn operand(&self, buffer: Arc<DataBuffer>, shape: ShapeDescriptor) -> Operand {
        Operand::new(buffer, self.shapes.intern(shape))
    }

    // Device pass-through

    pub fn device_count(&self) -> usize {
        self.runtime.device_count()
    }

    pub fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        self.last_error.track(self.runtime.device_info(device))
    }

    pub fn set_device(&self, device: DeviceId) -> Result<()> {
        self.last_error.track(self.runtime.set_device(device))
    }

    pub fn current_device(&self) -> DeviceId {
        self.runtime.current_device()
    }

    pub fn create_stream(&self, device: DeviceId) -> Result<StreamHandle> {
        self.last_error.track(self.runtime.create_stream(device))
    }

    pub fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        self.last_error.track(self.runtime.destroy_stream(stream))
    }

    pub fn synchronize_stream(&self, stream: StreamHandle) -> Result<()> {
        self.last_error.track(self.runtime.synchronize_stream(stream))
    }

    pub fn create_event(&self, device: DeviceId) -> Result<EventHandle> {
        self.last_error.track(self.runtime.create_event(device))
    }

    pub fn record_event(&self, event: EventHandle, stream: StreamHandle) -> Result<()> {
        self.last_error.track(self.runtime.record_event(event, stream))
    }

    pub fn synchronize_event(&self, event: EventHandle) -> Result<()> {
        self.last_error.track(self.runtime.synchronize_event(event))
    }

    pub fn destroy_event(&self, event: EventHandle) -> Result<()> {
        self.last_error.track(self.runtime.destroy_event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::ErrorKind;

    #[test]
    fn test_context_takes_engine_default() {
        let engine = Engine::new(EngineConfig::default().with_helpers_allowed(false));
        assert!(!engine.context().helpers_allowed());
    }

    #[test]
    fn test_operand_from_slice_checks_length() {
        let engine = Engine::default();
        let err = engine
            .operand_from_slice(&[1.0f32, 2.0, 3.0], &[2, 2])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
        assert_eq!(engine.last_error_code(), ErrorKind::Shape.code());
    }

    #[test]
    fn test_device_failures_reach_last_error() {
        let engine = Engine::with_runtime(
            EngineConfig::default(),
            Arc::new(EmulatedRuntime::host_only()),
        );
        assert_eq!(engine.device_count(), 0);
        assert!(engine.create_stream(0).is_err());
        assert_eq!(engine.last_error_code(), ErrorKind::Device.code());
    }

    #[test]
    fn test_shapes_are_interned() {
        let engine = Engine::default();
        let a = engine.describe(&[2, 3], DType::F32).unwrap();
        let b = engine.describe(&[2, 3], DType::F32).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
