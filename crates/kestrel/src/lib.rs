//! # Kestrel
//!
//! A tensor execution engine: op dispatch over dual-locality buffers, reusable
//! execution contexts and a runtime for stored computation graphs.
//!
//! This is the top-level crate; it re-exports the `kestrel-core` primitives
//! it is built on.
//!
//! ## Usage
//!
//! ```rust
//! use kestrel::prelude::*;
//!
//! let engine = Engine::default();
//! let x = engine.operand_from_slice(&[1.0f32, 2.0, 3.0], &[3]).unwrap();
//! let y = engine
//!     .exec_scalar(&LaunchExtras::default(), BinaryOp::Add.code(), &x, 1.0, None)
//!     .unwrap();
//! assert_eq!(y.to_vec::<f32>().unwrap(), vec![2.0, 3.0, 4.0]);
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `kestrel-core` | DType, ShapeDescriptor, registries, TAD planning, DataBuffer, devices, RNG |
//! | `kestrel` | Engine, op families and kernels, execution contexts, stored graphs |
//!
//! ## Modules
//!
//! - [`engine`]: the `Engine` handle and its statistics
//! - [`exec`]: op families, per-family entry points, execution contexts
//! - [`graph`]: flat graph model, registration, execution and scoped state
//! - [`config`]: engine tunables
//! - [`telemetry`]: tracing subscriber setup

/// Re-export core types.
pub use kestrel_core::{
    DType, DataBuffer, DeviceId, DeviceInfo, DeviceRuntime, EmulatedRuntime, Error, ErrorKind,
    EventHandle, LastError, Order, RandomGenerator, Result, Shape, ShapeDescriptor,
    ShapeRegistry, StreamHandle, TadPack, TadPlanner, WithDType,
};

/// `.npy` boundary functions.
pub use kestrel_core::npy;

pub mod config;
pub mod engine;
pub mod exec;
pub mod graph;
pub mod telemetry;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats};
pub use exec::{
    ArrayInspection, ExecutionContext, ExecutionMode, LaunchExtras, Op, OpArgs, OpFamily,
    OpRegistry, Operand,
};
pub use graph::{FlatGraph, GraphState, Scope, Step, VariableSet};
pub use telemetry::{init_tracing, TracingConfig};

/// Convenience prelude.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::Engine;
    pub use crate::exec::{
        BinaryOp, ExecutionContext, IndexReduceOp, LaunchExtras, Op, OpFamily, Operand,
        RandomOp, Reduce3Op, ReduceOp, SummaryStatsOp, TransformOp,
    };
    pub use crate::graph::{
        FlatGraph, FlatNode, FlatVariable, GraphState, Scope, Step, VarRef, VariableKind,
        VariableSet,
    };
    pub use kestrel_core::{DType, Error, Order, Result, ShapeDescriptor};
}
