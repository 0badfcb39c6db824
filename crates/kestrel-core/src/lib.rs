//! # kestrel-core
//!
//! Array metadata, storage and device primitives for Kestrel.
//!
//! This crate provides:
//! - [`ShapeDescriptor`]: extents, signed strides, offset, dtype and order
//! - [`ShapeRegistry`]: interning cache for descriptors
//! - [`TadPlanner`] / [`TadPack`]: tensor-along-dimension tiling
//! - [`DataBuffer`]: dual-locality (host/device) storage with lazy coherence
//! - [`DeviceRuntime`]: the device surface, with a host-emulated implementation
//! - [`RandomGenerator`]: counter-based random source
//! - `.npy` and index helpers

// - DType: element types and the WithDType bridge
// - Shape / ShapeDescriptor: extents, strides, EWS, view derivation
// - ShapeRegistry / TadPlanner: shared caches, injected by the engine
// - DataBuffer / DeviceRuntime: storage on either side of the device boundary

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod dtype;
pub mod error;
pub mod index;
pub mod npy;
pub mod random;
pub mod registry;
pub mod shape;
pub mod tad;

pub use buffer::{AccessTicks, Coherence, DataBuffer, ExternalMemory};
pub use descriptor::{ShapeDescriptor, MAX_RANK};
pub use device::{
    DeviceId, DeviceInfo, DevicePtr, DeviceRuntime, EmulatedRuntime, EventHandle, StreamHandle,
};
pub use dtype::{DType, WithDType};
pub use error::{Error, ErrorKind, LastError, Result, Side};
pub use index::ClipMode;
pub use random::RandomGenerator;
pub use registry::{RegistryStats, ShapeRegistry};
pub use shape::{Order, Shape};
pub use tad::{PlannerStats, TadPack, TadPlanner};
