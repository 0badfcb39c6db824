use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::device::{DeviceId, DevicePtr, DeviceRuntime};
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result, Side};

// DataBuffer — Dual-locality element storage with lazy coherence
//
// A buffer may hold its elements on the host (primary side), on a device
// (secondary side), or both. Each side is allocated on demand. The buffer
// tracks which side holds the latest data:
//
//   Uninitialized ──write P──▶ PrimaryValid ──sync──▶ BothValid
//        │                          ▲                    │
//        └──write S──▶ SecondaryValid ◀──────write S─────┘
//
// Reading a side that is stale copies the whole storage across exactly once;
// later reads of the same side cost nothing until the other side is written
// again. Writes invalidate the other side. If both sides are written with no
// read in between, the last writer wins and a warning is logged.
//
// Views share their parent's storage and coherence state. They record the
// storage generation at creation; expanding the owner bumps the generation
// and every older view fails with StaleView from then on.

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Which side(s) of a buffer hold the latest data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coherence {
    /// Nothing written yet; any allocated side reads as zeros.
    Uninitialized,
    PrimaryValid,
    SecondaryValid,
    BothValid,
    Released,
}

impl Coherence {
    /// Whether reading `side` needs no copy.
    pub fn is_actual(self, side: Side) -> bool {
        match (self, side) {
            (Coherence::Uninitialized | Coherence::BothValid, _) => true,
            (Coherence::PrimaryValid, Side::Primary) => true,
            (Coherence::SecondaryValid, Side::Secondary) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Coherence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Coherence::Uninitialized => "uninitialized",
            Coherence::PrimaryValid => "primary-valid",
            Coherence::SecondaryValid => "secondary-valid",
            Coherence::BothValid => "both-valid",
            Coherence::Released => "released",
        };
        f.write_str(s)
    }
}

/// Logical timestamps of the last access of each kind, from a per-storage
/// clock. Zero means "never".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessTicks {
    pub primary_read: u64,
    pub primary_write: u64,
    pub secondary_read: u64,
    pub secondary_write: u64,
}

#[derive(Debug)]
struct Storage {
    owner: u64,
    primary: Option<Vec<u8>>,
    secondary: Option<DevicePtr>,
    /// Secondary memory belongs to the caller and is never freed here.
    external_secondary: bool,
    bytes: usize,
    state: Coherence,
    generation: u64,
    device: DeviceId,
    clock: u64,
    ticks: AccessTicks,
    syncs: u64,
}

impl Storage {
    fn tick(&mut self, side: Side, write: bool) {
        self.clock += 1;
        let slot = match (side, write) {
            (Side::Primary, false) => &mut self.ticks.primary_read,
            (Side::Primary, true) => &mut self.ticks.primary_write,
            (Side::Secondary, false) => &mut self.ticks.secondary_read,
            (Side::Secondary, true) => &mut self.ticks.secondary_write,
        };
        *slot = self.clock;
    }

    fn ensure_primary(&mut self) -> Result<&mut Vec<u8>> {
        if self.primary.is_none() {
            self.primary = Some(alloc_host(self.bytes)?);
        }
        self.primary
            .as_mut()
            .ok_or(Error::UseAfterRelease { buffer: self.owner })
    }

    fn ensure_secondary(&mut self, runtime: &dyn DeviceRuntime) -> Result<DevicePtr> {
        if let Some(ptr) = self.secondary {
            return Ok(ptr);
        }
        let ptr = runtime.malloc(self.device, self.bytes)?;
        runtime.memset(ptr, 0, 0, self.bytes, None)?;
        self.secondary = Some(ptr);
        Ok(ptr)
    }

    /// Make the primary side hold the latest data.
    fn actualize_primary(&mut self, runtime: &dyn DeviceRuntime) -> Result<()> {
        self.ensure_primary()?;
        if !self.state.is_actual(Side::Primary) {
            let ptr = self.ensure_secondary(runtime)?;
            let host = self.ensure_primary()?;
            runtime.memcpy_d2h(host.as_mut_slice(), ptr, 0, None)?;
            self.syncs += 1;
            self.state = Coherence::BothValid;
            tracing::trace!(buffer = self.owner, bytes = self.bytes, "synced to primary");
        }
        Ok(())
    }

    /// Make the secondary side hold the latest data.
    fn actualize_secondary(&mut self, runtime: &dyn DeviceRuntime) -> Result<DevicePtr> {
        let ptr = self.ensure_secondary(runtime)?;
        if !self.state.is_actual(Side::Secondary) {
            let host = self.ensure_primary()?;
            runtime.memcpy_h2d(ptr, 0, host.as_slice(), None)?;
            self.syncs += 1;
            self.state = Coherence::BothValid;
            tracing::trace!(buffer = self.owner, bytes = self.bytes, "synced to secondary");
        }
        Ok(ptr)
    }

    fn written(&mut self, side: Side) {
        self.tick(side, true);
        self.state = match side {
            Side::Primary => Coherence::PrimaryValid,
            Side::Secondary => Coherence::SecondaryValid,
        };
    }

    fn free(&mut self, runtime: &dyn DeviceRuntime) -> Result<()> {
        self.primary = None;
        self.state = Coherence::Released;
        if let Some(ptr) = self.secondary.take() {
            if !self.external_secondary {
                runtime.free(ptr)?;
            }
        }
        Ok(())
    }
}

/// Byte size of `len` elements of `dtype`; overflow reads as an allocation
/// the host can never satisfy.
fn byte_size(len: usize, dtype: DType) -> Result<usize> {
    len.checked_mul(dtype.size_in_bytes())
        .ok_or(Error::OutOfMemory {
            requested: usize::MAX,
            side: Side::Primary,
        })
}

fn alloc_host(bytes: usize) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(bytes).map_err(|_| Error::OutOfMemory {
        requested: bytes,
        side: Side::Primary,
    })?;
    v.resize(bytes, 0);
    Ok(v)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Owner,
    View { generation: u64 },
}

/// Memory handed to [`DataBuffer::wrap_external`].
#[derive(Debug, Default)]
pub struct ExternalMemory {
    /// Host bytes; ownership moves into the buffer.
    pub primary: Option<Vec<u8>>,
    /// Device allocation; it stays owned by the caller.
    pub secondary: Option<DevicePtr>,
}

/// Element storage shared by an owner and any number of views.
pub struct DataBuffer {
    id: u64,
    dtype: DType,
    /// Start of this handle's range, in elements.
    offset: usize,
    len: AtomicUsize,
    role: Role,
    released: AtomicBool,
    storage: Arc<Mutex<Storage>>,
    runtime: Arc<dyn DeviceRuntime>,
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBuffer")
            .field("id", &self.id)
            .field("dtype", &self.dtype)
            .field("offset", &self.offset)
            .field("len", &self.len())
            .field("view", &self.is_view())
            .field("locality", &self.locality())
            .finish()
    }
}

impl DataBuffer {
    /// Allocate storage for `len` elements. The primary side is allocated
    /// immediately; the secondary side too when `both_sides` is set,
    /// otherwise on first device access.
    pub fn allocate(
        runtime: Arc<dyn DeviceRuntime>,
        len: usize,
        dtype: DType,
        both_sides: bool,
    ) -> Result<Self> {
        let bytes = byte_size(len, dtype)?;
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        let mut storage = Storage {
            owner: id,
            primary: Some(alloc_host(bytes)?),
            secondary: None,
            external_secondary: false,
            bytes,
            state: Coherence::Uninitialized,
            generation: 0,
            device: runtime.current_device(),
            clock: 0,
            ticks: AccessTicks::default(),
            syncs: 0,
        };
        if both_sides {
            storage.ensure_secondary(runtime.as_ref())?;
        }
        tracing::trace!(buffer = id, len, %dtype, both_sides, "allocated buffer");
        Ok(Self::owner(id, dtype, len, storage, runtime))
    }

    /// Adopt memory the caller already filled. Whichever sides are given
    /// are taken to hold the current data.
    pub fn wrap_external(
        runtime: Arc<dyn DeviceRuntime>,
        memory: ExternalMemory,
        len: usize,
        dtype: DType,
    ) -> Result<Self> {
        let bytes = byte_size(len, dtype)?;
        let state = match (&memory.primary, &memory.secondary) {
            (Some(_), Some(_)) => Coherence::BothValid,
            (Some(_), None) => Coherence::PrimaryValid,
            (None, Some(_)) => Coherence::SecondaryValid,
            (None, None) => {
                return Err(Error::msg("wrap_external needs at least one memory side"))
            }
        };
        let mut primary = memory.primary;
        if let Some(host) = primary.as_mut() {
            if host.len() < bytes {
                return Err(Error::msg(format!(
                    "host memory of {} bytes cannot hold {len} {dtype} elements",
                    host.len()
                )));
            }
            host.truncate(bytes);
        }
        let device = match memory.secondary {
            Some(ptr) if ptr.bytes() < bytes => {
                return Err(Error::msg(format!(
                    "device memory of {} bytes cannot hold {len} {dtype} elements",
                    ptr.bytes()
                )))
            }
            Some(ptr) => ptr.device(),
            None => runtime.current_device(),
        };
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        let storage = Storage {
            owner: id,
            primary,
            secondary: memory.secondary,
            external_secondary: true,
            bytes,
            state,
            generation: 0,
            device,
            clock: 0,
            ticks: AccessTicks::default(),
            syncs: 0,
        };
        Ok(Self::owner(id, dtype, len, storage, runtime))
    }

    /// Allocate a host-valid buffer holding a copy of `data`.
    pub fn from_slice<T: WithDType>(runtime: Arc<dyn DeviceRuntime>, data: &[T]) -> Result<Self> {
        let buf = Self::allocate(runtime, data.len(), T::DTYPE, false)?;
        buf.copy_from_slice(data)?;
        Ok(buf)
    }

    fn owner(
        id: u64,
        dtype: DType,
        len: usize,
        storage: Storage,
        runtime: Arc<dyn DeviceRuntime>,
    ) -> Self {
        DataBuffer {
            id,
            dtype,
            offset: 0,
            len: AtomicUsize::new(len),
            role: Role::Owner,
            released: AtomicBool::new(false),
            storage: Arc::new(Mutex::new(storage)),
            runtime,
        }
    }

    /// A non-owning window of `len` elements starting `offset` elements into
    /// this buffer. The view shares storage and coherence with its parent.
    pub fn view(&self, offset: usize, len: usize) -> Result<DataBuffer> {
        let generation = {
            let storage = self.lock_live()?;
            storage.generation
        };
        if offset + len > self.len() {
            return Err(Error::shape(format!(
                "view [{offset}, {}) exceeds buffer of {} elements",
                offset + len,
                self.len()
            )));
        }
        Ok(DataBuffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            dtype: self.dtype,
            offset: self.offset + offset,
            len: AtomicUsize::new(len),
            role: Role::View { generation },
            released: AtomicBool::new(false),
            storage: Arc::clone(&self.storage),
            runtime: Arc::clone(&self.runtime),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements visible through this handle.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype.size_in_bytes()
    }

    /// Element offset of this handle within the shared storage.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_view(&self) -> bool {
        matches!(self.role, Role::View { .. })
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Whether `self` and `other` share storage.
    pub fn same_storage(&self, other: &DataBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    /// Current coherence state of the shared storage.
    pub fn locality(&self) -> Coherence {
        self.storage.lock().state
    }

    pub fn has_primary(&self) -> bool {
        self.storage.lock().primary.is_some()
    }

    pub fn has_secondary(&self) -> bool {
        self.storage.lock().secondary.is_some()
    }

    /// Device the secondary side lives (or will live) on.
    pub fn device_id(&self) -> DeviceId {
        self.storage.lock().device
    }

    /// Choose the device for the secondary side. Fails once device memory
    /// exists on a different device.
    pub fn set_device_id(&self, device: DeviceId) -> Result<()> {
        let mut storage = self.lock_live()?;
        match storage.secondary {
            Some(ptr) if ptr.device() != device => Err(Error::Device(format!(
                "buffer {} already has device memory on device {}",
                self.id,
                ptr.device()
            ))),
            _ => {
                storage.device = device;
                Ok(())
            }
        }
    }

    /// Number of cross-side copies performed on the shared storage.
    pub fn sync_count(&self) -> u64 {
        self.storage.lock().syncs
    }

    pub fn ticks(&self) -> AccessTicks {
        self.storage.lock().ticks
    }

    fn lock_live(&self) -> Result<MutexGuard<'_, Storage>> {
        if self.is_released() {
            return Err(Error::UseAfterRelease { buffer: self.id });
        }
        let storage = self.storage.lock();
        if storage.state == Coherence::Released {
            return Err(Error::UseAfterRelease { buffer: self.id });
        }
        if let Role::View { generation } = self.role {
            if generation != storage.generation {
                return Err(Error::StaleView { buffer: self.id });
            }
        }
        Ok(storage)
    }

    fn byte_range(&self) -> std::ops::Range<usize> {
        let size = self.dtype.size_in_bytes();
        self.offset * size..(self.offset + self.len()) * size
    }

    /// Bring the primary side up to date. Copies at most once.
    pub fn sync_to_primary(&self) -> Result<()> {
        let mut storage = self.lock_live()?;
        storage.actualize_primary(self.runtime.as_ref())
    }

    /// Bring the secondary side up to date, allocating it if needed.
    pub fn sync_to_secondary(&self) -> Result<()> {
        let mut storage = self.lock_live()?;
        storage.actualize_secondary(self.runtime.as_ref()).map(|_| ())
    }

    /// Record a read of `side`, synchronising it first if it is stale.
    pub fn mark_read(&self, side: Side) -> Result<()> {
        let mut storage = self.lock_live()?;
        match side {
            Side::Primary => storage.actualize_primary(self.runtime.as_ref())?,
            Side::Secondary => {
                storage.actualize_secondary(self.runtime.as_ref())?;
            }
        }
        storage.tick(side, false);
        Ok(())
    }

    /// Record that `side` was written behind the buffer's back (e.g. by a
    /// device kernel). The other side becomes stale. Fails when `side` has
    /// no memory to have been written.
    pub fn mark_write(&self, side: Side) -> Result<()> {
        let mut storage = self.lock_live()?;
        let allocated = match side {
            Side::Primary => storage.primary.is_some(),
            Side::Secondary => storage.secondary.is_some(),
        };
        if !allocated {
            return Err(Error::Device(format!(
                "buffer {} has no {side} memory to mark as written",
                self.id
            )));
        }
        let other_only = match side {
            Side::Primary => Coherence::SecondaryValid,
            Side::Secondary => Coherence::PrimaryValid,
        };
        if storage.state == other_only {
            tracing::warn!(
                buffer = self.id,
                %side,
                "both sides written without a sync in between; keeping the last write"
            );
        }
        storage.written(side);
        Ok(())
    }

    /// Borrow this handle's host bytes for reading.
    pub fn read_primary<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let range = self.byte_range();
        let mut storage = self.lock_live()?;
        storage.actualize_primary(self.runtime.as_ref())?;
        storage.tick(Side::Primary, false);
        let host = storage.ensure_primary()?;
        Ok(f(&host[range]))
    }

    /// Borrow this handle's host bytes for modification. The bytes hold the
    /// current contents; afterwards the primary side is the only valid one.
    pub fn write_primary<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let range = self.byte_range();
        let mut storage = self.lock_live()?;
        storage.actualize_primary(self.runtime.as_ref())?;
        let host = storage.ensure_primary()?;
        let out = f(&mut host[range]);
        storage.written(Side::Primary);
        Ok(out)
    }

    /// Up-to-date device memory for this handle: the allocation plus the
    /// byte offset of this handle within it.
    pub fn secondary_ptr(&self) -> Result<(DevicePtr, usize)> {
        let start = self.byte_range().start;
        let mut storage = self.lock_live()?;
        let ptr = storage.actualize_secondary(self.runtime.as_ref())?;
        storage.tick(Side::Secondary, false);
        Ok((ptr, start))
    }

    /// Overwrite this handle's range on the device side.
    pub fn write_secondary(&self, bytes: &[u8]) -> Result<()> {
        let range = self.byte_range();
        if bytes.len() != range.len() {
            return Err(Error::msg(format!(
                "device write of {} bytes into a range of {}",
                bytes.len(),
                range.len()
            )));
        }
        let mut storage = self.lock_live()?;
        let ptr = if range.len() == storage.bytes {
            storage.ensure_secondary(self.runtime.as_ref())?
        } else {
            // keep the bytes outside this range intact
            storage.actualize_secondary(self.runtime.as_ref())?
        };
        self.runtime.memcpy_h2d(ptr, range.start, bytes, None)?;
        storage.written(Side::Secondary);
        Ok(())
    }

    /// Read the elements as `T`. `T` must match the buffer's dtype.
    pub fn to_vec<T: WithDType>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        let size = self.dtype.size_in_bytes();
        self.read_primary(|bytes| {
            bytes
                .chunks_exact(size)
                .map(bytemuck::pod_read_unaligned::<T>)
                .collect()
        })
    }

    /// Read every element converted to f64, whatever the dtype.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let dtype = self.dtype;
        let len = self.len();
        self.read_primary(|bytes| (0..len).map(|i| dtype.load(bytes, i)).collect())
    }

    /// Overwrite the elements from `data`, which must match length and dtype.
    pub fn copy_from_slice<T: WithDType>(&self, data: &[T]) -> Result<()> {
        self.check_dtype::<T>()?;
        if data.len() != self.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.len()],
                got: vec![data.len()],
            });
        }
        self.write_primary(|bytes| bytes.copy_from_slice(bytemuck::cast_slice(data)))
    }

    fn check_dtype<T: WithDType>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(Error::msg(format!(
                "buffer holds {} but {} was requested",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(())
    }

    /// Grow the owner's storage to `new_len` elements, keeping its contents.
    /// Every view created before this call becomes stale.
    pub fn expand(&self, new_len: usize) -> Result<()> {
        if self.is_view() {
            return Err(Error::msg("cannot expand a view"));
        }
        let old_len = self.len();
        if new_len <= old_len {
            return Ok(());
        }
        let new_bytes = byte_size(new_len, self.dtype)?;
        let mut storage = self.lock_live()?;
        let old_bytes = storage.bytes;

        if let Some(host) = storage.primary.as_mut() {
            host.try_reserve_exact(new_bytes - old_bytes)
                .map_err(|_| Error::OutOfMemory {
                    requested: new_bytes,
                    side: Side::Primary,
                })?;
            host.resize(new_bytes, 0);
        }
        if let Some(old) = storage.secondary {
            let rt = self.runtime.as_ref();
            let fresh = rt.malloc(old.device(), new_bytes)?;
            rt.memset(fresh, 0, 0, new_bytes, None)?;
            rt.memcpy_d2d(fresh, 0, old, 0, old_bytes, None)?;
            if !storage.external_secondary {
                rt.free(old)?;
            }
            storage.secondary = Some(fresh);
            storage.external_secondary = false;
        }
        storage.bytes = new_bytes;
        storage.generation += 1;
        self.len.store(new_len, Ordering::Release);
        tracing::debug!(buffer = self.id, old_len, new_len, "expanded buffer");
        Ok(())
    }

    /// Release this handle. Releasing the owner frees both sides; releasing
    /// a view only retires the view. A second release is an error.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(Error::UseAfterRelease { buffer: self.id });
        }
        if self.role == Role::Owner {
            let mut storage = self.storage.lock();
            storage.free(self.runtime.as_ref())?;
            tracing::trace!(buffer = self.id, "released buffer");
        }
        Ok(())
    }

    /// Same as [`DataBuffer::release`].
    pub fn close(&self) -> Result<()> {
        self.release()
    }
}

impl Drop for DataBuffer {
    fn drop(&mut self) {
        if self.role == Role::Owner && !self.is_released() {
            let mut storage = self.storage.lock();
            if storage.state != Coherence::Released {
                if let Err(e) = storage.free(self.runtime.as_ref()) {
                    tracing::warn!(buffer = self.id, error = %e, "failed to free buffer on drop");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmulatedRuntime;
    use crate::error::ErrorKind;

    fn runtime() -> Arc<EmulatedRuntime> {
        Arc::new(EmulatedRuntime::new(2, 1 << 20))
    }

    #[test]
    fn test_write_primary_then_read_secondary_syncs_once() {
        let rt = runtime();
        let buf = DataBuffer::allocate(rt.clone(), 4, DType::F32, false).unwrap();
        buf.copy_from_slice(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(buf.locality(), Coherence::PrimaryValid);

        buf.mark_read(Side::Secondary).unwrap();
        assert_eq!(buf.sync_count(), 1);
        assert_eq!(rt.h2d_transfers(), 1);
        buf.mark_read(Side::Secondary).unwrap();
        assert_eq!(buf.sync_count(), 1);
        assert_eq!(buf.locality(), Coherence::BothValid);
    }

    #[test]
    fn test_device_write_visible_on_host() {
        let rt = runtime();
        let buf = DataBuffer::allocate(rt.clone(), 2, DType::I32, true).unwrap();
        buf.write_secondary(bytemuck::cast_slice::<i32, u8>(&[7, 9])).unwrap();
        assert_eq!(buf.locality(), Coherence::SecondaryValid);
        assert_eq!(buf.to_vec::<i32>().unwrap(), vec![7, 9]);
        assert_eq!(buf.sync_count(), 1);
        assert_eq!(buf.to_vec::<i32>().unwrap(), vec![7, 9]);
        assert_eq!(buf.sync_count(), 1);
    }

    #[test]
    fn test_uninitialized_reads_without_copy() {
        let buf = DataBuffer::allocate(runtime(), 3, DType::F64, true).unwrap();
        buf.mark_read(Side::Secondary).unwrap();
        assert_eq!(buf.to_f64_vec().unwrap(), vec![0.0; 3]);
        assert_eq!(buf.sync_count(), 0);
    }

    #[test]
    fn test_last_writer_wins() {
        let buf = DataBuffer::allocate(runtime(), 1, DType::F32, true).unwrap();
        buf.copy_from_slice(&[1.0f32]).unwrap();
        buf.mark_write(Side::Secondary).unwrap();
        assert_eq!(buf.locality(), Coherence::SecondaryValid);
        let t = buf.ticks();
        assert!(t.secondary_write > t.primary_write);
    }

    #[test]
    fn test_double_release() {
        let buf = DataBuffer::allocate(runtime(), 4, DType::U8, false).unwrap();
        buf.release().unwrap();
        let err = buf.release().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseAfterRelease);
        assert_eq!(buf.to_vec::<u8>().unwrap_err().kind(), ErrorKind::UseAfterRelease);
    }

    #[test]
    fn test_view_shares_storage() {
        let rt = runtime();
        let buf = DataBuffer::from_slice(rt, &[0i64, 1, 2, 3, 4, 5]).unwrap();
        let v = buf.view(2, 3).unwrap();
        assert!(v.is_view());
        assert!(v.same_storage(&buf));
        assert_eq!(v.to_vec::<i64>().unwrap(), vec![2, 3, 4]);
        v.copy_from_slice(&[20i64, 30, 40]).unwrap();
        assert_eq!(buf.to_vec::<i64>().unwrap(), vec![0, 1, 20, 30, 40, 5]);
        assert!(buf.view(4, 3).is_err());
    }

    #[test]
    fn test_view_dies_with_owner() {
        let buf = DataBuffer::allocate(runtime(), 4, DType::F32, false).unwrap();
        let v = buf.view(0, 2).unwrap();
        buf.release().unwrap();
        assert_eq!(v.to_f64_vec().unwrap_err().kind(), ErrorKind::UseAfterRelease);
    }

    #[test]
    fn test_expand_stales_views() {
        let rt = runtime();
        let buf = DataBuffer::from_slice(rt, &[1.0f32, 2.0]).unwrap();
        buf.sync_to_secondary().unwrap();
        let v = buf.view(0, 1).unwrap();
        buf.expand(4).unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 0.0, 0.0]);
        assert!(matches!(v.to_vec::<f32>(), Err(Error::StaleView { .. })));
        assert!(v.expand(8).is_err());
    }

    #[test]
    fn test_secondary_out_of_memory() {
        let rt = Arc::new(EmulatedRuntime::new(1, 16));
        let err = DataBuffer::allocate(rt, 8, DType::F64, true).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfMemory {
                side: Side::Secondary,
                ..
            }
        ));
    }

    #[test]
    fn test_host_only_runtime() {
        let rt = Arc::new(EmulatedRuntime::host_only());
        let buf = DataBuffer::from_slice(rt, &[3u16, 4]).unwrap();
        assert_eq!(buf.to_vec::<u16>().unwrap(), vec![3, 4]);
        assert_eq!(buf.sync_to_secondary().unwrap_err().kind(), ErrorKind::Device);
    }

    #[test]
    fn test_device_id_assignment() {
        let buf = DataBuffer::allocate(runtime(), 2, DType::F32, false).unwrap();
        buf.set_device_id(1).unwrap();
        buf.sync_to_secondary().unwrap();
        assert_eq!(buf.device_id(), 1);
        assert!(buf.set_device_id(0).is_err());
    }

    #[test]
    fn test_wrap_external_host() {
        let bytes = bytemuck::cast_slice::<i32, u8>(&[5, 6, 7]).to_vec();
        let buf = DataBuffer::wrap_external(
            runtime(),
            ExternalMemory {
                primary: Some(bytes),
                secondary: None,
            },
            3,
            DType::I32,
        )
        .unwrap();
        assert_eq!(buf.locality(), Coherence::PrimaryValid);
        assert_eq!(buf.to_vec::<i32>().unwrap(), vec![5, 6, 7]);
        assert!(DataBuffer::wrap_external(runtime(), ExternalMemory::default(), 1, DType::I32)
            .is_err());
    }

    #[test]
    fn test_mark_write_needs_storage() {
        let buf = DataBuffer::allocate(runtime(), 1, DType::F32, false).unwrap();
        buf.copy_from_slice(&[1.0f32]).unwrap();
        let err = buf.mark_write(Side::Secondary).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(buf.locality(), Coherence::PrimaryValid);
        assert_eq!(buf.to_vec::<f32>().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_oversized_requests_fail_cleanly() {
        let err = DataBuffer::allocate(runtime(), usize::MAX / 2, DType::F32, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);

        let external = ExternalMemory {
            primary: Some(vec![0u8; 8]),
            secondary: None,
        };
        let err = DataBuffer::wrap_external(runtime(), external, usize::MAX / 4, DType::F64)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);

        let buf = DataBuffer::from_slice(runtime(), &[1.0f64]).unwrap();
        assert_eq!(buf.expand(usize::MAX / 4).unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(buf.to_vec::<f64>().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_coherence_actual_sides() {
        assert!(Coherence::Uninitialized.is_actual(Side::Secondary));
        assert!(Coherence::PrimaryValid.is_actual(Side::Primary));
        assert!(!Coherence::PrimaryValid.is_actual(Side::Secondary));
        assert!(!Coherence::SecondaryValid.is_actual(Side::Primary));
        assert!(Coherence::BothValid.is_actual(Side::Primary));
    }

    #[test]
    fn test_dtype_checked() {
        let buf = DataBuffer::allocate(runtime(), 2, DType::F32, false).unwrap();
        assert!(buf.to_vec::<f64>().is_err());
        assert!(buf.copy_from_slice(&[1.0f32]).is_err());
    }
}
