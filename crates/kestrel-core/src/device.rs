use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result, Side};

// Device runtime — Pass-through surface over whatever accelerator is configured
//
// Everything the engine needs from a device is here: memory, copies,
// streams, events and a few queries. The engine never talks to a driver
// directly, only to `dyn DeviceRuntime`.
//
// `EmulatedRuntime` backs device memory with host allocations and runs every
// submission synchronously. It keeps per-device capacity accounting so
// out-of-memory on the secondary side behaves like the real thing, and it
// counts transfers so coherence behaviour is observable in tests.

/// Device ordinal.
pub type DeviceId = i32;

/// Opaque handle to a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    device: DeviceId,
    id: u64,
    bytes: usize,
}

impl DevicePtr {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Size of the allocation in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Opaque handle to a device stream (execution queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    device: DeviceId,
    id: u64,
}

impl StreamHandle {
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

/// Opaque handle to a device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    device: DeviceId,
    id: u64,
}

/// Static and dynamic properties of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ordinal: DeviceId,
    pub name: String,
    pub total_memory: usize,
    pub free_memory: usize,
    pub compute_major: i32,
    pub compute_minor: i32,
}

/// Thin pass-through surface over a device runtime.
pub trait DeviceRuntime: Send + Sync + fmt::Debug {
    /// Number of visible devices. Zero means host-only.
    fn device_count(&self) -> usize;

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo>;

    fn set_device(&self, device: DeviceId) -> Result<()>;

    fn current_device(&self) -> DeviceId;

    fn malloc(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr>;

    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Copy `src` into device memory at `dst_offset` bytes.
    fn memcpy_h2d(
        &self,
        dst: DevicePtr,
        dst_offset: usize,
        src: &[u8],
        stream: Option<StreamHandle>,
    ) -> Result<()>;

    /// Copy device memory starting at `src_offset` bytes into `dst`.
    fn memcpy_d2h(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        src_offset: usize,
        stream: Option<StreamHandle>,
    ) -> Result<()>;

    fn memcpy_d2d(
        &self,
        dst: DevicePtr,
        dst_offset: usize,
        src: DevicePtr,
        src_offset: usize,
        bytes: usize,
        stream: Option<StreamHandle>,
    ) -> Result<()>;

    fn memset(
        &self,
        dst: DevicePtr,
        offset: usize,
        value: u8,
        bytes: usize,
        stream: Option<StreamHandle>,
    ) -> Result<()>;

    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle>;

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Block until all work submitted to `stream` has completed.
    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()>;

    fn create_event(&self, device: DeviceId) -> Result<EventHandle>;

    /// Capture the current tail of `stream` in `event`.
    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> Result<()>;

    /// Block until the work captured by `event` has completed.
    fn synchronize_event(&self, event: EventHandle) -> Result<()>;

    fn destroy_event(&self, event: EventHandle) -> Result<()>;
}

// EmulatedRuntime

#[derive(Debug, Default)]
struct StreamState {
    submitted: u64,
    completed: u64,
}

#[derive(Debug)]
struct EmulatedDevice {
    name: String,
    capacity: usize,
    compute: (i32, i32),
    used: AtomicUsize,
    allocations: Mutex<HashMap<u64, Vec<u8>>>,
    streams: Mutex<HashMap<u64, StreamState>>,
    /// event id → (stream id, submission count captured), if recorded
    events: Mutex<HashMap<u64, Option<(u64, u64)>>>,
}

/// Host-memory emulation of a device runtime.
#[derive(Debug)]
pub struct EmulatedRuntime {
    devices: Vec<EmulatedDevice>,
    current: AtomicI32,
    next_handle: AtomicU64,
    h2d: AtomicU64,
    d2h: AtomicU64,
}

impl Default for EmulatedRuntime {
    /// One device with 1 GiB of memory.
    fn default() -> Self {
        Self::new(1, 1 << 30)
    }
}

impl EmulatedRuntime {
    /// `count` devices, each with `capacity` bytes.
    pub fn new(count: usize, capacity: usize) -> Self {
        let devices = (0..count)
            .map(|i| EmulatedDevice {
                name: format!("emulated:{i}"),
                capacity,
                compute: (8, 0),
                used: AtomicUsize::new(0),
                allocations: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                events: Mutex::new(HashMap::new()),
            })
            .collect();
        EmulatedRuntime {
            devices,
            current: AtomicI32::new(0),
            next_handle: AtomicU64::new(1),
            h2d: AtomicU64::new(0),
            d2h: AtomicU64::new(0),
        }
    }

    /// A runtime with no devices: every buffer is single-locality.
    pub fn host_only() -> Self {
        Self::new(0, 0)
    }

    /// Report `major.minor` as the compute capability of every device.
    pub fn with_compute_capability(mut self, major: i32, minor: i32) -> Self {
        for d in &mut self.devices {
            d.compute = (major, minor);
        }
        self
    }

    /// Number of host→device copies performed so far.
    pub fn h2d_transfers(&self) -> u64 {
        self.h2d.load(Ordering::Relaxed)
    }

    /// Number of device→host copies performed so far.
    pub fn d2h_transfers(&self) -> u64 {
        self.d2h.load(Ordering::Relaxed)
    }

    fn device(&self, device: DeviceId) -> Result<&EmulatedDevice> {
        usize::try_from(device)
            .ok()
            .and_then(|i| self.devices.get(i))
            .ok_or_else(|| {
                Error::Device(format!(
                    "device {device} does not exist ({} visible)",
                    self.devices.len()
                ))
            })
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, device: &EmulatedDevice, stream: Option<StreamHandle>) -> Result<()> {
        if let Some(s) = stream {
            let mut streams = device.streams.lock();
            let state = streams
                .get_mut(&s.id)
                .ok_or_else(|| Error::Device(format!("stream {} is not live", s.id)))?;
            state.submitted += 1;
            // emulated work completes on submission
            state.completed = state.submitted;
        }
        Ok(())
    }

    fn check_range(ptr: DevicePtr, offset: usize, bytes: usize) -> Result<()> {
        if offset + bytes > ptr.bytes {
            return Err(Error::Device(format!(
                "access of {bytes} bytes at offset {offset} overruns allocation of {}",
                ptr.bytes
            )));
        }
        Ok(())
    }
}

impl DeviceRuntime for EmulatedRuntime {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        let d = self.device(device)?;
        let used = d.used.load(Ordering::Relaxed);
        Ok(DeviceInfo {
            ordinal: device,
            name: d.name.clone(),
            total_memory: d.capacity,
            free_memory: d.capacity.saturating_sub(used),
            compute_major: d.compute.0,
            compute_minor: d.compute.1,
        })
    }

    fn set_device(&self, device: DeviceId) -> Result<()> {
        self.device(device)?;
        self.current.store(device, Ordering::Relaxed);
        Ok(())
    }

    fn current_device(&self) -> DeviceId {
        self.current.load(Ordering::Relaxed)
    }

    fn malloc(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr> {
        let d = self.device(device)?;
        let reserved = d
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= d.capacity)
            });
        if reserved.is_err() {
            return Err(Error::OutOfMemory {
                requested: bytes,
                side: Side::Secondary,
            });
        }
        let id = self.handle();
        d.allocations.lock().insert(id, vec![0u8; bytes]);
        tracing::trace!(device, bytes, id, "device malloc");
        Ok(DevicePtr { device, id, bytes })
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let d = self.device(ptr.device)?;
        if d.allocations.lock().remove(&ptr.id).is_none() {
            return Err(Error::Device(format!(
                "double free of device allocation {}",
                ptr.id
            )));
        }
        d.used.fetch_sub(ptr.bytes, Ordering::AcqRel);
        Ok(())
    }

    fn memcpy_h2d(
        &self,
        dst: DevicePtr,
        dst_offset: usize,
        src: &[u8],
        stream: Option<StreamHandle>,
    ) -> Result<()> {
        Self::check_range(dst, dst_offset, src.len())?;
        let d = self.device(dst.device)?;
        self.submit(d, stream)?;
        let mut allocs = d.allocations.lock();
        let mem = allocs
            .get_mut(&dst.id)
            .ok_or_else(|| Error::Device(format!("allocation {} is not live", dst.id)))?;
        mem[dst_offset..dst_offset + src.len()].copy_from_slice(src);
        self.h2d.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn memcpy_d2h(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        src_offset: usize,
        stream: Option<StreamHandle>,
    ) -> Result<()> {
        Self::check_range(src, src_offset, dst.len())?;
        let d = self.device(src.device)?;
        self.submit(d, stream)?;
        let allocs = d.allocations.lock();
        let mem = allocs
            .get(&src.id)
            .ok_or_else(|| Error::Device(format!("allocation {} is not live", src.id)))?;
        dst.copy_from_slice(&mem[src_offset..src_offset + dst.len()]);
        self.d2h.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn memcpy_d2d(
        &self,
        dst: DevicePtr,
        dst_offset: usize,
        src: DevicePtr,
        src_offset: usize,
        bytes: usize,
        stream: Option<StreamHandle>,
    ) -> Result<()> {
        Self::check_range(dst, dst_offset, bytes)?;
        Self::check_range(src, src_offset, bytes)?;
        // stage through the host; allocations may live on different devices
        let mut staging = vec![0u8; bytes];
        {
            let sd = self.device(src.device)?;
            let allocs = sd.allocations.lock();
            let mem = allocs
                .get(&src.id)
                .ok_or_else(|| Error::Device(format!("allocation {} is not live", src.id)))?;
            staging.copy_from_slice(&mem[src_offset..src_offset + bytes]);
        }
        let dd = self.device(dst.device)?;
        self.submit(dd, stream)?;
        let mut allocs = dd.allocations.lock();
        let mem = allocs
            .get_mut(&dst.id)
            .ok_or_else(|| Error::Device(format!("allocation {} is not live", dst.id)))?;
        mem[dst_offset..dst_offset + bytes].copy_from_slice(&staging);
        Ok(())
    }

    fn memset(
        &self,
        dst: DevicePtr,
        offset: usize,
        value: u8,
        bytes: usize,
        stream: Option<StreamHandle>,
    ) -> Result<()> {
        Self::check_range(dst, offset, bytes)?;
        let d = self.device(dst.device)?;
        self.submit(d, stream)?;
        let mut allocs = d.allocations.lock();
        let mem = allocs
            .get_mut(&dst.id)
            .ok_or_else(|| Error::Device(format!("allocation {} is not live", dst.id)))?;
        mem[offset..offset + bytes].fill(value);
        Ok(())
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamHandle> {
        let d = self.device(device)?;
        let id = self.handle();
        d.streams.lock().insert(id, StreamState::default());
        Ok(StreamHandle { device, id })
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        let d = self.device(stream.device)?;
        d.streams
            .lock()
            .remove(&stream.id)
            .map(|_| ())
            .ok_or_else(|| Error::Device(format!("stream {} is not live", stream.id)))
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()> {
        let d = self.device(stream.device)?;
        let mut streams = d.streams.lock();
        let state = streams
            .get_mut(&stream.id)
            .ok_or_else(|| Error::Device(format!("stream {} is not live", stream.id)))?;
        state.completed = state.submitted;
        Ok(())
    }

    fn create_event(&self, device: DeviceId) -> Result<EventHandle> {
        let d = self.device(device)?;
        let id = self.handle();
        d.events.lock().insert(id, None);
        Ok(EventHandle { device, id })
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> Result<()> {
        if event.device != stream.device {
            return Err(Error::Device(format!(
                "event on device {} cannot record stream on device {}",
                event.device, stream.device
            )));
        }
        let d = self.device(event.device)?;
        let submitted = d
            .streams
            .lock()
            .get(&stream.id)
            .map(|s| s.submitted)
            .ok_or_else(|| Error::Device(format!("stream {} is not live", stream.id)))?;
        let mut events = d.events.lock();
        let slot = events
            .get_mut(&event.id)
            .ok_or_else(|| Error::Device(format!("event {} is not live", event.id)))?;
        *slot = Some((stream.id, submitted));
        Ok(())
    }

    fn synchronize_event(&self, event: EventHandle) -> Result<()> {
        let d = self.device(event.device)?;
        let recorded = *d
            .events
            .lock()
            .get(&event.id)
            .ok_or_else(|| Error::Device(format!("event {} is not live", event.id)))?;
        if let Some((stream, upto)) = recorded {
            if let Some(state) = d.streams.lock().get_mut(&stream) {
                state.completed = state.completed.max(upto);
            }
        }
        Ok(())
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        let d = self.device(event.device)?;
        d.events
            .lock()
            .remove(&event.id)
            .map(|_| ())
            .ok_or_else(|| Error::Device(format!("event {} is not live", event.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_accounting() {
        let rt = EmulatedRuntime::new(1, 1024);
        let p = rt.malloc(0, 600).unwrap();
        assert_eq!(rt.device_info(0).unwrap().free_memory, 424);
        let err = rt.malloc(0, 600).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfMemory {
                side: Side::Secondary,
                ..
            }
        ));
        rt.free(p).unwrap();
        assert_eq!(rt.device_info(0).unwrap().free_memory, 1024);
        assert!(rt.free(p).is_err());
    }

    #[test]
    fn test_copies_roundtrip() {
        let rt = EmulatedRuntime::default();
        let p = rt.malloc(0, 8).unwrap();
        rt.memcpy_h2d(p, 2, &[1, 2, 3], None).unwrap();
        let mut out = [0u8; 8];
        rt.memcpy_d2h(&mut out, p, 0, None).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 0, 0, 0]);
        assert_eq!(rt.h2d_transfers(), 1);
        assert_eq!(rt.d2h_transfers(), 1);
        assert!(rt.memcpy_h2d(p, 7, &[1, 2], None).is_err());
    }

    #[test]
    fn test_streams_and_events() {
        let rt = EmulatedRuntime::new(2, 64);
        let s = rt.create_stream(1).unwrap();
        let e = rt.create_event(1).unwrap();
        let p = rt.malloc(1, 4).unwrap();
        rt.memset(p, 0, 7, 4, Some(s)).unwrap();
        rt.record_event(e, s).unwrap();
        rt.synchronize_event(e).unwrap();
        rt.synchronize_stream(s).unwrap();
        rt.destroy_event(e).unwrap();
        rt.destroy_stream(s).unwrap();
        assert!(rt.synchronize_stream(s).is_err());
    }

    #[test]
    fn test_host_only_has_no_devices() {
        let rt = EmulatedRuntime::host_only();
        assert_eq!(rt.device_count(), 0);
        assert!(matches!(rt.malloc(0, 4), Err(Error::Device(_))));
    }
}
