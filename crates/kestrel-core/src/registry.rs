use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::descriptor::ShapeDescriptor;
use crate::dtype::DType;
use crate::error::Result;
use crate::shape::{Order, Shape};

// ShapeRegistry — Interning cache for shape descriptors
//
// Two descriptors with the same extents, strides, offset, dtype and order
// are interchangeable, so the registry hands out one shared Arc per distinct
// descriptor. It is an explicit service object: the engine creates one and
// injects it where needed, tests build fresh ones for isolation.
//
// Lookups take the read lock. A miss re-checks under the write lock before
// inserting, so racing threads interning the same descriptor all end up with
// the winner's Arc.

/// Snapshot of registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Process-scoped interning cache for [`ShapeDescriptor`]s.
#[derive(Debug, Default)]
pub struct ShapeRegistry {
    entries: RwLock<HashMap<ShapeDescriptor, Arc<ShapeDescriptor>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ShapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and intern a descriptor with explicit strides.
    pub fn describe(
        &self,
        extents: impl Into<Shape>,
        strides: Vec<isize>,
        dtype: DType,
        order: Order,
    ) -> Result<Arc<ShapeDescriptor>> {
        Ok(self.intern(ShapeDescriptor::new(extents, strides, dtype, order)?))
    }

    /// Build and intern a dense descriptor.
    pub fn dense(
        &self,
        extents: impl Into<Shape>,
        dtype: DType,
        order: Order,
    ) -> Result<Arc<ShapeDescriptor>> {
        Ok(self.intern(ShapeDescriptor::dense(extents, dtype, order)?))
    }

    /// Derive and intern a view of `parent`.
    pub fn derive_view(
        &self,
        parent: &ShapeDescriptor,
        extents: impl Into<Shape>,
        strides: Vec<isize>,
        offset: isize,
    ) -> Result<Arc<ShapeDescriptor>> {
        Ok(self.intern(parent.derive_view(extents, strides, offset)?))
    }

    /// Return the shared instance equal to `desc`, inserting it if absent.
    pub fn intern(&self, desc: ShapeDescriptor) -> Arc<ShapeDescriptor> {
        if let Some(found) = self.entries.read().get(&desc) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(found);
        }
        let mut map = self.entries.write();
        if let Some(found) = map.get(&desc) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(found);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(dims = ?desc.dims(), dtype = %desc.dtype(), "interning shape descriptor");
        let shared = Arc::new(desc.clone());
        map.insert(desc, Arc::clone(&shared));
        shared
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached descriptor. Arcs already handed out stay valid.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_interning_dedupes() {
        let reg = ShapeRegistry::new();
        let a = reg.dense(vec![2, 3], DType::F32, Order::C).unwrap();
        let b = reg
            .describe(vec![2, 3], vec![3, 1], DType::F32, Order::C)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);

        let c = reg.dense(vec![2, 3], DType::F64, Order::C).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_concurrent_intern_single_entry() {
        let reg = Arc::new(ShapeRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || reg.dense(vec![4, 4], DType::F32, Order::C).unwrap())
            })
            .collect();
        let results: Vec<Arc<ShapeDescriptor>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(reg.len(), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reg.stats().misses, 1);
    }

    #[test]
    fn test_clear_keeps_outstanding_arcs() {
        let reg = ShapeRegistry::new();
        let a = reg.dense(vec![5], DType::I32, Order::C).unwrap();
        reg.clear();
        assert!(reg.is_empty());
        assert_eq!(a.length(), 5);
    }
}
