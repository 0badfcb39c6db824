use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::descriptor::ShapeDescriptor;
use crate::error::{Error, Result};
use crate::registry::ShapeRegistry;
use crate::shape::Shape;

// TAD — Tensor-along-dimension decomposition
//
// Reductions and broadcasts along a set of axes work tile by tile. For a
// parent shape and a set of *reduced* axes:
//
//   - the tile spans the reduced axes (tile shape = their extents, tile
//     strides = the parent's strides on those axes);
//   - there is one tile per combination of the *kept* axes, enumerated in
//     row-major order of the kept indices;
//   - each tile has a precomputed storage offset.
//
// Example: [3, 4, 5] reducing axis 1 → 15 tiles of shape [4], stride 5.
//
// Kernels get the offset table up front and walk each tile with the tile
// descriptor, so the hot loop never re-derives multi-indices. Plans are
// cached per (descriptor, axis set) for the lifetime of the planner.

/// One decomposition of a parent array into tiles.
#[derive(Debug)]
pub struct TadPack {
    /// Descriptor of a single tile. Its offset compensates for negative
    /// strides so that `tile_offset + tile.offset()` is the tile's first
    /// element.
    tile: Arc<ShapeDescriptor>,
    /// Base storage index of each tile, in row-major order of kept indices.
    offsets: Vec<usize>,
    reduced_axes: Vec<usize>,
    kept_axes: Vec<usize>,
    kept_extents: Vec<usize>,
}

impl TadPack {
    pub fn tile(&self) -> &Arc<ShapeDescriptor> {
        &self.tile
    }

    pub fn tile_shape(&self) -> &[usize] {
        self.tile.dims()
    }

    /// Number of elements in one tile.
    pub fn tile_length(&self) -> usize {
        self.tile.length()
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn num_tiles(&self) -> usize {
        self.offsets.len()
    }

    pub fn reduced_axes(&self) -> &[usize] {
        &self.reduced_axes
    }

    pub fn kept_axes(&self) -> &[usize] {
        &self.kept_axes
    }

    /// Extents of the kept axes, i.e. the shape of a per-tile result.
    pub fn kept_extents(&self) -> &[usize] {
        &self.kept_extents
    }

    /// Storage indices of every element of tile `t`, in logical order.
    pub fn tile_indices(&self, t: usize) -> impl Iterator<Item = usize> + '_ {
        let base = self.offsets[t];
        self.tile.offsets().map(move |o| base + o)
    }
}

/// Normalise an axis list against `rank`: negative axes count from the end;
/// the result is sorted. Out-of-range and repeated axes are errors.
pub fn normalize_axes(axes: &[i64], rank: usize) -> Result<Vec<usize>> {
    let mut out = Vec::with_capacity(axes.len());
    for &a in axes {
        let norm = if a < 0 { a + rank as i64 } else { a };
        if norm < 0 || norm >= rank as i64 {
            return Err(Error::AxisOutOfRange { axis: a, rank });
        }
        out.push(norm as usize);
    }
    out.sort_unstable();
    for w in out.windows(2) {
        if w[0] == w[1] {
            return Err(Error::DuplicateAxis { axis: w[0] });
        }
    }
    Ok(out)
}

/// Snapshot of planner statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

type TadKey = (ShapeDescriptor, Vec<usize>);

/// Computes and caches [`TadPack`]s.
#[derive(Debug)]
pub struct TadPlanner {
    registry: Arc<ShapeRegistry>,
    cache: RwLock<HashMap<TadKey, Arc<TadPack>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TadPlanner {
    pub fn new(registry: Arc<ShapeRegistry>) -> Self {
        TadPlanner {
            registry,
            cache: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Plan (or fetch the cached plan for) `shape` reduced along `axes`.
    pub fn plan(&self, shape: &ShapeDescriptor, axes: &[i64]) -> Result<Arc<TadPack>> {
        let reduced = normalize_axes(axes, shape.rank())?;
        let key = (shape.clone(), reduced);

        if let Some(found) = self.cache.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(found));
        }

        let pack = Arc::new(self.compute(shape, &key.1)?);
        let mut cache = self.cache.write();
        let entry = cache.entry(key).or_insert_with(|| {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                dims = ?shape.dims(),
                axes = ?pack.reduced_axes,
                tiles = pack.num_tiles(),
                "planned TAD"
            );
            pack
        });
        Ok(Arc::clone(entry))
    }

    fn compute(&self, shape: &ShapeDescriptor, reduced: &[usize]) -> Result<TadPack> {
        let rank = shape.rank();
        let kept: Vec<usize> = (0..rank).filter(|a| !reduced.contains(a)).collect();
        let dims = shape.dims();
        let strides = shape.strides();

        let tile_dims: Vec<usize> = reduced.iter().map(|&a| dims[a]).collect();
        let tile_strides: Vec<isize> = reduced.iter().map(|&a| strides[a]).collect();
        // shift so the tile descriptor never addresses below zero
        let shift: isize = tile_dims
            .iter()
            .zip(&tile_strides)
            .filter(|&(_, &s)| s < 0)
            .map(|(&d, &s)| (d.max(1) as isize - 1) * -s)
            .sum();
        let tile = ShapeDescriptor::with_offset(
            Shape::new(tile_dims),
            tile_strides,
            shift as usize,
            shape.dtype(),
            shape.order(),
        )?;
        let tile = self.registry.intern(tile);

        let kept_extents: Vec<usize> = kept.iter().map(|&a| dims[a]).collect();
        let offsets = if shape.is_empty() {
            Vec::new()
        } else {
            let count: usize = kept_extents.iter().product();
            let mut offsets = Vec::with_capacity(count);
            let mut index = vec![0usize; kept.len()];
            let mut flat = shape.offset() as isize;
            for _ in 0..count {
                offsets.push((flat - shift) as usize);
                for k in (0..kept.len()).rev() {
                    let s = strides[kept[k]];
                    index[k] += 1;
                    flat += s;
                    if index[k] < kept_extents[k] {
                        break;
                    }
                    flat -= s * kept_extents[k] as isize;
                    index[k] = 0;
                }
            }
            offsets
        };

        Ok(TadPack {
            tile,
            offsets,
            reduced_axes: reduced.to_vec(),
            kept_axes: kept,
            kept_extents,
        })
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached plan.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    pub fn stats(&self) -> PlannerStats {
        PlannerStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::shape::Order;

    fn planner() -> TadPlanner {
        TadPlanner::new(Arc::new(ShapeRegistry::new()))
    }

    fn dense(dims: &[usize]) -> ShapeDescriptor {
        ShapeDescriptor::dense(dims, DType::F32, Order::C).unwrap()
    }

    fn coverage(pack: &TadPack) -> Vec<usize> {
        let mut all: Vec<usize> = (0..pack.num_tiles())
            .flat_map(|t| pack.tile_indices(t).collect::<Vec<_>>())
            .collect();
        all.sort_unstable();
        all
    }

    #[test]
    fn test_middle_axis_plan() {
        let p = planner();
        let pack = p.plan(&dense(&[3, 4, 5]), &[1]).unwrap();
        assert_eq!(pack.num_tiles(), 15);
        assert_eq!(pack.tile_shape(), &[4]);
        assert_eq!(pack.tile().strides(), &[5]);
        assert_eq!(pack.kept_extents(), &[3, 5]);
        assert_eq!(&pack.offsets()[..6], &[0, 1, 2, 3, 4, 20]);
        assert_eq!(coverage(&pack), (0..60).collect::<Vec<_>>());
    }

    #[test]
    fn test_all_axes_single_tile() {
        let pack = planner().plan(&dense(&[2, 3]), &[0, 1]).unwrap();
        assert_eq!(pack.num_tiles(), 1);
        assert_eq!(pack.tile_length(), 6);
        assert_eq!(pack.offsets(), &[0]);
    }

    #[test]
    fn test_no_axes_tile_per_element() {
        let pack = planner().plan(&dense(&[2, 3]), &[]).unwrap();
        assert_eq!(pack.num_tiles(), 6);
        assert_eq!(pack.tile_length(), 1);
        assert_eq!(pack.offsets(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_empty_shape_zero_tiles() {
        let pack = planner().plan(&dense(&[3, 0]), &[1]).unwrap();
        assert_eq!(pack.num_tiles(), 0);
    }

    #[test]
    fn test_negative_and_invalid_axes() {
        let p = planner();
        let a = p.plan(&dense(&[3, 4]), &[-1]).unwrap();
        let b = p.plan(&dense(&[3, 4]), &[1]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            p.plan(&dense(&[3, 4]), &[2]),
            Err(Error::AxisOutOfRange { .. })
        ));
        assert!(matches!(
            p.plan(&dense(&[3, 4]), &[0, 0]),
            Err(Error::DuplicateAxis { axis: 0 })
        ));
    }

    #[test]
    fn test_transposed_parent_coverage() {
        let parent = dense(&[3, 4]).transpose(0, 1).unwrap();
        let pack = planner().plan(&parent, &[0]).unwrap();
        assert_eq!(pack.num_tiles(), 3);
        assert_eq!(pack.tile_shape(), &[4]);
        let first: Vec<usize> = pack.tile_indices(0).collect();
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(coverage(&pack), (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_negative_stride_tile() {
        let parent = dense(&[2, 3]);
        // reverse each row
        let rev = parent.derive_view(vec![2, 3], vec![3, -1], 2).unwrap();
        let pack = planner().plan(&rev, &[1]).unwrap();
        let row0: Vec<usize> = pack.tile_indices(0).collect();
        let row1: Vec<usize> = pack.tile_indices(1).collect();
        assert_eq!(row0, vec![2, 1, 0]);
        assert_eq!(row1, vec![5, 4, 3]);
    }

    #[test]
    fn test_cache_hits() {
        let p = planner();
        let d = dense(&[4, 4]);
        p.plan(&d, &[0]).unwrap();
        p.plan(&d, &[0]).unwrap();
        let stats = p.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_concurrent_plans_share_one_pack() {
        let p = Arc::new(planner());
        let d = dense(&[6, 5, 4]);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&p);
                let d = d.clone();
                std::thread::spawn(move || p.plan(&d, &[2, 0]).unwrap())
            })
            .collect();
        let packs: Vec<Arc<TadPack>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(packs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        let stats = p.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits + stats.misses, 8);
    }
}
