// Special ops — data movement that does not fit an op family
//
// Gathering, scattering, shuffling and splitting tiles, n-ary averaging and
// accumulation, sorting (plain and keyed), all-pairs tile distances, dtype
// conversion and array inspection. They share the dispatch conventions:
// inputs are snapshotted before the output is written, and failures land in
// the engine's last-error slot.
//
// Pure data movement (gather, scatter-assign, shuffle, tear, sort and
// same-type conversion) copies encoded elements and never goes through f64,
// so 64-bit integers survive unchanged.

use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use kestrel_core::{
    DType, DataBuffer, Error, Order, RandomGenerator, Result, ShapeDescriptor, TadPack,
};

use crate::engine::Engine;
use crate::exec::context::Operand;
use crate::exec::kernels::HostArray;
use crate::exec::ops::{BinaryOp, Op, OpFamily};

fn check_same_dims(inputs: &[&Operand]) -> Result<()> {
    let first = inputs
        .first()
        .ok_or_else(|| Error::execution("n-ary op needs at least one input"))?;
    for x in &inputs[1..] {
        if x.dims() != first.dims() {
            return Err(Error::ShapeMismatch {
                expected: first.dims().to_vec(),
                got: x.dims().to_vec(),
            });
        }
    }
    Ok(())
}

/// Validate tile indexes against the number of tiles available.
fn tile_rows(indexes: &[i64], tiles: usize) -> Result<Vec<usize>> {
    indexes
        .iter()
        .map(|&i| {
            usize::try_from(i)
                .ok()
                .filter(|&i| i < tiles)
                .ok_or_else(|| {
                    Error::execution(format!("row index {i} out of range for {tiles} tiles"))
                })
        })
        .collect()
}

/// Storage indices of every tile of `pack`.
fn tile_table(pack: &TadPack) -> Vec<Vec<usize>> {
    (0..pack.num_tiles())
        .map(|t| pack.tile_indices(t).collect())
        .collect()
}

/// Every element of `x` as a single tile, in logical order.
fn whole_array(x: &Operand) -> Vec<Vec<usize>> {
    vec![x.shape.offsets().collect()]
}

/// Write `src` elements into `target` so that position `j` of each tile
/// receives the element at position `order[j]` of the same tile.
fn permute_tiles(
    target: &Operand,
    src: &HostArray,
    tiles: &[Vec<usize>],
    orders: &[Vec<usize>],
) -> Result<()> {
    let dtype = target.dtype();
    target.buffer.write_primary(|bytes| {
        for (tile, order) in tiles.iter().zip(orders) {
            for (&dst, &from) in tile.iter().zip(order) {
                dtype
                    .element_mut(bytes, dst)
                    .copy_from_slice(src.element(tile[from]));
            }
        }
    })
}

/// Summary of an array's contents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ArrayInspection {
    pub length: usize,
    /// Extremes and moments over the non-NaN elements; NaN when there are
    /// none.
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub zeros: usize,
    pub positives: usize,
    pub negatives: usize,
    pub infinities: usize,
    pub nans: usize,
}

impl ArrayInspection {
    fn of(values: &[f64]) -> Self {
        let mut out = ArrayInspection {
            length: values.len(),
            min: f64::NAN,
            max: f64::NAN,
            mean: f64::NAN,
            std_dev: f64::NAN,
            zeros: 0,
            positives: 0,
            negatives: 0,
            infinities: 0,
            nans: 0,
        };
        let mut sum = 0.0;
        let mut counted = 0usize;
        for &v in values {
            if v.is_nan() {
                out.nans += 1;
                continue;
            }
            if v.is_infinite() {
                out.infinities += 1;
            }
            match v.partial_cmp(&0.0) {
                Some(std::cmp::Ordering::Greater) => out.positives += 1,
                Some(std::cmp::Ordering::Less) => out.negatives += 1,
                _ => out.zeros += 1,
            }
            out.min = out.min.min(v);
            out.max = out.max.max(v);
            sum += v;
            counted += 1;
        }
        if counted > 0 {
            let mean = sum / counted as f64;
            let ss: f64 = values
                .iter()
                .filter(|v| !v.is_nan())
                .map(|v| (v - mean) * (v - mean))
                .sum();
            out.mean = mean;
            out.std_dev = (ss / counted as f64).sqrt();
        }
        out
    }
}

impl Engine {
    fn fresh_operand(&self, desc: ShapeDescriptor) -> Result<Operand> {
        let buffer = DataBuffer::allocate(
            Arc::clone(self.runtime()),
            desc.length(),
            desc.dtype(),
            false,
        )?;
        Ok(Operand::new(Arc::new(buffer), self.shapes().intern(desc)))
    }

    /// Write logical-order `values` into `z`.
    fn store_logical(&self, z: &Operand, values: &[f64]) -> Result<()> {
        let desc = Arc::clone(&z.shape);
        let dtype = desc.dtype();
        z.buffer.write_primary(|bytes| {
            for (o, &v) in desc.offsets().zip(values) {
                dtype.store(bytes, o, v);
            }
        })
    }

    /// Write logical-order elements already encoded in `z`'s dtype.
    fn store_encoded(&self, z: &Operand, elements: &[u8]) -> Result<()> {
        let desc = Arc::clone(&z.shape);
        let dtype = desc.dtype();
        let size = dtype.size_in_bytes();
        z.buffer.write_primary(|bytes| {
            for (o, chunk) in desc.offsets().zip(elements.chunks_exact(size)) {
                dtype.element_mut(bytes, o).copy_from_slice(chunk);
            }
        })
    }

    /// Gather the tiles of `x` along `dimensions` named by `indexes` into a
    /// packed output: tile `indexes[i]` becomes tile `i` of `z`. Without `z`
    /// the output has shape `[indexes.len(), tile...]`.
    #[tracing::instrument(level = "debug", skip_all, fields(rows = indexes.len()))]
    pub fn pull_rows(
        &self,
        x: &Operand,
        z: Option<&Operand>,
        dimensions: &[i64],
        indexes: &[i64],
    ) -> Result<Operand> {
        let result = (|| -> Result<Operand> {
            let xp = self.tads().plan(&x.shape, dimensions)?;
            let (z, z_axes) = match z {
                Some(z) => (z.clone(), dimensions.to_vec()),
                None => {
                    let mut dims = vec![indexes.len()];
                    dims.extend_from_slice(xp.tile_shape());
                    let axes = (1..dims.len() as i64).collect::<Vec<_>>();
                    let desc = ShapeDescriptor::dense(dims, x.dtype(), Order::C)?;
                    (self.fresh_operand(desc)?, axes)
                }
            };
            let zp = self.tads().plan(&z.shape, &z_axes)?;
            if zp.num_tiles() != indexes.len() || zp.tile_length() != xp.tile_length() {
                return Err(Error::shape(format!(
                    "output holds {} tiles of {} elements, need {} tiles of {}",
                    zp.num_tiles(),
                    zp.tile_length(),
                    indexes.len(),
                    xp.tile_length()
                )));
            }
            let rows = tile_rows(indexes, xp.num_tiles())?;

            let src = HostArray::snapshot(x)?;
            let (from, to) = (x.dtype(), z.dtype());
            z.buffer.write_primary(|bytes| {
                for (t, &row) in rows.iter().enumerate() {
                    for (zi, xi) in zp.tile_indices(t).zip(xp.tile_indices(row)) {
                        from.convert_element(src.element(xi), to, to.element_mut(bytes, zi));
                    }
                }
            })?;
            Ok(z)
        })();
        self.last_error().track(result)
    }

    /// Combine tile `i` of `updates` into tile `indexes[i]` of `x`, in place,
    /// with the pairwise op `code` (`x = op(x, update)`). Repeated indexes
    /// apply in order. Copy assigns the update unchanged.
    #[tracing::instrument(level = "debug", skip_all, fields(code = code, rows = indexes.len()))]
    pub fn scatter_update(
        &self,
        code: i32,
        x: &Operand,
        updates: &Operand,
        dimensions: &[i64],
        indexes: &[i64],
    ) -> Result<()> {
        let result = (|| -> Result<()> {
            let op = match self.ops().resolve(OpFamily::Pairwise, code)? {
                Op::Pairwise(b) => b,
                other => {
                    return Err(Error::execution(format!("{other} cannot drive a scatter")))
                }
            };
            let xp = self.tads().plan(&x.shape, dimensions)?;
            let up = self.tads().plan(&updates.shape, dimensions)?;
            if up.num_tiles() != indexes.len() || up.tile_length() != xp.tile_length() {
                return Err(Error::shape(format!(
                    "updates hold {} tiles of {} elements, need {} tiles of {}",
                    up.num_tiles(),
                    up.tile_length(),
                    indexes.len(),
                    xp.tile_length()
                )));
            }
            let rows = tile_rows(indexes, xp.num_tiles())?;
            let src = HostArray::snapshot(updates)?;
            let (to, from) = (x.dtype(), updates.dtype());
            x.buffer.write_primary(|bytes| {
                for (i, &row) in rows.iter().enumerate() {
                    for (xi, ui) in xp.tile_indices(row).zip(up.tile_indices(i)) {
                        if op == BinaryOp::Copy {
                            from.convert_element(src.element(ui), to, to.element_mut(bytes, xi));
                        } else {
                            let v = op.apply(to.load(bytes, xi), src.at(ui));
                            to.store(bytes, xi, v);
                        }
                    }
                }
            })
        })();
        self.last_error().track(result)
    }

    /// Permute the tiles along `dimensions` of every input with one shared
    /// permutation: tile `t` of each input receives what tile `map[t]` held.
    /// All inputs must split into the same number of tiles.
    pub fn shuffle_with_map(
        &self,
        inputs: &[&Operand],
        dimensions: &[i64],
        map: &[usize],
    ) -> Result<()> {
        let result = (|| -> Result<()> {
            let mut seen = vec![false; map.len()];
            for &m in map {
                match seen.get_mut(m) {
                    Some(slot) if !*slot => *slot = true,
                    _ => {
                        return Err(Error::execution(format!(
                            "shuffle map {map:?} is not a permutation"
                        )))
                    }
                }
            }
            for x in inputs {
                let pack = self.tads().plan(&x.shape, dimensions)?;
                if pack.num_tiles() != map.len() {
                    return Err(Error::shape(format!(
                        "array of shape {:?} splits into {} tiles, shuffle map has {}",
                        x.dims(),
                        pack.num_tiles(),
                        map.len()
                    )));
                }
            }
            for x in inputs {
                let pack = self.tads().plan(&x.shape, dimensions)?;
                let src = HostArray::snapshot(x)?;
                let dtype = x.dtype();
                x.buffer.write_primary(|bytes| {
                    for (t, &from) in map.iter().enumerate() {
                        for (dst, orig) in pack.tile_indices(t).zip(pack.tile_indices(from)) {
                            dtype.element_mut(bytes, dst).copy_from_slice(src.element(orig));
                        }
                    }
                })?;
            }
            Ok(())
        })();
        self.last_error().track(result)
    }

    /// Shuffle the tiles along `dimensions` of every input with one random
    /// permutation drawn from `rng`.
    pub fn shuffle(
        &self,
        inputs: &[&Operand],
        dimensions: &[i64],
        rng: &mut RandomGenerator,
    ) -> Result<Vec<usize>> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::execution("shuffle needs at least one input"));
        let tiles = self
            .last_error()
            .track(first.and_then(|x| self.tads().plan(&x.shape, dimensions)))?
            .num_tiles();
        let mut map: Vec<usize> = (0..tiles).collect();
        for i in (1..tiles).rev() {
            let j = (rng.next_i64() as u64 % (i as u64 + 1)) as usize;
            map.swap(i, j);
        }
        self.shuffle_with_map(inputs, dimensions, &map)?;
        tracing::trace!(tiles, "shuffled");
        Ok(map)
    }

    /// Split `x` into one dense operand per tile along `dimensions`.
    pub fn tear(&self, x: &Operand, dimensions: &[i64]) -> Result<Vec<Operand>> {
        let result = (|| -> Result<Vec<Operand>> {
            let pack = self.tads().plan(&x.shape, dimensions)?;
            let src = HostArray::snapshot(x)?;
            (0..pack.num_tiles())
                .map(|t| -> Result<Operand> {
                    let desc = ShapeDescriptor::dense(pack.tile_shape(), x.dtype(), Order::C)?;
                    let part = self.fresh_operand(desc)?;
                    let elements: Vec<u8> = pack
                        .tile_indices(t)
                        .flat_map(|i| src.element(i).iter().copied())
                        .collect();
                    self.store_encoded(&part, &elements)?;
                    Ok(part)
                })
                .collect()
        })();
        self.last_error().track(result)
    }

    fn n_ary(
        &self,
        inputs: &[&Operand],
        z: Option<&Operand>,
        scale: impl Fn(f64) -> f64 + Sync + Send,
    ) -> Result<(Operand, Vec<f64>)> {
        check_same_dims(inputs)?;
        let hosts = inputs
            .iter()
            .map(|x| HostArray::snapshot(x))
            .collect::<Result<Vec<_>>>()?;
        let n = hosts[0].len();
        let values: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| scale(hosts.iter().map(|h| h.logical(i)).sum()))
            .collect();
        let z = match z {
            Some(z) if z.dims() != inputs[0].dims() => {
                return Err(Error::ShapeMismatch {
                    expected: inputs[0].dims().to_vec(),
                    got: z.dims().to_vec(),
                })
            }
            Some(z) => z.clone(),
            None => self.fresh_operand(ShapeDescriptor::dense(
                inputs[0].dims(),
                inputs[0].dtype(),
                Order::C,
            )?)?,
        };
        self.store_logical(&z, &values)?;
        Ok((z, values))
    }

    /// Elementwise mean of `inputs`. With `propagate`, every input is
    /// overwritten with the mean as well.
    pub fn average(
        &self,
        inputs: &[&Operand],
        z: Option<&Operand>,
        propagate: bool,
    ) -> Result<Operand> {
        let result = (|| -> Result<Operand> {
            let count = inputs.len() as f64;
            let (z, values) = self.n_ary(inputs, z, |s| s / count)?;
            if propagate {
                for x in inputs {
                    self.store_logical(x, &values)?;
                }
            }
            Ok(z)
        })();
        self.last_error().track(result)
    }

    /// Elementwise sum of `inputs`.
    pub fn accumulate(&self, inputs: &[&Operand], z: Option<&Operand>) -> Result<Operand> {
        let result = self.n_ary(inputs, z, |s| s).map(|(z, _)| z);
        self.last_error().track(result)
    }

    /// Sort each tile of `keys` in place; when `values` is given, its
    /// matching tile is reordered the same way. The sort is stable.
    fn sort_tiles(
        &self,
        keys: &Operand,
        key_tiles: &[Vec<usize>],
        values: Option<(&Operand, &[Vec<usize>])>,
        descending: bool,
    ) -> Result<()> {
        if let Some((v, v_tiles)) = values {
            if v.buffer.same_storage(&keys.buffer) {
                return Err(Error::execution("keys and values must not share storage"));
            }
            let fits = v_tiles.len() == key_tiles.len()
                && v_tiles.iter().zip(key_tiles).all(|(a, b)| a.len() == b.len());
            if !fits {
                return Err(Error::ShapeMismatch {
                    expected: keys.dims().to_vec(),
                    got: v.dims().to_vec(),
                });
            }
        }
        let dtype = keys.dtype();
        let ks = HostArray::snapshot(keys)?;
        let orders: Vec<Vec<usize>> = key_tiles
            .par_iter()
            .map(|tile| {
                let mut order: Vec<usize> = (0..tile.len()).collect();
                order.par_sort_by(|&a, &b| {
                    let o = dtype.compare(ks.element(tile[a]), ks.element(tile[b]));
                    if descending {
                        o.reverse()
                    } else {
                        o
                    }
                });
                order
            })
            .collect();
        permute_tiles(keys, &ks, key_tiles, &orders)?;
        if let Some((v, v_tiles)) = values {
            let vs = HostArray::snapshot(v)?;
            permute_tiles(v, &vs, v_tiles, &orders)?;
        }
        Ok(())
    }

    fn tiles_of(&self, x: &Operand, dimensions: &[i64]) -> Result<Vec<Vec<usize>>> {
        Ok(tile_table(&*self.tads().plan(&x.shape, dimensions)?))
    }

    /// Sort all elements of `x` in place, in logical order.
    pub fn sort(&self, x: &Operand, descending: bool) -> Result<()> {
        let result = self.sort_tiles(x, &whole_array(x), None, descending);
        self.last_error().track(result)
    }

    /// Sort every tile of `x` along `dimensions` independently, in place.
    pub fn sort_tad(&self, x: &Operand, dimensions: &[i64], descending: bool) -> Result<()> {
        let result = self
            .tiles_of(x, dimensions)
            .and_then(|tiles| self.sort_tiles(x, &tiles, None, descending));
        self.last_error().track(result)
    }

    /// Sort `x` and apply the same reordering to `y`, which must have as
    /// many elements.
    pub fn sort_by_key(&self, x: &Operand, y: &Operand, descending: bool) -> Result<()> {
        let ty = whole_array(y);
        let result = self.sort_tiles(x, &whole_array(x), Some((y, ty.as_slice())), descending);
        self.last_error().track(result)
    }

    /// Sort `y` and apply the same reordering to `x`.
    pub fn sort_by_value(&self, x: &Operand, y: &Operand, descending: bool) -> Result<()> {
        let tx = whole_array(x);
        let result = self.sort_tiles(y, &whole_array(y), Some((x, tx.as_slice())), descending);
        self.last_error().track(result)
    }

    /// Per-tile [`Engine::sort_by_key`] along `dimensions`.
    pub fn sort_tad_by_key(
        &self,
        x: &Operand,
        y: &Operand,
        dimensions: &[i64],
        descending: bool,
    ) -> Result<()> {
        let result = (|| -> Result<()> {
            let (tx, ty) = (self.tiles_of(x, dimensions)?, self.tiles_of(y, dimensions)?);
            self.sort_tiles(x, &tx, Some((y, ty.as_slice())), descending)
        })();
        self.last_error().track(result)
    }

    /// Per-tile [`Engine::sort_by_value`] along `dimensions`.
    pub fn sort_tad_by_value(
        &self,
        x: &Operand,
        y: &Operand,
        dimensions: &[i64],
        descending: bool,
    ) -> Result<()> {
        let result = (|| -> Result<()> {
            let (tx, ty) = (self.tiles_of(x, dimensions)?, self.tiles_of(y, dimensions)?);
            self.sort_tiles(y, &ty, Some((x, tx.as_slice())), descending)
        })();
        self.last_error().track(result)
    }

    /// Distance op `code` between every tile of `x` and every tile of `y`
    /// along `dimensions`. The output has shape `[x tiles, y tiles]`.
    #[tracing::instrument(level = "debug", skip_all, fields(code = code))]
    pub fn exec_reduce3_all(
        &self,
        code: i32,
        x: &Operand,
        y: &Operand,
        z: Option<&Operand>,
        dimensions: &[i64],
    ) -> Result<Operand> {
        let result = (|| -> Result<Operand> {
            let r = match self.ops().resolve(OpFamily::Reduce3, code)? {
                Op::Reduce3(r) => r,
                other => return Err(Error::execution(format!("{other} is not a distance op"))),
            };
            let xp = self.tads().plan(&x.shape, dimensions)?;
            let yp = self.tads().plan(&y.shape, dimensions)?;
            if xp.tile_length() != yp.tile_length() {
                return Err(Error::ShapeMismatch {
                    expected: xp.tile_shape().to_vec(),
                    got: yp.tile_shape().to_vec(),
                });
            }
            let dims = vec![xp.num_tiles(), yp.num_tiles()];
            let z = match z {
                Some(z) if z.dims() != dims.as_slice() => {
                    return Err(Error::ShapeMismatch {
                        expected: dims,
                        got: z.dims().to_vec(),
                    })
                }
                Some(z) => z.clone(),
                None => {
                    let dtype = if x.dtype().is_float() {
                        x.dtype()
                    } else {
                        DType::F32
                    };
                    self.fresh_operand(ShapeDescriptor::dense(dims, dtype, Order::C)?)?
                }
            };
            let (xs, ys) = (HostArray::snapshot(x)?, HostArray::snapshot(y)?);
            let cols = yp.num_tiles();
            let values: Vec<f64> = (0..xp.num_tiles() * cols)
                .into_par_iter()
                .map(|k| {
                    let pairs = xp
                        .tile_indices(k / cols)
                        .zip(yp.tile_indices(k % cols))
                        .map(|(a, b)| (xs.at(a), ys.at(b)));
                    r.reduce(pairs)
                })
                .collect();
            self.store_logical(&z, &values)?;
            Ok(z)
        })();
        self.last_error().track(result)
    }

    /// Copy of `x` converted to `dtype`, dense in row-major order.
    pub fn convert_types(&self, x: &Operand, dtype: DType) -> Result<Operand> {
        let result = (|| -> Result<Operand> {
            let src = HostArray::snapshot(x)?;
            let z = self.fresh_operand(ShapeDescriptor::dense(x.dims(), dtype, Order::C)?)?;
            self.store_encoded(&z, &src.elements_as(dtype))?;
            tracing::trace!(from = %x.dtype(), to = %dtype, len = src.len(), "converted");
            Ok(z)
        })();
        self.last_error().track(result)
    }

    /// Count and summarise the elements of `x`.
    pub fn inspect_array(&self, x: &Operand) -> Result<ArrayInspection> {
        let result = HostArray::snapshot(x).map(|src| ArrayInspection::of(&src.values()));
        if let Ok(info) = &result {
            tracing::debug!(
                dims = ?x.dims(),
                nans = info.nans,
                infinities = info.infinities,
                "inspected array"
            );
        }
        self.last_error().track(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::ErrorKind;

    #[test]
    fn test_pull_rows() {
        let engine = Engine::default();
        let x = engine
            .operand_from_slice(&[0.0f32, 1.0, 10.0, 11.0, 20.0, 21.0], &[3, 2])
            .unwrap();
        let z = engine.pull_rows(&x, None, &[1], &[2, 0]).unwrap();
        assert_eq!(z.dims(), &[2, 2]);
        assert_eq!(z.to_vec::<f32>().unwrap(), vec![20.0, 21.0, 0.0, 1.0]);

        let err = engine.pull_rows(&x, None, &[1], &[3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_tear_columns() {
        let engine = Engine::default();
        let x = engine
            .operand_from_slice(&[1i32, 2, 3, 4, 5, 6], &[2, 3])
            .unwrap();
        let parts = engine.tear(&x, &[0]).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].to_vec::<i32>().unwrap(), vec![2, 5]);
    }

    #[test]
    fn test_average_propagates() {
        let engine = Engine::default();
        let a = engine.operand_from_slice(&[1.0f64, 2.0], &[2]).unwrap();
        let b = engine.operand_from_slice(&[3.0f64, 6.0], &[2]).unwrap();
        let z = engine.average(&[&a, &b], None, true).unwrap();
        assert_eq!(z.to_vec::<f64>().unwrap(), vec![2.0, 4.0]);
        assert_eq!(a.to_vec::<f64>().unwrap(), vec![2.0, 4.0]);

        let sum = engine.accumulate(&[&a, &b], None).unwrap();
        assert_eq!(sum.to_vec::<f64>().unwrap(), vec![4.0, 8.0]);
    }

    #[test]
    fn test_sort_tad_rows_descending() {
        let engine = Engine::default();
        let x = engine
            .operand_from_slice(&[3.0f32, 1.0, 2.0, 0.5, 9.0, 4.0], &[2, 3])
            .unwrap();
        engine.sort_tad(&x, &[1], true).unwrap();
        assert_eq!(
            x.to_vec::<f32>().unwrap(),
            vec![3.0, 2.0, 1.0, 9.0, 4.0, 0.5]
        );
        engine.sort(&x, false).unwrap();
        assert_eq!(
            x.to_vec::<f32>().unwrap(),
            vec![0.5, 1.0, 2.0, 3.0, 4.0, 9.0]
        );
    }

    #[test]
    fn test_convert_types() {
        let engine = Engine::default();
        let x = engine.operand_from_slice(&[1.7f32, -2.2], &[2]).unwrap();
        let z = engine.convert_types(&x, DType::I32).unwrap();
        assert_eq!(z.dtype(), DType::I32);
        assert_eq!(z.to_vec::<i32>().unwrap(), vec![1, -2]);
        let h = engine.convert_types(&x, DType::F16).unwrap();
        assert_eq!(h.to_vec::<half::f16>().unwrap()[0], half::f16::from_f32(1.7));
    }

    const WIDE: i64 = (1i64 << 53) + 1;

    #[test]
    fn test_wide_integers_move_exactly() {
        let engine = Engine::default();
        let x = engine.operand_from_slice(&[WIDE, 7], &[2, 1]).unwrap();
        let z = engine.pull_rows(&x, None, &[1], &[1, 0]).unwrap();
        assert_eq!(z.to_vec::<i64>().unwrap(), vec![7, WIDE]);

        let parts = engine.tear(&x, &[1]).unwrap();
        assert_eq!(parts[0].to_vec::<i64>().unwrap(), vec![WIDE]);

        let same = engine.convert_types(&x, DType::I64).unwrap();
        assert_eq!(same.to_vec::<i64>().unwrap(), vec![WIDE, 7]);
        let unsigned = engine.convert_types(&x, DType::U64).unwrap();
        assert_eq!(unsigned.to_vec::<u64>().unwrap(), vec![WIDE as u64, 7]);
    }

    #[test]
    fn test_sort_keeps_wide_integers_distinct() {
        let engine = Engine::default();
        let x = engine
            .operand_from_slice(&[WIDE + 1, WIDE, 1i64 << 53, 3], &[2, 2])
            .unwrap();
        engine.sort_tad(&x, &[1], false).unwrap();
        assert_eq!(x.to_vec::<i64>().unwrap(), vec![WIDE, WIDE + 1, 3, 1 << 53]);
        engine.sort(&x, true).unwrap();
        assert_eq!(x.to_vec::<i64>().unwrap(), vec![WIDE + 1, WIDE, 1 << 53, 3]);
    }

    #[test]
    fn test_sort_by_key_and_value() {
        let engine = Engine::default();
        let keys = engine.operand_from_slice(&[3i32, 1, 2], &[3]).unwrap();
        let vals = engine.operand_from_slice(&[30.0f32, 10.0, 20.0], &[3]).unwrap();
        engine.sort_by_key(&keys, &vals, false).unwrap();
        assert_eq!(keys.to_vec::<i32>().unwrap(), vec![1, 2, 3]);
        assert_eq!(vals.to_vec::<f32>().unwrap(), vec![10.0, 20.0, 30.0]);

        engine.sort_by_value(&keys, &vals, true).unwrap();
        assert_eq!(vals.to_vec::<f32>().unwrap(), vec![30.0, 20.0, 10.0]);
        assert_eq!(keys.to_vec::<i32>().unwrap(), vec![3, 2, 1]);

        let short = engine.operand_from_slice(&[1.0f32, 2.0], &[2]).unwrap();
        assert!(engine.sort_by_key(&keys, &short, false).is_err());
        assert!(engine.sort_by_key(&keys, &keys, false).is_err());
    }

    #[test]
    fn test_sort_tad_by_key_rows() {
        let engine = Engine::default();
        let keys = engine
            .operand_from_slice(&[2.0f64, 1.0, 5.0, 4.0], &[2, 2])
            .unwrap();
        let vals = engine.operand_from_slice(&[0i64, 1, 2, 3], &[2, 2]).unwrap();
        engine.sort_tad_by_key(&keys, &vals, &[1], false).unwrap();
        assert_eq!(keys.to_vec::<f64>().unwrap(), vec![1.0, 2.0, 4.0, 5.0]);
        assert_eq!(vals.to_vec::<i64>().unwrap(), vec![1, 0, 3, 2]);

        engine.sort_tad_by_value(&keys, &vals, &[1], true).unwrap();
        assert_eq!(vals.to_vec::<i64>().unwrap(), vec![1, 0, 3, 2]);
        engine.sort_tad_by_value(&keys, &vals, &[1], false).unwrap();
        assert_eq!(vals.to_vec::<i64>().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(keys.to_vec::<f64>().unwrap(), vec![2.0, 1.0, 5.0, 4.0]);
    }

    #[test]
    fn test_shuffle_moves_rows_together() {
        let engine = Engine::default();
        let x = engine
            .operand_from_slice(&[0i64, 0, 1, 1, 2, 2, 3, 3], &[4, 2])
            .unwrap();
        let y = engine.operand_from_slice(&[0.0f32, 1.0, 2.0, 3.0], &[4, 1]).unwrap();
        let mut rng = RandomGenerator::new(7, 11);
        let map = engine.shuffle(&[&x, &y], &[1], &mut rng).unwrap();

        let mut sorted = map.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
        let xs = x.to_vec::<i64>().unwrap();
        let ys = y.to_vec::<f32>().unwrap();
        for (t, &from) in map.iter().enumerate() {
            assert_eq!(xs[2 * t], from as i64);
            assert_eq!(xs[2 * t + 1], from as i64);
            assert_eq!(ys[t], from as f32);
        }
    }

    #[test]
    fn test_shuffle_with_map_rejects_bad_maps() {
        let engine = Engine::default();
        let x = engine.operand_from_slice(&[1i32, 2, 3], &[3, 1]).unwrap();
        engine.shuffle_with_map(&[&x], &[1], &[2, 0, 1]).unwrap();
        assert_eq!(x.to_vec::<i32>().unwrap(), vec![3, 1, 2]);
        assert!(engine.shuffle_with_map(&[&x], &[1], &[0, 0, 1]).is_err());
        assert!(engine.shuffle_with_map(&[&x], &[1], &[1, 0]).is_err());
        assert_eq!(x.to_vec::<i32>().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_scatter_update_ops() {
        let engine = Engine::default();
        let x = engine.operand_from_slice(&[1i64, 1, 2, 2, 3, 3], &[3, 2]).unwrap();
        let u = engine.operand_from_slice(&[10i64, 20, 5, 5], &[2, 2]).unwrap();
        engine
            .scatter_update(BinaryOp::Add.code(), &x, &u, &[1], &[2, 2])
            .unwrap();
        assert_eq!(x.to_vec::<i64>().unwrap(), vec![1, 1, 2, 2, 18, 28]);

        let w = engine.operand_from_slice(&[WIDE, -WIDE], &[1, 2]).unwrap();
        engine
            .scatter_update(BinaryOp::Copy.code(), &x, &w, &[1], &[0])
            .unwrap();
        assert_eq!(x.to_vec::<i64>().unwrap()[..2], [WIDE, -WIDE]);

        let err = engine
            .scatter_update(BinaryOp::Add.code(), &x, &u, &[1], &[0, 3])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(engine.scatter_update(99, &x, &u, &[1], &[0, 1]).is_err());
    }

    #[test]
    fn test_reduce3_all_pairs() {
        let engine = Engine::default();
        let x = engine
            .operand_from_slice(&[0.0f32, 0.0, 3.0, 4.0], &[2, 2])
            .unwrap();
        let y = engine
            .operand_from_slice(&[0.0f32, 0.0, 6.0, 8.0, 3.0, 4.0], &[3, 2])
            .unwrap();
        let code = crate::exec::ops::Reduce3Op::EuclideanDistance.code();
        let z = engine.exec_reduce3_all(code, &x, &y, None, &[1]).unwrap();
        assert_eq!(z.dims(), &[2, 3]);
        assert_eq!(
            z.to_vec::<f32>().unwrap(),
            vec![0.0, 10.0, 5.0, 5.0, 5.0, 0.0]
        );

        let cols = engine.operand_from_slice(&[1.0f32, 2.0, 3.0], &[3, 1]).unwrap();
        assert!(engine.exec_reduce3_all(code, &x, &cols, None, &[1]).is_err());
    }

    #[test]
    fn test_inspect_array_counts() {
        let engine = Engine::default();
        let x = engine
            .operand_from_slice(&[-2.0f64, 0.0, 2.0, f64::NAN, f64::INFINITY], &[5])
            .unwrap();
        let info = engine.inspect_array(&x).unwrap();
        assert_eq!(info.length, 5);
        assert_eq!((info.zeros, info.positives, info.negatives), (1, 2, 1));
        assert_eq!((info.nans, info.infinities), (1, 1));
        assert_eq!(info.min, -2.0);
        assert_eq!(info.max, f64::INFINITY);

        let plain = engine.operand_from_slice(&[1i32, 3], &[2]).unwrap();
        let info = engine.inspect_array(&plain).unwrap();
        assert_eq!(info.mean, 2.0);
        assert_eq!(info.std_dev, 1.0);
        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json["positives"], 2);
    }
}
