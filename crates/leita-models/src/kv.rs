//! Double-buffered past key/value state carried across decoding steps.

use anyhow::{Result, bail};
use ndarray::{Array3, ArrayView3, s};
use rayon::prelude::*;

/// One layer's fresh key/value tensors for the tokens of a single step,
/// shape `(batch_beam_size, step_length, hidden_size)`.
pub struct LayerKv {
    pub k: Array3<f32>,
    pub v: Array3<f32>,
}

/// Pre-allocated per-layer KV history for every beam row.
///
/// Past and present are disjoint: each step's presents are appended, and
/// after a beam step the rows are re-permuted into the temp buffers so each
/// beam's KV follows its selected parent.
pub struct BeamKvState {
    layers_k: Vec<Array3<f32>>,
    layers_v: Vec<Array3<f32>>,
    temp_layers_k: Vec<Array3<f32>>,
    temp_layers_v: Vec<Array3<f32>>,
    seq_length: usize,
    capacity: usize,
}

impl BeamKvState {
    pub fn new(
        num_layers: usize,
        batch_beam_size: usize,
        capacity: usize,
        hidden_size: usize,
    ) -> Self {
        let mut layers_k = Vec::with_capacity(num_layers);
        let mut layers_v = Vec::with_capacity(num_layers);
        let mut temp_layers_k = Vec::with_capacity(num_layers);
        let mut temp_layers_v = Vec::with_capacity(num_layers);

        for _ in 0..num_layers {
            layers_k.push(Array3::zeros((batch_beam_size, capacity, hidden_size)));
            layers_v.push(Array3::zeros((batch_beam_size, capacity, hidden_size)));
            temp_layers_k.push(Array3::zeros((batch_beam_size, capacity, hidden_size)));
            temp_layers_v.push(Array3::zeros((batch_beam_size, capacity, hidden_size)));
        }

        Self {
            layers_k,
            layers_v,
            temp_layers_k,
            temp_layers_v,
            seq_length: 0,
            capacity,
        }
    }

    pub fn seq_length(&self) -> usize {
        self.seq_length
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_layers(&self) -> usize {
        self.layers_k.len()
    }

    pub fn batch_beam_size(&self) -> usize {
        self.layers_k.first().map(|k| k.shape()[0]).unwrap_or(0)
    }

    /// Valid prefix of one layer's cached keys and values.
    pub fn past(&self, layer_idx: usize) -> Option<(ArrayView3<'_, f32>, ArrayView3<'_, f32>)> {
        if layer_idx >= self.layers_k.len() {
            return None;
        }
        let active = s![.., 0..self.seq_length, ..];
        Some((
            self.layers_k[layer_idx].slice(active),
            self.layers_v[layer_idx].slice(active),
        ))
    }

    /// Appends one step's presents for every layer and advances the length.
    pub fn append(&mut self, presents: &[LayerKv]) -> Result<()> {
        if presents.len() != self.layers_k.len() {
            bail!(
                "present count {} does not match layer count {}",
                presents.len(),
                self.layers_k.len()
            );
        }
        let step_len = presents
            .first()
            .map(|p| p.k.shape()[1])
            .unwrap_or_default();
        let end = self.seq_length + step_len;
        if end > self.capacity {
            bail!(
                "kv overflow: seq_length={}, new_tokens={}, capacity={}",
                self.seq_length,
                step_len,
                self.capacity
            );
        }

        let target = s![.., self.seq_length..end, ..];
        for (layer_idx, present) in presents.iter().enumerate() {
            self.layers_k[layer_idx]
                .slice_mut(target)
                .assign(&present.k);
            self.layers_v[layer_idx]
                .slice_mut(target)
                .assign(&present.v);
        }
        self.seq_length = end;
        Ok(())
    }

    /// Re-permutes beam rows so each beam's KV follows its selected parent.
    pub fn reorder(&mut self, indices: &[u32]) {
        assert!(self.seq_length > 0, "cannot reorder an empty kv state");
        assert_eq!(
            indices.len(),
            self.batch_beam_size(),
            "one parent index per beam row required"
        );

        let valid = self.seq_length;
        self.layers_k
            .par_iter()
            .zip(self.layers_v.par_iter())
            .zip(self.temp_layers_k.par_iter_mut())
            .zip(self.temp_layers_v.par_iter_mut())
            .for_each(|(((source_k, source_v), dest_k), dest_v)| {
                for (dest_idx, &source_idx) in indices.iter().enumerate() {
                    let source_idx = source_idx as usize;
                    dest_k
                        .slice_mut(s![dest_idx, ..valid, ..])
                        .assign(&source_k.slice(s![source_idx, ..valid, ..]));
                    dest_v
                        .slice_mut(s![dest_idx, ..valid, ..])
                        .assign(&source_v.slice(s![source_idx, ..valid, ..]));
                }
            });

        std::mem::swap(&mut self.layers_k, &mut self.temp_layers_k);
        std::mem::swap(&mut self.layers_v, &mut self.temp_layers_v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presents(layers: usize, rows: usize, step: usize, hidden: usize, fill: f32) -> Vec<LayerKv> {
        (0..layers)
            .map(|_| LayerKv {
                k: Array3::from_elem((rows, step, hidden), fill),
                v: Array3::from_elem((rows, step, hidden), fill * 10.0),
            })
            .collect()
    }

    #[test]
    fn test_append_and_past_views() {
        let mut kv = BeamKvState::new(2, 4, 16, 8);
        kv.append(&presents(2, 4, 3, 8, 1.0)).unwrap();
        assert_eq!(kv.seq_length(), 3);

        kv.append(&presents(2, 4, 1, 8, 2.0)).unwrap();
        assert_eq!(kv.seq_length(), 4);

        let (k, v) = kv.past(0).unwrap();
        assert_eq!(k.shape(), &[4, 4, 8]);
        assert_eq!(k[[0, 2, 0]], 1.0);
        assert_eq!(k[[0, 3, 0]], 2.0);
        assert_eq!(v[[0, 3, 0]], 20.0);
    }

    #[test]
    fn test_reorder_follows_parent_indices() {
        let mut kv = BeamKvState::new(1, 4, 8, 2);
        let mut step = presents(1, 4, 1, 2, 0.0);
        for row in 0..4 {
            step[0].k[[row, 0, 0]] = row as f32;
            step[0].v[[row, 0, 0]] = (row * 10) as f32;
        }
        kv.append(&step).unwrap();

        kv.reorder(&[2, 2, 0, 1]);
        let (k, _) = kv.past(0).unwrap();
        assert_eq!(k[[0, 0, 0]], 2.0);
        assert_eq!(k[[1, 0, 0]], 2.0);
        assert_eq!(k[[2, 0, 0]], 0.0);
        assert_eq!(k[[3, 0, 0]], 1.0);
    }

    #[test]
    fn test_reorder_swaps_buffers() {
        let mut kv = BeamKvState::new(1, 2, 8, 2);
        kv.append(&presents(1, 2, 1, 2, 1.0)).unwrap();
        let before = kv.layers_k[0].as_ptr();
        kv.reorder(&[1, 0]);
        assert_ne!(before, kv.layers_k[0].as_ptr());
    }

    #[test]
    fn test_overflow_reported() {
        let mut kv = BeamKvState::new(1, 2, 2, 2);
        kv.append(&presents(1, 2, 2, 2, 1.0)).unwrap();
        assert!(kv.append(&presents(1, 2, 1, 2, 1.0)).is_err());
    }

    #[test]
    #[should_panic(expected = "cannot reorder an empty kv state")]
    fn test_reorder_empty_panics() {
        let mut kv = BeamKvState::new(1, 2, 8, 2);
        kv.reorder(&[1, 0]);
    }
}
