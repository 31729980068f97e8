use crate::error::{EngineError, Result};

/// Key-value cache for one session.
///
/// Per layer, keys and values are flat `[seq_len, kv_dim]` arrays. The QKV
/// matmuls write straight into the current position's rows, so the mutable
/// row accessors are the write path and the shared ones serve attention.
pub struct KvCache {
    k: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
    kv_dim: usize,
}

impl KvCache {
    /// Allocate a zeroed cache. This is the session's dominant allocation,
    /// so failure reports as resource exhaustion instead of aborting.
    pub fn new(n_layers: usize, kv_dim: usize, seq_len: usize) -> Result<KvCache> {
        let layer_size = seq_len * kv_dim;
        let alloc_layer = || -> Result<Vec<f32>> {
            let mut layer = Vec::new();
            layer.try_reserve_exact(layer_size).map_err(|_| {
                EngineError::SessionAlloc(format!("kv cache layer of {} floats", layer_size))
            })?;
            layer.resize(layer_size, 0.0);
            Ok(layer)
        };

        let mut k = Vec::with_capacity(n_layers);
        let mut v = Vec::with_capacity(n_layers);
        for _ in 0..n_layers {
            k.push(alloc_layer()?);
            v.push(alloc_layer()?);
        }

        Ok(KvCache { k, v, kv_dim })
    }

    pub fn key_row(&self, layer: usize, pos: usize) -> &[f32] {
        &self.k[layer][pos * self.kv_dim..(pos + 1) * self.kv_dim]
    }

    pub fn value_row(&self, layer: usize, pos: usize) -> &[f32] {
        &self.v[layer][pos * self.kv_dim..(pos + 1) * self.kv_dim]
    }

    pub fn key_row_mut(&mut self, layer: usize, pos: usize) -> &mut [f32] {
        &mut self.k[layer][pos * self.kv_dim..(pos + 1) * self.kv_dim]
    }

    pub fn value_row_mut(&mut self, layer: usize, pos: usize) -> &mut [f32] {
        &mut self.v[layer][pos * self.kv_dim..(pos + 1) * self.kv_dim]
    }

    /// Both of one position's rows at once, for the QKV dispatch burst that
    /// writes keys and values under a single barrier.
    pub fn rows_mut(&mut self, layer: usize, pos: usize) -> (&mut [f32], &mut [f32]) {
        let range = pos * self.kv_dim..(pos + 1) * self.kv_dim;
        (
            &mut self.k[layer][range.clone()],
            &mut self.v[layer][range],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_disjoint_per_position() {
        let mut cache = KvCache::new(2, 4, 8).unwrap();
        cache.key_row_mut(0, 0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        cache.key_row_mut(0, 1).copy_from_slice(&[5.0, 6.0, 7.0, 8.0]);
        cache.value_row_mut(1, 0).copy_from_slice(&[9.0, 9.0, 9.0, 9.0]);

        assert_eq!(cache.key_row(0, 0), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cache.key_row(0, 1), &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(cache.key_row(1, 0), &[0.0; 4]);
        assert_eq!(cache.value_row(1, 0), &[9.0; 4]);
    }
}
