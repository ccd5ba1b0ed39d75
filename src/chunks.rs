//! Volume chunking: tile a volume into independent rectangular chunks and
//! move data between the full volume and contiguous per-chunk buffers.

use ndarray::{s, ArrayView3, ArrayViewMut3};

/// Volume or chunk dimensions as `[x, y, z]`; 2D data carries `z = 1`.
pub type Dims = [usize; 3];

/// One rectangular subvolume, in volume coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub x0: usize,
    pub lx: usize,
    pub y0: usize,
    pub ly: usize,
    pub z0: usize,
    pub lz: usize,
}

impl Chunk {
    pub fn num_points(&self) -> usize {
        self.lx * self.ly * self.lz
    }

    pub fn dims(&self) -> Dims {
        [self.lx, self.ly, self.lz]
    }
}

/// Tile `dims` with chunks of (clamped) `preferred` size, x-fastest, the
/// last chunk in each dimension possibly shorter.
pub fn chunk_volume(dims: Dims, preferred: Dims) -> Vec<Chunk> {
    let mut clamped = [0usize; 3];
    for i in 0..3 {
        clamped[i] = preferred[i].clamp(1, dims[i].max(1));
    }

    let count = |dim: usize, step: usize| dim.div_ceil(step);
    let num = count(dims[0], clamped[0]) * count(dims[1], clamped[1]) * count(dims[2], clamped[2]);
    let mut chunks = Vec::with_capacity(num);
    for z0 in (0..dims[2]).step_by(clamped[2]) {
        for y0 in (0..dims[1]).step_by(clamped[1]) {
            for x0 in (0..dims[0]).step_by(clamped[0]) {
                chunks.push(Chunk {
                    x0,
                    lx: clamped[0].min(dims[0] - x0),
                    y0,
                    ly: clamped[1].min(dims[1] - y0),
                    z0,
                    lz: clamped[2].min(dims[2] - z0),
                });
            }
        }
    }
    chunks
}

/// Copy one chunk out of an x-fastest volume into a contiguous f64 buffer.
pub fn gather_chunk<T: Into<f64> + Copy>(vol: &[T], dims: Dims, chunk: &Chunk) -> Vec<f64> {
    let view = ArrayView3::from_shape((dims[2], dims[1], dims[0]), vol)
        .expect("volume length was validated against dims");
    view.slice(s![
        chunk.z0..chunk.z0 + chunk.lz,
        chunk.y0..chunk.y0 + chunk.ly,
        chunk.x0..chunk.x0 + chunk.lx
    ])
    .iter()
    .map(|&v| v.into())
    .collect()
}

/// Write one decoded chunk buffer back into its place in the volume.
pub fn scatter_chunk(vol: &mut [f64], dims: Dims, chunk: &Chunk, data: &[f64]) {
    let mut view = ArrayViewMut3::from_shape((dims[2], dims[1], dims[0]), vol)
        .expect("volume length was validated against dims");
    let block = ArrayView3::from_shape((chunk.lz, chunk.ly, chunk.lx), data)
        .expect("chunk buffer length matches its descriptor");
    view.slice_mut(s![
        chunk.z0..chunk.z0 + chunk.lz,
        chunk.y0..chunk.y0 + chunk.ly,
        chunk.x0..chunk.x0 + chunk.lx
    ])
    .assign(&block);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_chunks_shrink() {
        let chunks = chunk_volume([10, 10, 10], [4, 4, 4]);
        assert_eq!(chunks.len(), 27);
        // x-fastest ordering
        assert_eq!(chunks[0], Chunk { x0: 0, lx: 4, y0: 0, ly: 4, z0: 0, lz: 4 });
        assert_eq!(chunks[1].x0, 4);
        assert_eq!(chunks[2], Chunk { x0: 8, lx: 2, y0: 0, ly: 4, z0: 0, lz: 4 });
        let last = chunks[26];
        assert_eq!((last.lx, last.ly, last.lz), (2, 2, 2));
        let total: usize = chunks.iter().map(Chunk::num_points).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn preferred_dims_are_clamped() {
        let chunks = chunk_volume([5, 3, 1], [0, 64, 64]);
        // 0 clamps to 1, oversize clamps to the volume.
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.lx == 1 && c.ly == 3 && c.lz == 1));
    }

    #[test]
    fn gather_scatter_roundtrip() {
        let dims = [4, 3, 2];
        let vol: Vec<f64> = (0..24).map(|i| i as f64).collect();
        let mut rebuilt = vec![0.0; 24];
        for chunk in chunk_volume(dims, [3, 2, 2]) {
            let buf = gather_chunk(&vol, dims, &chunk);
            assert_eq!(buf.len(), chunk.num_points());
            scatter_chunk(&mut rebuilt, dims, &chunk, &buf);
        }
        assert_eq!(rebuilt, vol);
    }

    #[test]
    fn gather_is_x_fastest_within_chunk() {
        let dims = [4, 2, 1];
        let vol: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let chunk = Chunk { x0: 1, lx: 2, y0: 0, ly: 2, z0: 0, lz: 1 };
        let buf = gather_chunk(&vol, dims, &chunk);
        assert_eq!(buf, vec![1.0, 2.0, 5.0, 6.0]);
    }
}
