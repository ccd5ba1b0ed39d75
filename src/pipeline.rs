//! Per-chunk pipeline: condition → transform → SPECK on the way in, the
//! mirror image on the way out. One [`ChunkCoder`] lives per worker and
//! is reused across chunks to amortize list capacity.

use crate::chunks::Chunk;
use crate::conditioner::{self, ConditionerSettings};
use crate::error::CodecError;
use crate::speck2d::Speck2d;
use crate::speck3d::Speck3d;
use crate::wavelets;
use crate::RateMode;

/// Nominal size of one outlier patch record (u32 index + f32 correction)
/// for the external correction pass.
const OUTLIER_RECORD_BYTES: usize = 8;

#[derive(Debug, Clone, Copy)]
pub(crate) enum ChunkRate {
    /// Header-corrected bits per point.
    FixedRate(f64),
    QzTerm { level: i32, tolerance: f64 },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkConfig {
    pub three_d: bool,
    pub conditioning: ConditionerSettings,
    pub rate: ChunkRate,
}

#[derive(Debug, Default)]
pub(crate) struct ChunkCoder {
    coder2d: Speck2d,
    coder3d: Speck3d,
}

impl ChunkCoder {
    pub fn new() -> Self {
        ChunkCoder::default()
    }

    /// Compress one gathered chunk buffer. Returns the chunk stream and,
    /// in quantization-termination mode, the outlier statistics
    /// `(count, patch bytes)` against the original values.
    pub fn compress_chunk(
        &mut self,
        mut data: Vec<f64>,
        chunk: &Chunk,
        cfg: &ChunkConfig,
    ) -> Result<(Vec<u8>, (usize, usize)), CodecError> {
        let orig = match cfg.rate {
            ChunkRate::QzTerm { .. } => Some(data.clone()),
            ChunkRate::FixedRate(_) => None,
        };

        let cond_header = conditioner::condition(&mut data, cfg.conditioning);
        let dims3 = (chunk.lx, chunk.ly, chunk.lz);
        let mode = match cfg.rate {
            ChunkRate::FixedRate(bpp) => {
                let bits = (bpp * chunk.num_points() as f64).floor().max(0.0) as usize;
                RateMode::BitBudget(bits)
            }
            ChunkRate::QzTerm { level, .. } => RateMode::QzLevel(level),
        };

        let payload = if cfg.three_d {
            wavelets::fwd_txfm_3d(&mut data, dims3);
            self.coder3d.encode(data, dims3, mode)?
        } else {
            wavelets::fwd_txfm_2d(&mut data, (chunk.lx, chunk.ly));
            self.coder2d.encode(data, (chunk.lx, chunk.ly), mode)?
        };

        let mut stream = Vec::with_capacity(cond_header.len() + payload.len());
        stream.extend_from_slice(&cond_header);
        stream.extend_from_slice(&payload);

        let stats = match (cfg.rate, orig) {
            (ChunkRate::QzTerm { tolerance, .. }, Some(orig)) => {
                let rec = self.decompress_chunk(&stream, chunk, cfg.three_d)?;
                let count = orig
                    .iter()
                    .zip(&rec)
                    .filter(|(a, b)| (**a - **b).abs() > tolerance)
                    .count();
                (count, count * OUTLIER_RECORD_BYTES)
            }
            _ => (0, 0),
        };
        Ok((stream, stats))
    }

    /// Decode one chunk stream back into its values.
    pub fn decompress_chunk(
        &mut self,
        stream: &[u8],
        chunk: &Chunk,
        three_d: bool,
    ) -> Result<Vec<f64>, CodecError> {
        if stream.len() < conditioner::HEADER_LEN {
            return Err(CodecError::BitstreamTruncated);
        }
        let (cond_header, payload) = stream.split_at(conditioner::HEADER_LEN);
        let dims3 = (chunk.lx, chunk.ly, chunk.lz);
        let mut data = if three_d {
            let mut data = self.coder3d.decode(payload, dims3)?;
            wavelets::inv_txfm_3d(&mut data, dims3);
            data
        } else {
            let mut data = self.coder2d.decode(payload, (chunk.lx, chunk.ly))?;
            wavelets::inv_txfm_2d(&mut data, (chunk.lx, chunk.ly));
            data
        };
        conditioner::restore(&mut data, cond_header)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn chunk(lx: usize, ly: usize, lz: usize) -> Chunk {
        Chunk { x0: 0, lx, y0: 0, ly, z0: 0, lz }
    }

    #[test]
    fn chunk_roundtrip_2d_high_rate() {
        let mut rng = StdRng::seed_from_u64(41);
        let c = chunk(16, 16, 1);
        let data: Vec<f64> = (0..256).map(|_| rng.random_range(-10.0..10.0)).collect();
        let cfg = ChunkConfig {
            three_d: false,
            conditioning: ConditionerSettings::default(),
            rate: ChunkRate::FixedRate(32.0),
        };
        let mut coder = ChunkCoder::new();
        let (stream, stats) = coder.compress_chunk(data.clone(), &c, &cfg).unwrap();
        assert_eq!(stats, (0, 0));
        let rec = coder.decompress_chunk(&stream, &c, false).unwrap();
        let err = data
            .iter()
            .zip(&rec)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        // fixed-rate coding floors at the unit threshold
        assert!(err < 2.0, "max error {err}");
    }

    #[test]
    fn qz_mode_counts_outliers_against_tolerance() {
        let mut rng = StdRng::seed_from_u64(42);
        let c = chunk(8, 8, 8);
        let data: Vec<f64> = (0..512).map(|_| rng.random_range(-100.0..100.0)).collect();
        let loose = ChunkConfig {
            three_d: true,
            conditioning: ConditionerSettings::default(),
            rate: ChunkRate::QzTerm { level: 4, tolerance: 1e-3 },
        };
        let mut coder = ChunkCoder::new();
        let (_, (count, bytes)) = coder.compress_chunk(data.clone(), &c, &loose).unwrap();
        assert!(count > 0, "a coarse quantization must leave outliers");
        assert_eq!(bytes, count * 8);

        let tight = ChunkConfig {
            rate: ChunkRate::QzTerm { level: -20, tolerance: 1e-3 },
            ..loose
        };
        let (_, (count, _)) = coder.compress_chunk(data, &c, &tight).unwrap();
        assert_eq!(count, 0, "deep quantization leaves nothing above 1e-3");
    }
}
