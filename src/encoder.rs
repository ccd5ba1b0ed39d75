//! Compression orchestrator: chunk the volume, run per-chunk pipelines on
//! a worker pool, and assemble the container.
//!
//! Chunks are independent; workers write only to their own result slot,
//! so the emitted container is byte-identical for any worker count.

use log::debug;
use rayon::prelude::*;

use crate::chunks::{chunk_volume, gather_chunk, Dims};
use crate::conditioner::ConditionerSettings;
use crate::error::CodecError;
use crate::header::{ContainerHeader, HEADER_MAGIC};
use crate::pipeline::{ChunkCoder, ChunkConfig, ChunkRate};

/// Fluent compression front-end.
///
/// ```
/// use volpack::Encoder;
///
/// let volume = vec![1.0f64; 64];
/// let mut encoder = Encoder::new();
/// encoder.copy_data(&volume, [4, 4, 4], [4, 4, 4]).unwrap();
/// encoder.set_bpp(8.0).unwrap();
/// encoder.compress().unwrap();
/// let bytes = encoder.take_encoded_bitstream().unwrap();
/// assert!(!bytes.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct Encoder {
    dims: Dims,
    chunk_dims: Dims,
    num_threads: usize,
    bpp: Option<f64>,
    qz_level: Option<i32>,
    tolerance: Option<f64>,
    conditioning: ConditionerSettings,
    chunk_buffers: Vec<Vec<f64>>,
    encoded_streams: Vec<Vec<u8>>,
    outlier_stats: Vec<(usize, usize)>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            conditioning: ConditionerSettings::default(),
            ..Encoder::default()
        }
    }

    /// Worker count for `compress`. Zero is ignored; one worker gives the
    /// canonical sequential execution.
    pub fn set_threads(&mut self, n: usize) {
        if n > 0 {
            self.num_threads = n;
        }
    }

    /// Fixed-rate mode: target bits per point over the whole output,
    /// container header included. Requires `copy_data` first, since the
    /// header correction depends on the chunk count.
    pub fn set_bpp(&mut self, bpp: f64) -> Result<(), CodecError> {
        if !(0.0..=64.0).contains(&bpp) {
            return Err(CodecError::InvalidParam("bpp outside [0, 64]"));
        }
        if self.dims.iter().any(|&d| d == 0) || self.chunk_dims.iter().any(|&d| d == 0) {
            return Err(CodecError::SetBppBeforeDims);
        }
        let total_points = (self.dims[0] * self.dims[1] * self.dims[2]) as f64;
        let num_chunks = chunk_volume(self.dims, self.chunk_dims).len();
        let header_bits = ((HEADER_MAGIC + 4 * num_chunks) * 8) as f64;
        self.bpp = Some(((bpp * total_points - header_bits) / total_points).max(0.0));
        self.qz_level = None;
        Ok(())
    }

    /// Quantization-termination mode: code every chunk down to threshold
    /// `2^level`.
    pub fn set_qz_level(&mut self, level: i32) {
        self.qz_level = Some(level);
        self.bpp = None;
    }

    /// Tolerance above which a reconstruction error counts as an outlier
    /// (quantization-termination mode).
    pub fn set_tolerance(&mut self, tolerance: f64) -> Result<(), CodecError> {
        if !tolerance.is_finite() || tolerance <= 0.0 {
            return Err(CodecError::InvalidParam("tolerance must be positive"));
        }
        self.tolerance = Some(tolerance);
        Ok(())
    }

    pub fn toggle_conditioning(&mut self, settings: ConditionerSettings) {
        self.conditioning = settings;
    }

    /// Buffer a volume, chunked. The encoder owns its copy: coding
    /// consumes the chunk buffers. `chunk_dims` is clamped to
    /// `[1, dims]` per axis; 2D data passes `dims[2] = 1`.
    pub fn copy_data<T: Into<f64> + Copy + Sync>(
        &mut self,
        data: &[T],
        dims: Dims,
        chunk_dims: Dims,
    ) -> Result<(), CodecError> {
        if dims.iter().any(|&d| d == 0) {
            return Err(CodecError::InvalidParam("zero volume dimension"));
        }
        if data.len() != dims[0] * dims[1] * dims[2] {
            return Err(CodecError::WrongDims);
        }
        self.dims = dims;
        for i in 0..3 {
            self.chunk_dims[i] = chunk_dims[i].clamp(1, dims[i]);
        }
        let chunks = chunk_volume(self.dims, self.chunk_dims);
        self.chunk_buffers = chunks
            .par_iter()
            .map(|c| gather_chunk(data, dims, c))
            .collect();
        self.encoded_streams.clear();
        self.outlier_stats.clear();
        Ok(())
    }

    /// Compress every buffered chunk. The first non-OK chunk status
    /// aborts the whole call.
    pub fn compress(&mut self) -> Result<(), CodecError> {
        let chunks = chunk_volume(self.dims, self.chunk_dims);
        if chunks.is_empty() || self.chunk_buffers.len() != chunks.len() {
            return Err(CodecError::Invariant("no volume buffered"));
        }
        let rate = match (self.bpp, self.qz_level) {
            (Some(bpp), _) => ChunkRate::FixedRate(bpp),
            (None, Some(level)) => {
                let tolerance = self
                    .tolerance
                    .ok_or(CodecError::InvalidParam("tolerance not set"))?;
                ChunkRate::QzTerm { level, tolerance }
            }
            (None, None) => return Err(CodecError::InvalidParam("rate control not configured")),
        };
        let cfg = ChunkConfig {
            three_d: self.dims[2] > 1,
            conditioning: self.conditioning,
            rate,
        };
        debug!(
            "compressing {} chunk(s) of {:?} with {} worker(s)",
            chunks.len(),
            self.chunk_dims,
            if self.num_threads == 0 { rayon::current_num_threads() } else { self.num_threads }
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build()
            .map_err(|_| CodecError::Invariant("worker pool construction failed"))?;
        let results: Vec<Result<(Vec<u8>, (usize, usize)), CodecError>> = pool.install(|| {
            self.chunk_buffers
                .par_iter_mut()
                .zip(chunks.par_iter())
                .map_init(ChunkCoder::new, |coder, (buf, chunk)| {
                    coder.compress_chunk(std::mem::take(buf), chunk, &cfg)
                })
                .collect()
        });
        self.chunk_buffers.clear();

        let mut streams = Vec::with_capacity(results.len());
        let mut stats = Vec::with_capacity(results.len());
        for result in results {
            let (stream, stat) = result?;
            if stream.is_empty() {
                return Err(CodecError::EmptyStream);
            }
            streams.push(stream);
            stats.push(stat);
        }
        self.encoded_streams = streams;
        self.outlier_stats = stats;
        Ok(())
    }

    /// Assemble and hand over the container. Consumes the chunk streams.
    pub fn take_encoded_bitstream(&mut self) -> Result<Vec<u8>, CodecError> {
        if self.encoded_streams.is_empty() {
            return Err(CodecError::Invariant("compress() produced no streams yet"));
        }
        let streams = std::mem::take(&mut self.encoded_streams);
        let mut chunk_lens = Vec::with_capacity(streams.len());
        for s in &streams {
            chunk_lens
                .push(u32::try_from(s.len()).map_err(|_| {
                    CodecError::Invariant("chunk stream length exceeds u32")
                })?);
        }
        let header = ContainerHeader {
            entropy_post: false,
            three_d: self.dims[2] > 1,
            qz_term: self.qz_level.is_some(),
            dims: self.dims,
            chunk_dims: self.chunk_dims,
            chunk_lens,
        };
        let header_bytes = header.serialize()?;
        let total = header_bytes.len() + streams.iter().map(Vec::len).sum::<usize>();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&header_bytes);
        for s in streams {
            out.extend_from_slice(&s);
        }
        Ok(out)
    }

    /// Sum of per-chunk outlier statistics from the last
    /// quantization-terminated `compress`: `(count, patch bytes)`.
    pub fn get_outlier_stats(&self) -> (usize, usize) {
        self.outlier_stats
            .iter()
            .fold((0, 0), |acc, s| (acc.0 + s.0, acc.1 + s.1))
    }
}
