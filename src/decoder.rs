//! Decompression orchestrator: parse the container, decode chunks on a
//! worker pool, and stitch the volume back together single-threaded.

use log::debug;
use rayon::prelude::*;

use crate::chunks::{chunk_volume, scatter_chunk, Dims};
use crate::error::CodecError;
use crate::header::ContainerHeader;
use crate::pipeline::ChunkCoder;

#[derive(Debug, Default)]
pub struct Decoder {
    header: Option<ContainerHeader>,
    chunk_streams: Vec<Vec<u8>>,
    num_threads: usize,
    volume: Vec<f64>,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder::default()
    }

    pub fn set_threads(&mut self, n: usize) {
        if n > 0 {
            self.num_threads = n;
        }
    }

    /// Parse a container and slice out the per-chunk streams. Random
    /// access works by summing the recorded lengths, so each chunk can be
    /// handed to a worker independently.
    pub fn use_bitstream(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let header = ContainerHeader::parse(bytes)?;
        if header.entropy_post {
            return Err(CodecError::BitstreamCorrupt(
                "stream requires the external entropy post-compression stage",
            ));
        }
        let mut offset = header.size();
        let mut streams = Vec::with_capacity(header.chunk_lens.len());
        for &len in &header.chunk_lens {
            let end = offset
                .checked_add(len as usize)
                .filter(|&end| end <= bytes.len())
                .ok_or(CodecError::BitstreamCorrupt("chunk lengths exceed the buffer"))?;
            streams.push(bytes[offset..end].to_vec());
            offset = end;
        }
        debug!(
            "container: dims {:?}, chunk dims {:?}, {} chunk(s)",
            header.dims,
            header.chunk_dims,
            streams.len()
        );
        self.header = Some(header);
        self.chunk_streams = streams;
        self.volume.clear();
        Ok(())
    }

    pub fn decompress(&mut self) -> Result<(), CodecError> {
        let header = self
            .header
            .as_ref()
            .ok_or(CodecError::Invariant("use_bitstream was not called"))?;
        let chunks = chunk_volume(header.dims, header.chunk_dims);
        if self.chunk_streams.len() != chunks.len() {
            return Err(CodecError::Invariant("chunk streams already consumed"));
        }
        let three_d = header.three_d;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build()
            .map_err(|_| CodecError::Invariant("worker pool construction failed"))?;
        let results: Vec<Result<Vec<f64>, CodecError>> = pool.install(|| {
            self.chunk_streams
                .par_iter()
                .zip(chunks.par_iter())
                .map_init(ChunkCoder::new, |coder, (stream, chunk)| {
                    coder.decompress_chunk(stream, chunk, three_d)
                })
                .collect()
        });

        let mut volume = vec![0.0; header.dims[0] * header.dims[1] * header.dims[2]];
        for (result, chunk) in results.into_iter().zip(&chunks) {
            scatter_chunk(&mut volume, header.dims, chunk, &result?);
        }
        self.volume = volume;
        self.chunk_streams.clear();
        Ok(())
    }

    /// Hand over the reconstructed volume, x-fastest.
    pub fn release_data(&mut self) -> Vec<f64> {
        std::mem::take(&mut self.volume)
    }

    pub fn get_dims(&self) -> Dims {
        self.header.as_ref().map_or([0; 3], |h| h.dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Encoder;

    fn sample_container() -> Vec<u8> {
        let volume: Vec<f64> = (0..512).map(|i| (i % 37) as f64).collect();
        let mut encoder = Encoder::new();
        encoder.copy_data(&volume, [8, 8, 8], [5, 5, 5]).unwrap();
        encoder.set_bpp(8.0).unwrap();
        encoder.compress().unwrap();
        encoder.take_encoded_bitstream().unwrap()
    }

    #[test]
    fn decompress_requires_a_bitstream() {
        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.decompress(),
            Err(CodecError::Invariant(_))
        ));
        assert_eq!(decoder.get_dims(), [0, 0, 0]);
    }

    #[test]
    fn truncated_body_is_rejected() {
        let bytes = sample_container();
        let mut decoder = Decoder::new();
        assert_eq!(
            decoder.use_bitstream(&bytes[..bytes.len() - 1]),
            Err(CodecError::BitstreamCorrupt("chunk lengths exceed the buffer"))
        );
    }

    #[test]
    fn entropy_post_flag_is_refused() {
        let mut bytes = sample_container();
        bytes[1] |= 1; // entropy-post flag
        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.use_bitstream(&bytes),
            Err(CodecError::BitstreamCorrupt(_))
        ));
    }

    #[test]
    fn decode_is_invariant_under_worker_count() {
        let bytes = sample_container();
        let mut outputs = Vec::new();
        for threads in [1, 3] {
            let mut decoder = Decoder::new();
            decoder.set_threads(threads);
            decoder.use_bitstream(&bytes).unwrap();
            decoder.decompress().unwrap();
            outputs.push(decoder.release_data());
        }
        assert_eq!(outputs[0], outputs[1]);
    }
}
