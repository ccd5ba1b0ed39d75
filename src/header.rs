//! Container header: a fixed 26-byte preamble plus one u32 length per
//! chunk, followed by the concatenated chunk streams in descriptor order.
//!
//! ```text
//! offset  size  field
//! 0       1     version major
//! 1       1     flags: bit0 entropy-post, bit1 3D, bit2 qz-term, rest 0
//! 2       4*3   volume dims (LE u32), Dz = 1 for 2D
//! 14      4*3   chunk dims (LE u32), Cz = 1 for 2D
//! 26      4*K   per-chunk encoded lengths in bytes (LE u32)
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::chunks::{chunk_volume, Dims};
use crate::error::CodecError;

/// Size of the fixed header part, before the per-chunk length table.
pub const HEADER_MAGIC: usize = 26;

/// Bumped only on incompatible layout changes.
pub const VERSION_MAJOR: u8 = 1;

const FLAG_ENTROPY_POST: u8 = 1;
const FLAG_3D: u8 = 1 << 1;
const FLAG_QZ_TERM: u8 = 1 << 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub entropy_post: bool,
    pub three_d: bool,
    pub qz_term: bool,
    pub dims: Dims,
    pub chunk_dims: Dims,
    pub chunk_lens: Vec<u32>,
}

impl ContainerHeader {
    pub fn size(&self) -> usize {
        HEADER_MAGIC + 4 * self.chunk_lens.len()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        let expected = chunk_volume(self.dims, self.chunk_dims).len();
        if expected != self.chunk_lens.len() {
            return Err(CodecError::Invariant("chunk count disagrees with dims"));
        }
        if !self.three_d && (self.dims[2] != 1 || self.chunk_dims[2] != 1) {
            return Err(CodecError::Invariant("2D container with Dz != 1"));
        }

        let mut out = Vec::with_capacity(self.size());
        out.push(VERSION_MAJOR);
        let mut flags = 0u8;
        if self.entropy_post {
            flags |= FLAG_ENTROPY_POST;
        }
        if self.three_d {
            flags |= FLAG_3D;
        }
        if self.qz_term {
            flags |= FLAG_QZ_TERM;
        }
        out.push(flags);
        for &d in self.dims.iter().chain(self.chunk_dims.iter()) {
            let d = u32::try_from(d).map_err(|_| CodecError::Invariant("dimension exceeds u32"))?;
            out.extend_from_slice(&d.to_le_bytes());
        }
        for &len in &self.chunk_lens {
            out.extend_from_slice(&len.to_le_bytes());
        }
        Ok(out)
    }

    /// Parse the header from the front of a received buffer. The chunk
    /// count is re-derived from the dimensions, never trusted from the
    /// buffer length.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_MAGIC {
            return Err(CodecError::BitstreamTruncated);
        }
        if bytes[0] != VERSION_MAJOR {
            return Err(CodecError::BitstreamCorrupt("version mismatch"));
        }
        let flags = bytes[1];
        if flags & !(FLAG_ENTROPY_POST | FLAG_3D | FLAG_QZ_TERM) != 0 {
            return Err(CodecError::BitstreamCorrupt("reserved flag bits set"));
        }

        let mut cur = Cursor::new(&bytes[2..HEADER_MAGIC]);
        let mut fields = [0usize; 6];
        for f in fields.iter_mut() {
            *f = cur.read_u32::<LittleEndian>()? as usize;
        }
        let dims = [fields[0], fields[1], fields[2]];
        let chunk_dims = [fields[3], fields[4], fields[5]];
        if dims.iter().any(|&d| d == 0) || chunk_dims.iter().any(|&d| d == 0) {
            return Err(CodecError::BitstreamCorrupt("zero dimension"));
        }
        let three_d = flags & FLAG_3D != 0;
        if !three_d && (dims[2] != 1 || chunk_dims[2] != 1) {
            return Err(CodecError::BitstreamCorrupt("2D stream with Dz != 1"));
        }

        let num_chunks = chunk_volume(dims, chunk_dims).len();
        if bytes.len() < HEADER_MAGIC + 4 * num_chunks {
            return Err(CodecError::BitstreamTruncated);
        }
        let mut cur = Cursor::new(&bytes[HEADER_MAGIC..HEADER_MAGIC + 4 * num_chunks]);
        let mut chunk_lens = Vec::with_capacity(num_chunks);
        for _ in 0..num_chunks {
            chunk_lens.push(cur.read_u32::<LittleEndian>()?);
        }

        Ok(ContainerHeader {
            entropy_post: flags & FLAG_ENTROPY_POST != 0,
            three_d,
            qz_term: flags & FLAG_QZ_TERM != 0,
            dims,
            chunk_dims,
            chunk_lens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContainerHeader {
        ContainerHeader {
            entropy_post: false,
            three_d: true,
            qz_term: true,
            dims: [10, 10, 10],
            chunk_dims: [4, 4, 4],
            chunk_lens: (0..27).map(|i| 100 + i).collect(),
        }
    }

    #[test]
    fn roundtrip() {
        let header = sample();
        let bytes = header.serialize().unwrap();
        assert_eq!(bytes.len(), HEADER_MAGIC + 4 * 27);
        assert_eq!(ContainerHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn truncation_is_detected() {
        let bytes = sample().serialize().unwrap();
        assert_eq!(
            ContainerHeader::parse(&bytes[..HEADER_MAGIC - 1]),
            Err(CodecError::BitstreamTruncated)
        );
        assert_eq!(
            ContainerHeader::parse(&bytes[..HEADER_MAGIC + 3]),
            Err(CodecError::BitstreamTruncated)
        );
    }

    #[test]
    fn version_and_reserved_bits_are_checked() {
        let mut bytes = sample().serialize().unwrap();
        bytes[0] = VERSION_MAJOR + 1;
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(CodecError::BitstreamCorrupt(_))
        ));
        let mut bytes = sample().serialize().unwrap();
        bytes[1] |= 1 << 6;
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(CodecError::BitstreamCorrupt(_))
        ));
    }

    #[test]
    fn two_d_requires_unit_z() {
        let mut header = sample();
        header.three_d = false;
        assert!(header.serialize().is_err());

        header.dims = [8, 8, 1];
        header.chunk_dims = [4, 4, 1];
        header.chunk_lens = vec![1, 2, 3, 4];
        let bytes = header.serialize().unwrap();
        let parsed = ContainerHeader::parse(&bytes).unwrap();
        assert!(!parsed.three_d);
        assert_eq!(parsed.chunk_lens, vec![1, 2, 3, 4]);
    }
}
