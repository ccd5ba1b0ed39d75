//! 2D SPECK coder: a set-partitioning bit-plane state machine over the
//! wavelet coefficients of one chunk.
//!
//! Encode and decode drive the same machine; the only difference is
//! whether a significance/sign/refinement decision is scanned from the
//! coefficients and emitted, or read back from the bit sequence. Budget
//! exhaustion on either side halts the coding loop cleanly at the exact
//! same decision point.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::bits::BitBuffer;
use crate::error::{BudgetHit, CodecError};
use crate::sets::{
    calc_set_size_2d, num_part_levels_2d, num_xform_levels, partition_i_2d, partition_s_2d,
    Significance, SpeckSet2d,
};
use crate::RateMode;

/// Self-describing per-chunk coder header: dims, max bits, termination.
const CODER_HEADER_LEN: usize = 12;

/// Initial capacity of each LIS level; also the absolute floor of the
/// garbage compaction trigger.
const VEC_INIT_CAP: usize = 8;

/// Exponents beyond the f64 range mark a corrupt header.
const MAX_EXPONENT: i32 = 1100;

#[derive(Debug, Default)]
pub struct Speck2d {
    dim_x: usize,
    dim_y: usize,
    // magnitudes during coding; mutated by every emitted pixel bit
    coeffs: Vec<f64>,
    // true = negative
    signs: Vec<bool>,
    lis: Vec<Vec<SpeckSet2d>>,
    lis_garbage: Vec<usize>,
    lsp: Vec<SpeckSet2d>,
    i_set: SpeckSet2d,
    threshold: f64,
    max_bits: i32,
    term_level: i32,
    bits: BitBuffer,
    bit_idx: usize,
    encoding: bool,
}

impl Speck2d {
    pub fn new() -> Self {
        Speck2d::default()
    }

    /// Exponent of the starting threshold of the last `encode`/`decode`.
    pub fn max_coefficient_bits(&self) -> i32 {
        self.max_bits
    }

    /// Encode one coefficient plane. The coder takes ownership of the
    /// buffer because coding consumes the magnitudes.
    pub fn encode(
        &mut self,
        mut coeffs: Vec<f64>,
        dims: (usize, usize),
        mode: RateMode,
    ) -> Result<Vec<u8>, CodecError> {
        if dims.0 == 0 || dims.1 == 0 {
            return Err(CodecError::InvalidParam("zero plane dimension"));
        }
        if coeffs.len() != dims.0 * dims.1 {
            return Err(CodecError::WrongDims);
        }

        self.dim_x = dims.0;
        self.dim_y = dims.1;
        self.encoding = true;
        self.signs.clear();
        self.signs.reserve(coeffs.len());
        let mut max = 0.0f64;
        for c in coeffs.iter_mut() {
            self.signs.push(*c < 0.0);
            *c = c.abs();
            max = max.max(*c);
        }
        self.coeffs = coeffs;
        self.max_bits = if max > 0.0 { max.log2().floor() as i32 } else { 0 };

        let budget = match mode {
            RateMode::BitBudget(bits) => {
                self.term_level = self.max_bits.min(0);
                bits
            }
            RateMode::QzLevel(q) => {
                if q.abs() > MAX_EXPONENT {
                    return Err(CodecError::InvalidParam("quantization level out of range"));
                }
                self.term_level = q;
                usize::MAX
            }
        };
        self.bits = BitBuffer::with_budget(budget);
        self.bit_idx = 0;

        self.init_lists();
        self.coding_loop();

        let payload = std::mem::take(&mut self.bits).serialize();
        let mut out = Vec::with_capacity(CODER_HEADER_LEN + payload.len());
        out.extend_from_slice(&(self.dim_x as u32).to_le_bytes());
        out.extend_from_slice(&(self.dim_y as u32).to_le_bytes());
        out.extend_from_slice(&(self.max_bits as i16).to_le_bytes());
        out.extend_from_slice(&(self.term_level as i16).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a stream produced by [`encode`](Self::encode) back into
    /// signed coefficients. Bit planes beyond the received payload stay
    /// zero.
    pub fn decode(&mut self, stream: &[u8], dims: (usize, usize)) -> Result<Vec<f64>, CodecError> {
        if stream.len() < CODER_HEADER_LEN {
            return Err(CodecError::BitstreamTruncated);
        }
        let mut cur = Cursor::new(stream);
        let dim_x = cur.read_u32::<LittleEndian>()? as usize;
        let dim_y = cur.read_u32::<LittleEndian>()? as usize;
        let max_bits = cur.read_i16::<LittleEndian>()? as i32;
        let term_level = cur.read_i16::<LittleEndian>()? as i32;
        if (dim_x, dim_y) != dims {
            return Err(CodecError::BitstreamCorrupt("chunk dims disagree with header"));
        }
        if max_bits.abs() > MAX_EXPONENT || term_level.abs() > MAX_EXPONENT {
            return Err(CodecError::BitstreamCorrupt("threshold exponent out of range"));
        }

        self.dim_x = dim_x;
        self.dim_y = dim_y;
        self.encoding = false;
        self.max_bits = max_bits;
        self.term_level = term_level;
        self.coeffs = vec![0.0; dim_x * dim_y];
        self.signs = vec![false; dim_x * dim_y];
        self.bits = BitBuffer::from_bytes(&stream[CODER_HEADER_LEN..]);
        self.bit_idx = 0;

        self.init_lists();
        self.coding_loop();

        let mut out = std::mem::take(&mut self.coeffs);
        for (v, &neg) in out.iter_mut().zip(&self.signs) {
            if neg {
                *v = -*v;
            }
        }
        Ok(out)
    }

    //──────────────────────────── STATE MACHINE ─────────────────────────

    fn init_lists(&mut self) {
        let levels = num_xform_levels(self.dim_x.min(self.dim_y));
        let parts = num_part_levels_2d(self.dim_x, self.dim_y);
        for level in &mut self.lis {
            level.clear();
        }
        self.lis.resize_with(parts, || Vec::with_capacity(VEC_INIT_CAP));
        self.lis_garbage.clear();
        self.lis_garbage.resize(parts, 0);
        self.lsp.clear();

        let root = calc_set_size_2d((self.dim_x, self.dim_y), levels - 1, 0);
        self.i_set = SpeckSet2d {
            start_x: root.length_x,
            start_y: root.length_y,
            length_x: self.dim_x,
            length_y: self.dim_y,
            part_level: levels - 1,
            ..SpeckSet2d::default()
        };
        self.lis[root.part_level].push(root);

        self.threshold = (self.max_bits as f64).exp2();
    }

    fn coding_loop(&mut self) {
        let num_planes = (self.max_bits as i64 - self.term_level as i64 + 1).max(0);
        for _ in 0..num_planes {
            if self.sorting_pass().is_err() {
                return;
            }
            if self.refinement_pass().is_err() {
                return;
            }
            self.threshold *= 0.5;
            self.clean_lis();
        }
    }

    /// Scan LIS levels deepest first so children inserted during the scan
    /// are not re-visited within the same pass, then handle the I-set.
    fn sorting_pass(&mut self) -> Result<(), BudgetHit> {
        for lev in (0..self.lis.len()).rev() {
            let mut idx = 0;
            while idx < self.lis[lev].len() {
                if !self.lis[lev][idx].garbage {
                    self.process_s(lev, idx)?;
                }
                idx += 1;
            }
        }
        self.process_i()
    }

    fn refinement_pass(&mut self) -> Result<(), BudgetHit> {
        for i in 0..self.lsp.len() {
            if self.lsp[i].signif == Significance::NewlySig {
                self.lsp[i].signif = Significance::Sig;
                continue;
            }
            let idx = self.lsp[i].start_y * self.dim_x + self.lsp[i].start_x;
            if self.encoding {
                let bit = self.coeffs[idx] >= self.threshold;
                self.emit_bit(bit)?;
                if bit {
                    self.coeffs[idx] -= self.threshold;
                }
            } else if self.read_bit()? {
                self.coeffs[idx] += 0.5 * self.threshold;
            } else {
                self.coeffs[idx] -= 0.5 * self.threshold;
            }
        }
        Ok(())
    }

    fn process_s(&mut self, lev: usize, idx: usize) -> Result<(), BudgetHit> {
        let set = self.lis[lev][idx];
        debug_assert!(!set.is_empty());

        let sig = if self.encoding {
            let sig = self.set_is_significant(&set);
            self.emit_bit(sig)?;
            sig
        } else {
            self.read_bit()?
        };

        if !sig {
            self.lis[lev][idx].signif = Significance::Insig;
            return Ok(());
        }

        if set.is_pixel() {
            let lin = set.start_y * self.dim_x + set.start_x;
            if self.encoding {
                self.emit_bit(self.signs[lin])?;
                self.coeffs[lin] -= self.threshold;
            } else {
                self.signs[lin] = self.read_bit()?;
                self.coeffs[lin] = 1.5 * self.threshold;
            }
            let mut pixel = set;
            pixel.signif = Significance::NewlySig;
            self.lsp.push(pixel);
        } else {
            self.code_s(&set)?;
        }
        self.lis[lev][idx].garbage = true;
        self.lis_garbage[lev] += 1;
        Ok(())
    }

    fn code_s(&mut self, set: &SpeckSet2d) -> Result<(), BudgetHit> {
        let children = partition_s_2d(set);
        for child in children.iter().rev() {
            if child.is_empty() {
                continue;
            }
            debug_assert!(child.part_level < self.lis.len());
            self.lis[child.part_level].push(*child);
            let idx = self.lis[child.part_level].len() - 1;
            self.process_s(child.part_level, idx)?;
        }
        Ok(())
    }

    fn process_i(&mut self) -> Result<(), BudgetHit> {
        if self.i_set.start_x >= self.dim_x && self.i_set.start_y >= self.dim_y {
            return Ok(());
        }
        let sig = if self.encoding {
            let sig = self.i_is_significant();
            self.emit_bit(sig)?;
            sig
        } else {
            self.read_bit()?
        };
        if sig {
            self.code_i()?;
        }
        Ok(())
    }

    fn code_i(&mut self) -> Result<(), BudgetHit> {
        let children = partition_i_2d(&mut self.i_set, (self.dim_x, self.dim_y));
        for child in children.iter().rev() {
            if child.is_empty() {
                continue;
            }
            self.lis[child.part_level].push(*child);
            let idx = self.lis[child.part_level].len() - 1;
            self.process_s(child.part_level, idx)?;
        }
        self.process_i()
    }

    fn clean_lis(&mut self) {
        for lev in 0..self.lis.len() {
            if self.lis_garbage[lev] > VEC_INIT_CAP
                && self.lis_garbage[lev] >= self.lis[lev].len() / 2
            {
                self.lis[lev].retain(|s| !s.garbage);
                self.lis_garbage[lev] = 0;
            }
        }
    }

    //─────────────────────────── BIT TRANSPORT ──────────────────────────

    fn emit_bit(&mut self, bit: bool) -> Result<(), BudgetHit> {
        self.bits.push(bit)
    }

    fn read_bit(&mut self) -> Result<bool, BudgetHit> {
        match self.bits.get(self.bit_idx) {
            Some(bit) => {
                self.bit_idx += 1;
                Ok(bit)
            }
            None => Err(BudgetHit),
        }
    }

    //──────────────────────── SIGNIFICANCE SCANS ────────────────────────

    fn set_is_significant(&self, set: &SpeckSet2d) -> bool {
        for y in set.start_y..set.start_y + set.length_y {
            let row = y * self.dim_x;
            for x in set.start_x..set.start_x + set.length_x {
                if self.coeffs[row + x] >= self.threshold {
                    return true;
                }
            }
        }
        false
    }

    fn i_is_significant(&self) -> bool {
        let (sx, sy) = (self.i_set.start_x, self.i_set.start_y);
        for y in 0..self.dim_y {
            let row = y * self.dim_x;
            let x_begin = if y < sy { sx } else { 0 };
            for x in x_begin..self.dim_x {
                if self.coeffs[row + x] >= self.threshold {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn roundtrip(coeffs: &[f64], dims: (usize, usize), mode: RateMode) -> Vec<f64> {
        let mut coder = Speck2d::new();
        let stream = coder.encode(coeffs.to_vec(), dims, mode).unwrap();
        coder.decode(&stream, dims).unwrap()
    }

    fn max_err(a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    }

    // 4x4 plane with a single 8.0 at the origin: the first sorting pass
    // is fully determined, one quadrant path leads to the pixel.
    #[test]
    fn single_power_of_two_coefficient() {
        let mut coeffs = vec![0.0; 16];
        coeffs[0] = 8.0;
        let mut coder = Speck2d::new();
        let stream = coder
            .encode(coeffs.clone(), (4, 4), RateMode::BitBudget(4096))
            .unwrap();
        assert_eq!(coder.max_coefficient_bits(), 3);

        let payload = BitBuffer::from_bytes(&stream[CODER_HEADER_LEN..]);
        let expected = [
            true, // root significant
            false, false, false, true, // quadrants: origin child last
            false, false, false, true, // pixels within the origin quadrant
            false, // positive sign
        ];
        for (i, &bit) in expected.iter().enumerate() {
            assert_eq!(payload.get(i), Some(bit), "bit {i}");
        }

        let decoded = coder.decode(&stream, (4, 4)).unwrap();
        // Final threshold 1: the midtread estimate is within half of it.
        assert!((decoded[0] - 8.0).abs() <= 0.5);
        assert!(decoded[1..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn degenerate_single_pixel_plane() {
        let decoded = roundtrip(&[3.75], (1, 1), RateMode::BitBudget(8));
        assert!((decoded[0] - 3.75).abs() <= 0.5);
    }

    // Regression for the pixel linear index: a significant pixel away
    // from the origin must land at the same position after decode.
    #[test]
    fn non_origin_pixel_keeps_its_position() {
        let dims = (4, 4);
        let mut coeffs = vec![0.0; 16];
        coeffs[1 * 4 + 2] = -6.5;
        let decoded = roundtrip(&coeffs, dims, RateMode::BitBudget(4096));
        assert!(
            (decoded[1 * 4 + 2] - -6.5).abs() <= 0.5,
            "expected the value at (2,1), got {:?}",
            decoded
        );
        for (i, &v) in decoded.iter().enumerate() {
            if i != 1 * 4 + 2 {
                assert_eq!(v, 0.0, "index {i}");
            }
        }
    }

    #[test]
    fn all_zero_plane_roundtrips() {
        let decoded = roundtrip(&[0.0; 24], (6, 4), RateMode::BitBudget(4096));
        assert!(decoded.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn full_budget_error_is_below_final_threshold() {
        let mut rng = StdRng::seed_from_u64(21);
        let dims = (13, 9);
        let coeffs: Vec<f64> = (0..dims.0 * dims.1)
            .map(|_| rng.random_range(-100.0..100.0))
            .collect();
        let decoded = roundtrip(&coeffs, dims, RateMode::BitBudget(usize::MAX >> 8));
        // max_bits = 6, planes = 7: per-coefficient error <= 2^0.
        assert!(max_err(&coeffs, &decoded) <= 1.0);
    }

    // Growing the budget never makes the reconstruction worse.
    #[test]
    fn error_is_monotone_in_budget() {
        let mut rng = StdRng::seed_from_u64(22);
        let dims = (8, 8);
        let coeffs: Vec<f64> = (0..64).map(|_| rng.random_range(-64.0..64.0)).collect();
        let mut prev = f64::INFINITY;
        for budget in [48, 96, 160, 320, 640, 1280] {
            let decoded = roundtrip(&coeffs, dims, RateMode::BitBudget(budget));
            let err = max_err(&coeffs, &decoded);
            assert!(
                err <= prev + 1e-12,
                "error grew from {prev} to {err} at budget {budget}"
            );
            prev = err;
        }
    }

    // A budget that halts encoding mid-pass still yields a stream the
    // decoder consumes to the exact same point.
    #[test]
    fn truncated_budget_decodes_cleanly() {
        let mut rng = StdRng::seed_from_u64(23);
        let dims = (8, 8);
        let coeffs: Vec<f64> = (0..64).map(|_| rng.random_range(-64.0..64.0)).collect();
        for budget in [8, 24, 51, 77, 200] {
            let mut coder = Speck2d::new();
            let stream = coder
                .encode(coeffs.clone(), dims, RateMode::BitBudget(budget))
                .unwrap();
            assert!((stream.len() - CODER_HEADER_LEN) * 8 <= budget + 7);
            let decoded = coder.decode(&stream, dims).unwrap();
            assert!(decoded.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn qz_termination_stops_at_the_requested_plane() {
        let dims = (4, 4);
        let mut coeffs = vec![0.0; 16];
        coeffs[0] = 20.0; // max_bits = 4
        coeffs[5] = 1.5; // below 2^2, must vanish at q = 2
        let mut coder = Speck2d::new();
        let stream = coder
            .encode(coeffs.clone(), dims, RateMode::QzLevel(2))
            .unwrap();
        let decoded = coder.decode(&stream, dims).unwrap();
        assert!((decoded[0] - 20.0).abs() <= 2.0);
        assert_eq!(decoded[5], 0.0);
    }

    #[test]
    fn decoder_rejects_foreign_dims() {
        let mut coder = Speck2d::new();
        let stream = coder
            .encode(vec![1.0; 16], (4, 4), RateMode::BitBudget(512))
            .unwrap();
        assert!(matches!(
            coder.decode(&stream, (8, 2)),
            Err(CodecError::BitstreamCorrupt(_))
        ));
    }
}
