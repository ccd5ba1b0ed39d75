//! 3D SPECK coder. Same machine as the 2D variant with octant
//! partitioning, and one encode-side extra: the significance scan of a
//! set classifies each significant cell into one of the eight child
//! octants, so `code_s` hands every child its verdict instead of
//! re-scanning the region.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::bits::BitBuffer;
use crate::error::{BudgetHit, CodecError};
use crate::sets::{
    calc_set_size_3d, num_part_levels_3d, num_xform_levels, partition_i_3d, partition_s_3d,
    Significance, SpeckSet3d,
};
use crate::RateMode;

const CODER_HEADER_LEN: usize = 16;

const VEC_INIT_CAP: usize = 8;

const MAX_EXPONENT: i32 = 1100;

#[derive(Debug, Default)]
pub struct Speck3d {
    dim_x: usize,
    dim_y: usize,
    dim_z: usize,
    coeffs: Vec<f64>,
    signs: Vec<bool>,
    lis: Vec<Vec<SpeckSet3d>>,
    lis_garbage: Vec<usize>,
    lsp: Vec<SpeckSet3d>,
    i_set: SpeckSet3d,
    threshold: f64,
    max_bits: i32,
    term_level: i32,
    bits: BitBuffer,
    bit_idx: usize,
    encoding: bool,
}

impl Speck3d {
    pub fn new() -> Self {
        Speck3d::default()
    }

    pub fn max_coefficient_bits(&self) -> i32 {
        self.max_bits
    }

    pub fn encode(
        &mut self,
        mut coeffs: Vec<f64>,
        dims: (usize, usize, usize),
        mode: RateMode,
    ) -> Result<Vec<u8>, CodecError> {
        if dims.0 == 0 || dims.1 == 0 || dims.2 == 0 {
            return Err(CodecError::InvalidParam("zero volume dimension"));
        }
        if coeffs.len() != dims.0 * dims.1 * dims.2 {
            return Err(CodecError::WrongDims);
        }

        self.dim_x = dims.0;
        self.dim_y = dims.1;
        self.dim_z = dims.2;
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
        out.extend_from_slice(&(self.dim_z as u32).to_le_bytes());
        out.extend_from_slice(&(self.max_bits as i16).to_le_bytes());
        out.extend_from_slice(&(self.term_level as i16).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(
        &mut self,
        stream: &[u8],
        dims: (usize, usize, usize),
    ) -> Result<Vec<f64>, CodecError> {
        if stream.len() < CODER_HEADER_LEN {
            return Err(CodecError::BitstreamTruncated);
        }
        let mut cur = Cursor::new(stream);
        let dim_x = cur.read_u32::<LittleEndian>()? as usize;
        let dim_y = cur.read_u32::<LittleEndian>()? as usize;
        let dim_z = cur.read_u32::<LittleEndian>()? as usize;
        let max_bits = cur.read_i16::<LittleEndian>()? as i32;
        let term_level = cur.read_i16::<LittleEndian>()? as i32;
        if (dim_x, dim_y, dim_z) != dims {
            return Err(CodecError::BitstreamCorrupt("chunk dims disagree with header"));
        }
        if max_bits.abs() > MAX_EXPONENT || term_level.abs() > MAX_EXPONENT {
            return Err(CodecError::BitstreamCorrupt("threshold exponent out of range"));
        }

        self.dim_x = dim_x;
        self.dim_y = dim_y;
        self.dim_z = dim_z;
        self.encoding = false;
        self.max_bits = max_bits;
        self.term_level = term_level;
        self.coeffs = vec![0.0; dim_x * dim_y * dim_z];
        self.signs = vec![false; dim_x * dim_y * dim_z];
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
        let levels = num_xform_levels(self.dim_x.min(self.dim_y).min(self.dim_z));
        let parts = num_part_levels_3d(self.dim_x, self.dim_y, self.dim_z);
        for level in &mut self.lis {
            level.clear();
        }
        self.lis.resize_with(parts, || Vec::with_capacity(VEC_INIT_CAP));
        self.lis_garbage.clear();
        self.lis_garbage.resize(parts, 0);
        self.lsp.clear();

        let root = calc_set_size_3d((self.dim_x, self.dim_y, self.dim_z), levels - 1, 0);
        self.i_set = SpeckSet3d {
            start_x: root.length_x,
            start_y: root.length_y,
            start_z: root.length_z,
            length_x: self.dim_x,
            length_y: self.dim_y,
            length_z: self.dim_z,
            part_level: levels - 1,
            ..SpeckSet3d::default()
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

    fn sorting_pass(&mut self) -> Result<(), BudgetHit> {
        for lev in (0..self.lis.len()).rev() {
            let mut idx = 0;
            while idx < self.lis[lev].len() {
                if !self.lis[lev][idx].garbage {
                    self.process_s(lev, idx, None)?;
                }
                idx += 1;
            }
        }
        self.process_i()
    }

    fn refinement_pass(&mut self) -> Result<(), BudgetHit> {
        let slice = self.dim_x * self.dim_y;
        for i in 0..self.lsp.len() {
            if self.lsp[i].signif == Significance::NewlySig {
                self.lsp[i].signif = Significance::Sig;
                continue;
            }
            let idx =
                self.lsp[i].start_z * slice + self.lsp[i].start_y * self.dim_x + self.lsp[i].start_x;
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

    /// `known` carries the verdict the parent's scan already produced for
    /// this set (encode mode only).
    fn process_s(&mut self, lev: usize, idx: usize, known: Option<bool>) -> Result<(), BudgetHit> {
        let set = self.lis[lev][idx];
        debug_assert!(!set.is_empty());

        let mut child_sigs = None;
        let sig = if self.encoding {
            let sig = match known {
                Some(sig) => sig,
                None => {
                    let (sig, sigs) = self.scan_set(&set);
                    child_sigs = Some(sigs);
                    sig
                }
            };
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
            let lin = set.start_z * self.dim_x * self.dim_y
                + set.start_y * self.dim_x
                + set.start_x;
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
            self.code_s(&set, child_sigs)?;
        }
        self.lis[lev][idx].garbage = true;
        self.lis_garbage[lev] += 1;
        Ok(())
    }

    fn code_s(
        &mut self,
        set: &SpeckSet3d,
        child_sigs: Option<[bool; 8]>,
    ) -> Result<(), BudgetHit> {
        let hints = if self.encoding {
            match child_sigs {
                Some(sigs) => sigs,
                None => self.scan_set(set).1,
            }
        } else {
            [false; 8]
        };
        let children = partition_s_3d(set);
        for sb in (0..8).rev() {
            let child = children[sb];
            if child.is_empty() {
                continue;
            }
            debug_assert!(child.part_level < self.lis.len());
            self.lis[child.part_level].push(child);
            let idx = self.lis[child.part_level].len() - 1;
            let known = if self.encoding { Some(hints[sb]) } else { None };
            self.process_s(child.part_level, idx, known)?;
        }
        Ok(())
    }

    fn process_i(&mut self) -> Result<(), BudgetHit> {
        if self.i_set.start_x >= self.dim_x
            && self.i_set.start_y >= self.dim_y
            && self.i_set.start_z >= self.dim_z
        {
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
        let children = partition_i_3d(&mut self.i_set, (self.dim_x, self.dim_y, self.dim_z));
        for child in children.iter().rev() {
            if child.is_empty() {
                continue;
            }
            self.lis[child.part_level].push(*child);
            let idx = self.lis[child.part_level].len() - 1;
            self.process_s(child.part_level, idx, None)?;
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

    /// Scan a set and classify every significant cell into the child
    /// octant it falls in: bit 0 = x past the split, bit 1 = y, bit 2 = z.
    fn scan_set(&self, set: &SpeckSet3d) -> (bool, [bool; 8]) {
        let split_x = set.start_x + (set.length_x - set.length_x / 2);
        let split_y = set.start_y + (set.length_y - set.length_y / 2);
        let split_z = set.start_z + (set.length_z - set.length_z / 2);
        let slice = self.dim_x * self.dim_y;
        let mut children = [false; 8];
        let mut sig = false;
        for z in set.start_z..set.start_z + set.length_z {
            for y in set.start_y..set.start_y + set.length_y {
                let row = z * slice + y * self.dim_x;
                for x in set.start_x..set.start_x + set.length_x {
                    if self.coeffs[row + x] >= self.threshold {
                        sig = true;
                        let sb = usize::from(x >= split_x)
                            | usize::from(y >= split_y) << 1
                            | usize::from(z >= split_z) << 2;
                        children[sb] = true;
                    }
                }
            }
        }
        (sig, children)
    }

    fn i_is_significant(&self) -> bool {
        let (sx, sy, sz) = (self.i_set.start_x, self.i_set.start_y, self.i_set.start_z);
        let slice = self.dim_x * self.dim_y;
        for z in 0..self.dim_z {
            for y in 0..self.dim_y {
                let row = z * slice + y * self.dim_x;
                let x_begin = if z < sz && y < sy { sx } else { 0 };
                for x in x_begin..self.dim_x {
                    if self.coeffs[row + x] >= self.threshold {
                        return true;
                    }
                }
            }
        }
        false
    }
}
