//! Per-chunk statistics homogenization applied before the wavelet
//! transform. Each chunk stream starts with a 17-byte self-describing
//! header so the decoder needs no out-of-band settings.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::CodecError;

/// Length of the conditioner header: one flag byte plus two f64 fields.
pub const HEADER_LEN: usize = 17;

const FLAG_SUBTRACT_MEAN: u8 = 1;
const FLAG_DIVIDE_RMS: u8 = 1 << 1;

/// Which conditioning operations to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionerSettings {
    pub subtract_mean: bool,
    pub divide_rms: bool,
}

impl Default for ConditionerSettings {
    fn default() -> Self {
        ConditionerSettings {
            subtract_mean: true,
            divide_rms: false,
        }
    }
}

/// Condition `data` in place and return the header describing how to undo
/// it. A zero-RMS chunk skips the division and clears the flag.
pub fn condition(data: &mut [f64], settings: ConditionerSettings) -> [u8; HEADER_LEN] {
    let n = data.len().max(1) as f64;
    let mut flags = 0u8;
    let mut mean = 0.0;
    let mut rms = 0.0;

    if settings.subtract_mean {
        mean = data.iter().sum::<f64>() / n;
        for v in data.iter_mut() {
            *v -= mean;
        }
        flags |= FLAG_SUBTRACT_MEAN;
    }
    if settings.divide_rms {
        rms = (data.iter().map(|v| v * v).sum::<f64>() / n).sqrt();
        if rms > 0.0 {
            for v in data.iter_mut() {
                *v /= rms;
            }
            flags |= FLAG_DIVIDE_RMS;
        } else {
            rms = 0.0;
        }
    }

    let mut header = [0u8; HEADER_LEN];
    header[0] = flags;
    LittleEndian::write_f64(&mut header[1..9], mean);
    LittleEndian::write_f64(&mut header[9..17], rms);
    header
}

/// Undo [`condition`] according to the header it produced.
pub fn restore(data: &mut [f64], header: &[u8]) -> Result<(), CodecError> {
    if header.len() < HEADER_LEN {
        return Err(CodecError::BitstreamTruncated);
    }
    let flags = header[0];
    if flags & !(FLAG_SUBTRACT_MEAN | FLAG_DIVIDE_RMS) != 0 {
        return Err(CodecError::BitstreamCorrupt("unknown conditioner flags"));
    }
    let mean = LittleEndian::read_f64(&header[1..9]);
    let rms = LittleEndian::read_f64(&header[9..17]);
    if !mean.is_finite() || !rms.is_finite() {
        return Err(CodecError::BitstreamCorrupt("non-finite conditioner fields"));
    }

    if flags & FLAG_DIVIDE_RMS != 0 {
        for v in data.iter_mut() {
            *v *= rms;
        }
    }
    if flags & FLAG_SUBTRACT_MEAN != 0 {
        for v in data.iter_mut() {
            *v += mean;
        }
    }
    Ok(())
}
