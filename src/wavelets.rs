//! Multi-level CDF 9/7 lifting transform, in-place on flat `f64` buffers.
//!
//! Forward 1D: four lifting steps with whole-sample symmetric extension,
//! scaling, then deinterleave into `[approx | detail]` where the
//! approximation takes the ceiling half. 2D transforms rows then columns
//! per level; 3D adds the z pillars. The level count comes from
//! [`crate::sets::num_xform_levels`] so subband boundaries always agree
//! with the coder's set geometry.

use crate::sets::num_xform_levels;

// Lifting parameters of the 9/7 irreversible filter (ITU-T T.800 Table F.4).
const ALPHA: f64 = -1.586_134_342_059_924;
const BETA: f64 = -0.052_980_118_572_961;
const GAMMA: f64 = 0.882_911_075_530_934;
const DELTA: f64 = 0.443_506_852_043_971;
const K: f64 = 1.230_174_104_914_001;

#[inline]
fn reflect(i: isize, n: isize) -> usize {
    let mut i = i;
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * (n - 1) - i;
        } else {
            return i as usize;
        }
    }
}

#[inline]
fn lift(data: &mut [f64], parity: usize, coef: f64) {
    let n = data.len() as isize;
    let mut i = parity as isize;
    while i < n {
        let left = data[reflect(i - 1, n)];
        let right = data[reflect(i + 1, n)];
        data[i as usize] += coef * (left + right);
        i += 2;
    }
}

/// Forward 1D 9/7 transform (in-place) on a slice.
pub fn fwd_txfm_1d_inplace(data: &mut [f64], scratch: &mut Vec<f64>) {
    let n = data.len();
    if n < 2 {
        return;
    }

    lift(data, 1, ALPHA);
    lift(data, 0, BETA);
    lift(data, 1, GAMMA);
    lift(data, 0, DELTA);

    // Deinterleave: even samples become the approximation half.
    let even_len = n - n / 2;
    scratch.clear();
    scratch.resize(n, 0.0);
    for i in 0..even_len {
        scratch[i] = data[2 * i] / K;
    }
    for i in 0..n / 2 {
        scratch[even_len + i] = data[2 * i + 1] * K;
    }
    data.copy_from_slice(scratch);
}

/// Inverse 1D 9/7 transform (in-place) on a slice.
pub fn inv_txfm_1d_inplace(data: &mut [f64], scratch: &mut Vec<f64>) {
    let n = data.len();
    if n < 2 {
        return;
    }

    // Interleave back from [approx | detail] and undo the scaling.
    let even_len = n - n / 2;
    scratch.clear();
    scratch.resize(n, 0.0);
    for i in 0..even_len {
        scratch[2 * i] = data[i] * K;
    }
    for i in 0..n / 2 {
        scratch[2 * i + 1] = data[even_len + i] / K;
    }
    data.copy_from_slice(scratch);

    lift(data, 0, -DELTA);
    lift(data, 1, -GAMMA);
    lift(data, 0, -BETA);
    lift(data, 1, -ALPHA);
}

//────────────────────────────── 2D / 3D ─────────────────────────────────

fn fwd_2d_one_level(data: &mut [f64], dim_x: usize, len_x: usize, len_y: usize) {
    let mut scratch = Vec::new();
    let mut column = Vec::new();
    for y in 0..len_y {
        fwd_txfm_1d_inplace(&mut data[y * dim_x..y * dim_x + len_x], &mut scratch);
    }
    for x in 0..len_x {
        column.clear();
        column.extend((0..len_y).map(|y| data[y * dim_x + x]));
        fwd_txfm_1d_inplace(&mut column, &mut scratch);
        for (y, &v) in column.iter().enumerate() {
            data[y * dim_x + x] = v;
        }
    }
}

fn inv_2d_one_level(data: &mut [f64], dim_x: usize, len_x: usize, len_y: usize) {
    let mut scratch = Vec::new();
    let mut column = Vec::new();
    for x in 0..len_x {
        column.clear();
        column.extend((0..len_y).map(|y| data[y * dim_x + x]));
        inv_txfm_1d_inplace(&mut column, &mut scratch);
        for (y, &v) in column.iter().enumerate() {
            data[y * dim_x + x] = v;
        }
    }
    for y in 0..len_y {
        inv_txfm_1d_inplace(&mut data[y * dim_x..y * dim_x + len_x], &mut scratch);
    }
}

/// Per-level region sizes of a dyadic decomposition.
fn level_extents(dims: (usize, usize, usize), levels: usize) -> Vec<(usize, usize, usize)> {
    let mut extents = Vec::with_capacity(levels);
    let (mut x, mut y, mut z) = dims;
    for _ in 0..levels {
        extents.push((x, y, z));
        x -= x / 2;
        y -= y / 2;
        z -= z / 2;
    }
    extents
}

/// Forward multi-level 2D transform on a row-major `dims.0 x dims.1` buffer.
pub fn fwd_txfm_2d(data: &mut [f64], dims: (usize, usize)) {
    let levels = num_xform_levels(dims.0.min(dims.1));
    for (lx, ly, _) in level_extents((dims.0, dims.1, 1), levels) {
        fwd_2d_one_level(data, dims.0, lx, ly);
    }
}

/// Inverse multi-level 2D transform.
pub fn inv_txfm_2d(data: &mut [f64], dims: (usize, usize)) {
    let levels = num_xform_levels(dims.0.min(dims.1));
    for (lx, ly, _) in level_extents((dims.0, dims.1, 1), levels).into_iter().rev() {
        inv_2d_one_level(data, dims.0, lx, ly);
    }
}

fn fwd_3d_one_level(
    data: &mut [f64],
    dims: (usize, usize, usize),
    extent: (usize, usize, usize),
) {
    let (dim_x, dim_y, _) = dims;
    let (len_x, len_y, len_z) = extent;
    let slice_len = dim_x * dim_y;
    let mut scratch = Vec::new();
    let mut line = Vec::new();
    for z in 0..len_z {
        fwd_2d_one_level(&mut data[z * slice_len..(z + 1) * slice_len], dim_x, len_x, len_y);
    }
    for y in 0..len_y {
        for x in 0..len_x {
            line.clear();
            line.extend((0..len_z).map(|z| data[z * slice_len + y * dim_x + x]));
            fwd_txfm_1d_inplace(&mut line, &mut scratch);
            for (z, &v) in line.iter().enumerate() {
                data[z * slice_len + y * dim_x + x] = v;
            }
        }
    }
}

fn inv_3d_one_level(
    data: &mut [f64],
    dims: (usize, usize, usize),
    extent: (usize, usize, usize),
) {
    let (dim_x, dim_y, _) = dims;
    let (len_x, len_y, len_z) = extent;
    let slice_len = dim_x * dim_y;
    let mut scratch = Vec::new();
    let mut line = Vec::new();
    for y in 0..len_y {
        for x in 0..len_x {
            line.clear();
            line.extend((0..len_z).map(|z| data[z * slice_len + y * dim_x + x]));
            inv_txfm_1d_inplace(&mut line, &mut scratch);
            for (z, &v) in line.iter().enumerate() {
                data[z * slice_len + y * dim_x + x] = v;
            }
        }
    }
    for z in 0..len_z {
        inv_2d_one_level(&mut data[z * slice_len..(z + 1) * slice_len], dim_x, len_x, len_y);
    }
}

/// Forward multi-level 3D transform on an x-fastest `dims` buffer.
pub fn fwd_txfm_3d(data: &mut [f64], dims: (usize, usize, usize)) {
    let levels = num_xform_levels(dims.0.min(dims.1).min(dims.2));
    for extent in level_extents(dims, levels) {
        fwd_3d_one_level(data, dims, extent);
    }
}

/// Inverse multi-level 3D transform.
pub fn inv_txfm_3d(data: &mut [f64], dims: (usize, usize, usize)) {
    let levels = num_xform_levels(dims.0.min(dims.1).min(dims.2));
    for extent in level_extents(dims, levels).into_iter().rev() {
        inv_3d_one_level(data, dims, extent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    }

    #[test]
    fn roundtrip_1d_odd_length() {
        let mut rng = StdRng::seed_from_u64(11);
        let orig: Vec<f64> = (0..37).map(|_| rng.random_range(-50.0..50.0)).collect();
        let mut data = orig.clone();
        let mut scratch = Vec::new();
        fwd_txfm_1d_inplace(&mut data, &mut scratch);
        inv_txfm_1d_inplace(&mut data, &mut scratch);
        assert!(max_abs_diff(&data, &orig) < 1e-9);
    }

    #[test]
    fn roundtrip_2d() {
        let mut rng = StdRng::seed_from_u64(12);
        let dims = (33, 20);
        let orig: Vec<f64> = (0..dims.0 * dims.1)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        let mut data = orig.clone();
        fwd_txfm_2d(&mut data, dims);
        inv_txfm_2d(&mut data, dims);
        assert!(max_abs_diff(&data, &orig) < 1e-9);
    }

    #[test]
    fn roundtrip_3d() {
        let mut rng = StdRng::seed_from_u64(13);
        let dims = (10, 9, 12);
        let orig: Vec<f64> = (0..dims.0 * dims.1 * dims.2)
            .map(|_| rng.random_range(-100.0..100.0))
            .collect();
        let mut data = orig.clone();
        fwd_txfm_3d(&mut data, dims);
        inv_txfm_3d(&mut data, dims);
        assert!(max_abs_diff(&data, &orig) < 1e-8);
    }

    #[test]
    fn short_dimension_is_left_alone() {
        let mut data = vec![4.2];
        let mut scratch = Vec::new();
        fwd_txfm_1d_inplace(&mut data, &mut scratch);
        assert_eq!(data, vec![4.2]);
    }

    // A constant field concentrates into the approximation band.
    #[test]
    fn constant_field_has_no_detail_energy() {
        let dims = (16, 16);
        let mut data = vec![1.0; 256];
        fwd_txfm_2d(&mut data, dims);
        let (low, _) = crate::sets::approx_detail_len(16, num_xform_levels(16));
        for y in 0..16 {
            for x in 0..16 {
                if x >= low || y >= low {
                    assert!(data[y * 16 + x].abs() < 1e-9, "detail at ({x},{y})");
                }
            }
        }
    }
}
