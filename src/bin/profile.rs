use std::time::Instant;

use anyhow::{Context, Result};
use rand_distr::{Distribution, StandardNormal};
use volpack::{Decoder, Encoder};

fn main() -> Result<()> {
    // Smooth-ish synthetic volume: a slow gradient plus Gaussian noise.
    let dims = [256, 256, 64];
    let normal = StandardNormal;
    let mut rng = rand::rng();
    let volume: Vec<f64> = (0..dims[0] * dims[1] * dims[2])
        .map(|i| {
            let x = (i % dims[0]) as f64;
            let noise: f64 = normal.sample(&mut rng);
            (x / 4.0).sin() * 100.0 + noise
        })
        .collect();

    let threads = 4;
    let bpp = 4.0;

    let start = Instant::now();
    let mut encoder = Encoder::new();
    encoder.set_threads(threads);
    encoder
        .copy_data(&volume, dims, [64, 64, 64])
        .context("buffering the volume")?;
    encoder.set_bpp(bpp).context("configuring the rate")?;
    encoder.compress().context("compressing")?;
    let bytes = encoder.take_encoded_bitstream()?;
    println!(
        "Compression took {:?} ({} -> {} bytes, {:.2} bpp requested)",
        start.elapsed(),
        volume.len() * 8,
        bytes.len(),
        bpp
    );

    let start = Instant::now();
    let mut decoder = Decoder::new();
    decoder.set_threads(threads);
    decoder.use_bitstream(&bytes).context("parsing the container")?;
    decoder.decompress().context("decompressing")?;
    let recovered = decoder.release_data();
    println!("Decompression took {:?}", start.elapsed());

    let mse: f64 = volume
        .iter()
        .zip(&recovered)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        / volume.len() as f64;
    let range = 200.0f64;
    let psnr = 10.0 * (range * range / mse).log10();
    println!("RMSE {:.4}, PSNR {:.2} dB", mse.sqrt(), psnr);

    Ok(())
}
