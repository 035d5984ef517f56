//! Windowed-sinc FIR band-pass, applied by overlap-add FFT convolution.
//!
//! The impulse response is the difference of two lowpass sinc kernels
//! (cutoffs at the band edges) under a von-Hann window. Each input block
//! is zero-padded to the FFT length, transformed, multiplied with the
//! pre-transformed kernel spectrum, and transformed back; the `taps - 1`
//! convolution tail is carried into the next block. The filter delays the
//! signal by `(taps - 1) / 2` samples.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Smallest and largest FFT lengths the planner is asked for.
const MIN_FFT_LEN: usize = 16;
const MAX_FFT_LEN: usize = 32_768;

pub struct FirBandPass {
    taps: usize,
    block_len: usize,
    fft_len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    kernel_spectrum: Vec<Complex<f32>>,
    /// Convolution tail (`taps - 1` samples) carried between blocks.
    carry: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl FirBandPass {
    /// Build a band-pass of `taps` coefficients (forced odd) passing
    /// `min_freq..max_freq` Hz at the given sample rate, for input blocks
    /// of `block_len` samples.
    #[must_use]
    pub fn new(taps: usize, min_freq: f32, max_freq: f32, sample_rate: f32, block_len: usize) -> Self {
        let taps = if taps % 2 == 0 { taps + 1 } else { taps }.max(3);
        let fft_len = (block_len + taps - 1)
            .next_power_of_two()
            .clamp(MIN_FFT_LEN, MAX_FFT_LEN);
        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);

        let kernel = band_pass_kernel(taps, min_freq, max_freq, sample_rate);
        let mut kernel_spectrum: Vec<Complex<f32>> =
            kernel.iter().map(|&h| Complex::new(h, 0.0)).collect();
        kernel_spectrum.resize(fft_len, Complex::new(0.0, 0.0));
        forward.process(&mut kernel_spectrum);

        Self {
            taps,
            block_len,
            fft_len,
            forward,
            inverse,
            kernel_spectrum,
            carry: vec![0.0; taps - 1],
            scratch: vec![Complex::new(0.0, 0.0); fft_len],
        }
    }

    /// Delay introduced by the linear-phase kernel, in samples.
    #[must_use]
    pub fn delay(&self) -> usize {
        (self.taps - 1) / 2
    }

    /// Drop the carried tail, e.g. after a seek.
    pub fn reset(&mut self) {
        self.carry.fill(0.0);
    }

    /// Filter one block in place. `buf` must not exceed the block length
    /// the filter was built for.
    pub fn apply(&mut self, buf: &mut [f32]) {
        debug_assert!(buf.len() <= self.block_len);
        self.scratch.fill(Complex::new(0.0, 0.0));
        for (c, &s) in self.scratch.iter_mut().zip(buf.iter()) {
            c.re = s;
        }
        self.forward.process(&mut self.scratch);
        for (c, k) in self.scratch.iter_mut().zip(&self.kernel_spectrum) {
            *c *= *k;
        }
        self.inverse.process(&mut self.scratch);

        // rustfft leaves the inverse unscaled.
        let scale = 1.0 / self.fft_len as f32;
        let tail = self.taps - 1;
        for (i, out) in buf.iter_mut().enumerate() {
            let mut y = self.scratch[i].re * scale;
            if i < tail {
                y += self.carry[i];
            }
            *out = y;
        }
        // A block shorter than `block_len` leaves part of the old carry
        // unconsumed; it folds into the new one.
        let n = buf.len();
        for i in 0..tail {
            let mut c = self.scratch[n + i].re * scale;
            if n + i < tail {
                c += self.carry[n + i];
            }
            self.carry[i] = c;
        }
    }
}

/// Difference of two windowed lowpass sincs: passes `min_freq..max_freq`.
fn band_pass_kernel(taps: usize, min_freq: f32, max_freq: f32, sample_rate: f32) -> Vec<f32> {
    let w_min = 2.0 * std::f32::consts::PI * (min_freq / sample_rate).clamp(0.0, 0.5);
    let w_max = 2.0 * std::f32::consts::PI * (max_freq / sample_rate).clamp(0.0, 0.5);
    let center = (taps - 1) as f32 / 2.0;
    (0..taps)
        .map(|i| {
            let t = i as f32 - center;
            let ideal = if t == 0.0 {
                (w_max - w_min) / std::f32::consts::PI
            } else {
                ((w_max * t).sin() - (w_min * t).sin()) / (std::f32::consts::PI * t)
            };
            let window = 0.5
                * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (taps - 1) as f32).cos());
            ideal * window
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Plain time-domain convolution as the reference.
    fn direct_convolve(kernel: &[f32], input: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; input.len()];
        for (n, o) in out.iter_mut().enumerate() {
            for (k, &h) in kernel.iter().enumerate() {
                if n >= k {
                    *o += h * input[n - k];
                }
            }
        }
        out
    }

    fn test_signal(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32;
                (t * 0.21).sin() + 0.5 * (t * 0.043).sin() + 0.25 * (t * 1.7).sin()
            })
            .collect()
    }

    #[test]
    fn kernel_tap_count_is_forced_odd() {
        let f = FirBandPass::new(64, 100.0, 8000.0, 24_000.0, 256);
        assert_eq!(f.delay(), 32);
        let f = FirBandPass::new(65, 100.0, 8000.0, 24_000.0, 256);
        assert_eq!(f.delay(), 32);
    }

    #[test]
    fn overlap_add_matches_direct_convolution() {
        let taps = 31;
        let block = 64;
        let mut fir = FirBandPass::new(taps, 200.0, 9000.0, 24_000.0, block);
        let kernel = band_pass_kernel(taps, 200.0, 9000.0, 24_000.0);

        let input = test_signal(block * 4);
        let expected = direct_convolve(&kernel, &input);

        let mut output = Vec::new();
        for chunk in input.chunks(block) {
            let mut buf = chunk.to_vec();
            fir.apply(&mut buf);
            output.extend_from_slice(&buf);
        }

        for (y, e) in output.iter().zip(&expected) {
            assert_abs_diff_eq!(*y, *e, epsilon = 1e-3);
        }
    }

    #[test]
    fn pass_all_band_reproduces_a_delayed_impulse() {
        // With the band spanning DC to Nyquist the kernel degenerates to a
        // windowed delta; a unit impulse must come back delayed and intact.
        let mut fir = FirBandPass::new(31, 0.0, 12_000.0, 24_000.0, 64);
        let mut buf = vec![0.0f32; 64];
        buf[0] = 1.0;
        fir.apply(&mut buf);
        let delay = fir.delay();
        assert!(buf[delay] > 0.99, "impulse lost: {}", buf[delay]);
        for (i, &y) in buf.iter().enumerate() {
            if i != delay {
                assert!(y.abs() < 0.01, "leakage at {i}: {y}");
            }
        }
    }

    #[test]
    fn short_blocks_keep_the_carried_tail() {
        let taps = 31;
        let block = 64;
        let mut fir = FirBandPass::new(taps, 200.0, 9000.0, 24_000.0, block);
        let kernel = band_pass_kernel(taps, 200.0, 9000.0, 24_000.0);

        let input = test_signal(160);
        let expected = direct_convolve(&kernel, &input);

        // Uneven block sizes, all within the configured length; the
        // 20-sample block is shorter than the kernel tail.
        let mut output = Vec::new();
        for range in [0..64, 64..84, 84..148, 148..160] {
            let mut buf = input[range].to_vec();
            fir.apply(&mut buf);
            output.extend_from_slice(&buf);
        }

        for (y, e) in output.iter().zip(&expected) {
            assert_abs_diff_eq!(*y, *e, epsilon = 1e-3);
        }
    }

    #[test]
    fn band_pass_rejects_dc() {
        let mut fir = FirBandPass::new(255, 2000.0, 8000.0, 24_000.0, 128);
        let mut total = 0.0f32;
        // Constant input; once the kernel is fully primed the output must
        // sit at (approximately) zero.
        for block in 0..8 {
            let mut buf = vec![1.0f32; 128];
            fir.apply(&mut buf);
            if block >= 3 {
                total += buf.iter().map(|y| y.abs()).sum::<f32>();
            }
        }
        assert!(total / (5.0 * 128.0) < 0.01, "DC leaked through: {total}");
    }

    #[test]
    fn reset_clears_the_carried_tail() {
        let mut fir = FirBandPass::new(31, 200.0, 9000.0, 24_000.0, 64);
        let mut buf = test_signal(64);
        fir.apply(&mut buf);
        fir.reset();

        let mut fresh = FirBandPass::new(31, 200.0, 9000.0, 24_000.0, 64);
        let mut a = test_signal(64);
        let mut b = test_signal(64);
        fir.apply(&mut a);
        fresh.apply(&mut b);
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-5);
        }
    }
}
