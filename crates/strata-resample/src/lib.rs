//! Streaming sample-rate conversion using rubato.
//!
//! Wraps rubato's fixed-input-chunk sinc resampler behind a push
//! interface: feed any number of samples, get back however many fit
//! the caller's buffer, with `(input_used, output_written)` counts.
//! Setting `last` starts the drain; subsequent calls keep returning
//! buffered output until `output_written` comes back zero.
//!
//! The adapter trims the resampler's intrinsic output delay and caps
//! the total output at `round(total_input * ratio)`, so a complete
//! pass over N samples produces the expected converted length.

use std::collections::VecDeque;

use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use thiserror::Error;

const CHUNK_SIZE: usize = 1024;

/// Resampling error.
#[derive(Error, Debug)]
pub enum ResampleError {
    #[error("could not construct resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),

    #[error("resampler processing failed: {0}")]
    Process(#[from] rubato::ResampleError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, ResampleError>;

/// Conversion quality presets for constant-ratio mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleQuality {
    Low,
    #[default]
    Medium,
    High,
    Best,
}

impl ResampleQuality {
    fn parameters(&self) -> SincInterpolationParameters {
        let (sinc_len, oversampling_factor, interpolation) = match self {
            ResampleQuality::Low => (64, 128, SincInterpolationType::Linear),
            ResampleQuality::Medium => (128, 256, SincInterpolationType::Linear),
            ResampleQuality::High => (192, 256, SincInterpolationType::Cubic),
            ResampleQuality::Best => (256, 256, SincInterpolationType::Cubic),
        };
        SincInterpolationParameters {
            sinc_len,
            f_cutoff: 0.95,
            interpolation,
            oversampling_factor,
            window: WindowFunction::BlackmanHarris2,
        }
    }
}

/// Band-limited mono resampler, constant or variable ratio.
///
/// Constant-ratio mode (equal min and max factors) honors the quality
/// selection; variable mode always runs at best quality, with the
/// per-call `factor` clamped into `[min_factor, max_factor]`.
pub struct Resampler {
    inner: SincFixedIn<f32>,
    variable: bool,
    base_factor: f64,
    min_factor: f64,
    max_factor: f64,
    in_fifo: Vec<f32>,
    out_fifo: VecDeque<f32>,
    out_scratch: Vec<Vec<f32>>,
    /// Leading output frames still to discard (sinc latency).
    delay_remaining: usize,
    /// Ideal total output for the input accepted so far.
    expected: f64,
    emitted: u64,
    finished_input: bool,
}

impl Resampler {
    /// Mirror of the engine's two-knob construction: best-or-fast
    /// method selection plus the factor range. Equal factors select
    /// constant-ratio mode.
    pub fn new(high_quality: bool, min_factor: f64, max_factor: f64) -> Result<Resampler> {
        let quality = if high_quality {
            ResampleQuality::Best
        } else {
            ResampleQuality::Medium
        };
        Resampler::with_quality(quality, min_factor, max_factor)
    }

    pub fn with_quality(
        quality: ResampleQuality,
        min_factor: f64,
        max_factor: f64,
    ) -> Result<Resampler> {
        let variable = min_factor != max_factor;
        let (quality, ratio, max_relative) = if variable {
            // Variable rate always runs at best quality.
            (ResampleQuality::Best, min_factor, (max_factor / min_factor).max(1.0))
        } else {
            (quality, min_factor, 1.0)
        };

        let inner = SincFixedIn::<f32>::new(
            ratio,
            max_relative,
            quality.parameters(),
            CHUNK_SIZE,
            1,
        )?;
        let out_scratch = vec![vec![0f32; inner.output_frames_max()]];
        let delay_remaining = inner.output_delay();

        Ok(Resampler {
            inner,
            variable,
            base_factor: ratio,
            min_factor,
            max_factor,
            in_fifo: Vec::new(),
            out_fifo: VecDeque::new(),
            out_scratch,
            delay_remaining,
            expected: 0.0,
            emitted: 0,
            finished_input: false,
        })
    }

    pub fn is_variable(&self) -> bool {
        self.variable
    }

    /// Feed `input` at the given ratio and write converted samples
    /// into `output`. Returns `(input_used, output_written)`.
    ///
    /// `last` marks end-of-input; from then on the internal state
    /// drains across calls until `output_written == 0`.
    pub fn process(
        &mut self,
        factor: f64,
        input: &[f32],
        last: bool,
        output: &mut [f32],
    ) -> Result<(usize, usize)> {
        let ratio = if self.variable {
            let clamped = factor.clamp(self.min_factor, self.max_factor);
            self.inner.set_resample_ratio(clamped, false)?;
            clamped
        } else {
            self.base_factor
        };

        let input_used = if self.finished_input {
            0
        } else {
            self.in_fifo.extend_from_slice(input);
            self.expected += input.len() as f64 * ratio;
            input.len()
        };

        // Run every complete chunk through the converter.
        while self.in_fifo.len() >= CHUNK_SIZE {
            let produced = {
                let chunk = [&self.in_fifo[..CHUNK_SIZE]];
                let (_, n) =
                    self.inner
                        .process_into_buffer(&chunk, &mut self.out_scratch, None)?;
                n
            };
            self.enqueue_output(produced);
            self.in_fifo.drain(..CHUNK_SIZE);
        }

        if last && !self.finished_input {
            self.finished_input = true;

            // Push the sub-chunk remainder, then flush the sinc tail
            // until the ideal output length is covered.
            if !self.in_fifo.is_empty() {
                let remainder = std::mem::take(&mut self.in_fifo);
                let chunk = [remainder.as_slice()];
                let (_, n) = self.inner.process_partial_into_buffer(
                    Some(&chunk),
                    &mut self.out_scratch,
                    None,
                )?;
                self.enqueue_output(n);
            }

            let cap = self.expected.round() as u64;
            while self.emitted + (self.out_fifo.len() as u64) < cap {
                let empty: Option<&[&[f32]]> = None;
                let (_, n) =
                    self.inner
                        .process_partial_into_buffer(empty, &mut self.out_scratch, None)?;
                if n == 0 {
                    break;
                }
                self.enqueue_output(n);
            }
            // Anything past the ideal length is resampler tail, not
            // signal.
            let keep = (cap - self.emitted.min(cap)) as usize;
            self.out_fifo.truncate(keep);
        }

        let written = self.pop_output(output);
        Ok((input_used, written))
    }

    fn enqueue_output(&mut self, produced: usize) {
        let frames = &self.out_scratch[0][..produced];
        let skip = self.delay_remaining.min(produced);
        self.delay_remaining -= skip;
        self.out_fifo.extend(&frames[skip..]);
    }

    fn pop_output(&mut self, output: &mut [f32]) -> usize {
        let n = output.len().min(self.out_fifo.len());
        for slot in output[..n].iter_mut() {
            *slot = self.out_fifo.pop_front().unwrap();
        }
        self.emitted += n as u64;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, freq: f64, rate: f64) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin() as f32)
            .collect()
    }

    fn drive(resampler: &mut Resampler, factor: f64, input: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        let mut buf = vec![0f32; 4096];
        let mut pos = 0;
        loop {
            let end = (pos + 1000).min(input.len());
            let last = end == input.len();
            let (used, written) = resampler
                .process(factor, &input[pos..end], last, &mut buf)
                .unwrap();
            pos += used;
            out.extend_from_slice(&buf[..written]);
            if last && written == 0 {
                break;
            }
        }
        out
    }

    #[test]
    fn test_constant_ratio_output_length() {
        let factor = 44100.0 / 48000.0;
        let mut rs = Resampler::new(true, factor, factor).unwrap();
        let input = sine(48000, 440.0, 48000.0);
        let out = drive(&mut rs, factor, &input);
        let expected = (48000.0 * factor).round() as i64;
        assert!(
            (out.len() as i64 - expected).abs() <= 1,
            "got {} expected {}",
            out.len(),
            expected
        );
    }

    #[test]
    fn test_upsample_output_length() {
        let factor = 48000.0 / 44100.0;
        let mut rs = Resampler::new(false, factor, factor).unwrap();
        let input = sine(22050, 1000.0, 44100.0);
        let out = drive(&mut rs, factor, &input);
        let expected = (22050.0 * factor).round() as i64;
        assert!((out.len() as i64 - expected).abs() <= 1);
    }

    #[test]
    fn test_preserves_dc_level() {
        let factor = 44100.0 / 48000.0;
        let mut rs = Resampler::new(true, factor, factor).unwrap();
        let input = vec![0.5f32; 20000];
        let out = drive(&mut rs, factor, &input);
        // Away from the edges the DC level must survive conversion.
        let mid = &out[1000..out.len() - 1000];
        for &s in mid {
            assert!((s - 0.5).abs() < 1e-3, "sample {s}");
        }
    }

    #[test]
    fn test_variable_mode_accepts_ratio_range() {
        let mut rs = Resampler::new(true, 0.5, 2.0).unwrap();
        assert!(rs.is_variable());
        let input = sine(8000, 220.0, 44100.0);
        let mut buf = vec![0f32; 8192];
        let (used, written) = rs.process(1.5, &input[..2048], false, &mut buf).unwrap();
        assert_eq!(used, 2048);
        assert!(written > 0);
        // out-of-range ratios clamp rather than fail
        let (used, _) = rs.process(5.0, &input[2048..4096], false, &mut buf).unwrap();
        assert_eq!(used, 2048);
    }

    #[test]
    fn test_drain_terminates() {
        let factor = 0.9;
        let mut rs = Resampler::new(true, factor, factor).unwrap();
        let input = vec![0.25f32; 3000];
        let mut buf = vec![0f32; 512];
        let (_, mut written) = rs.process(factor, &input, true, &mut buf).unwrap();
        let mut total = written;
        let mut rounds = 0;
        while written > 0 {
            let (used, w) = rs.process(factor, &[], true, &mut buf).unwrap();
            assert_eq!(used, 0);
            written = w;
            total += w;
            rounds += 1;
            assert!(rounds < 100, "drain did not terminate");
        }
        let expected = (3000.0 * factor).round() as i64;
        assert!((total as i64 - expected).abs() <= 1);
    }
}
