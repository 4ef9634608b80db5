//! Time and sample-index conversion.

/// Sample index or count. Signed so that positions can go negative
/// transiently during backwards mixing arithmetic.
pub type SampleCount = i64;

/// Convert a time in seconds to a sample index: `round(t * rate)`.
#[inline]
pub fn time_to_samples(t: f64, rate: u32) -> SampleCount {
    (t * rate as f64 + 0.5).floor() as SampleCount
}

/// Convert a sample index back to seconds.
#[inline]
pub fn samples_to_time(pos: SampleCount, rate: u32) -> f64 {
    pos as f64 / rate as f64
}
