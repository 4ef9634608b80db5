//! Mixdown of wave tracks into an output buffer.
//!
//! The [`Mixer`] pulls samples per track through a [`TrackCache`],
//! resamples when the track rate differs from the output rate,
//! applies the track envelope as a gain trajectory, routes through
//! pan/gain (or an explicit [`MixerSpec`] matrix), and sums into
//! float accumulators that are finally converted to the requested
//! output format.

mod mixer;

pub use mixer::{Mixer, MixerSpec};
