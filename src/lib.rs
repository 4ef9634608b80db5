//! # Strata - Non-destructive Audio Editing Engine
//!
//! A layered data model for audio editing: tracks hold clips, clips
//! pair a sequence of immutable content-addressed sample blocks with
//! a gain envelope, and a pull-based mixer renders any time range of
//! any set of tracks into an output buffer.
//!
//! ## Architecture
//!
//! Strata is an umbrella crate over the subsystem crates:
//! - **strata-core** - sample formats, error taxonomy, progress
//! - **strata-blocks** - block files, summaries, directory management
//! - **strata-sequence** - the block-sequence editor
//! - **strata-envelope** - piecewise linear/exponential automation
//! - **strata-track** - clips, tracks, read caching, time warping
//! - **strata-resample** - streaming sinc sample-rate conversion
//! - **strata-mix** - multi-track mixdown
//!
//! ## Quick start
//!
//! ```ignore
//! use strata::prelude::*;
//!
//! let dir = DirManager::temporary()?;
//! let mut tracks = Vec::new();
//! import_wav(&dir, "take.wav", &mut tracks, |_| true)?;
//!
//! // Cut two seconds out of the first track, remembering the audio
//! // as a cutline.
//! tracks[0].handle_clear(1.0, 3.0, true, false)?;
//!
//! let tracks: Vec<_> = tracks.into_iter().map(std::sync::Arc::new).collect();
//! export_wav(&tracks, "edited.wav", ExportSpec::default(), |_| true)?;
//! ```

mod import;
mod pipeline;

pub use import::{ImportHandle, ImportStatus};
pub use pipeline::{codec_lock, export_wav, import_wav, ExportSpec};

pub use strata_core::{
    f32_from_i16, f32_from_i24, i16_from_f32, i24_from_f32, samples_to_time,
    time_to_samples, Error, Progress, Result, SampleCount, SampleFormat,
};

pub use strata_blocks::{BlockFile, DirManager, SummaryInfo};
pub use strata_envelope::{EnvPoint, Envelope};
pub use strata_mix::{Mixer, MixerSpec};
pub use strata_resample::{ResampleQuality, Resampler};
pub use strata_sequence::{SeqBlock, Sequence, MAX_DISK_BLOCK_SIZE};
pub use strata_track::{
    Channel, IdentityTimeWarper, ShiftTimeWarper, TimeWarper, TrackCache, WaveClip,
    WaveTrack,
};

/// Everything most users need.
pub mod prelude {
    pub use crate::{
        export_wav, import_wav, Channel, DirManager, Envelope, ExportSpec, Mixer,
        MixerSpec, Progress, SampleFormat, Sequence, TrackCache, WaveClip, WaveTrack,
    };
}
