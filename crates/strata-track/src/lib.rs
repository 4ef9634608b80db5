//! Clips and tracks: the editable timeline over block sequences.
//!
//! A [`WaveClip`] binds a sequence and an envelope at a floating
//! point time offset, buffers small appends, and owns "cutline"
//! child clips holding material removed with clear-and-remember. A
//! [`WaveTrack`] keeps non-overlapping clips on a shared time axis
//! and implements the high-level clear/paste/split/merge operations.
//! [`TrackCache`] serves contiguous sequential reads without
//! re-fetching.

mod cache;
mod clip;
mod track;
mod warp;

pub use cache::TrackCache;
pub use clip::WaveClip;
pub use track::{Channel, WaveTrack};
pub use warp::{IdentityTimeWarper, ShiftTimeWarper, TimeWarper};
