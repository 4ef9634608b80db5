//! A track: ordered, non-overlapping clips on a shared time axis.

use std::sync::Arc;

use tracing::warn;

use strata_blocks::DirManager;
use strata_core::{
    samples_to_time, time_to_samples, Error, Result, SampleCount, SampleFormat,
};
use strata_sequence::Sequence;

use crate::clip::WaveClip;
use crate::warp::{IdentityTimeWarper, TimeWarper};

/// Channel designation used for routing in the absence of a mixer
/// matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channel {
    #[default]
    Mono,
    Left,
    Right,
}

/// A mono audio track holding [`WaveClip`]s.
///
/// Clips may be stored unsorted; the invariant is that they do not
/// overlap in time.
pub struct WaveTrack {
    dir: Arc<DirManager>,
    rate: u32,
    format: SampleFormat,
    gain: f32,
    pan: f32,
    channel: Channel,
    offset: f64,
    /// When set, clips ripple and pastes may push into occupied
    /// territory; the default matches a locked-down arrangement.
    edit_clip_can_move: bool,
    clips: Vec<WaveClip>,
}

impl WaveTrack {
    pub fn new(dir: Arc<DirManager>, format: SampleFormat, rate: u32) -> WaveTrack {
        WaveTrack {
            dir,
            rate,
            format,
            gain: 1.0,
            pan: 0.0,
            channel: Channel::Mono,
            offset: 0.0,
            edit_clip_can_move: false,
            clips: Vec::new(),
        }
    }

    /// Copy the track metadata and all clips.
    pub fn duplicate(&self) -> Result<WaveTrack> {
        let mut track = WaveTrack::new(Arc::clone(&self.dir), self.format, self.rate);
        track.gain = self.gain;
        track.pan = self.pan;
        track.channel = self.channel;
        track.offset = self.offset;
        for clip in &self.clips {
            track.clips.push(clip.duplicate(&self.dir, true)?);
        }
        Ok(track)
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate.max(1);
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.pan = pan.clamp(-1.0, 1.0);
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn set_channel(&mut self, channel: Channel) {
        self.channel = channel;
    }

    pub fn set_edit_clip_can_move(&mut self, value: bool) {
        self.edit_clip_can_move = value;
    }

    pub fn dir_manager(&self) -> &Arc<DirManager> {
        &self.dir
    }

    pub fn clips(&self) -> &[WaveClip] {
        &self.clips
    }

    pub fn clips_mut(&mut self) -> &mut Vec<WaveClip> {
        &mut self.clips
    }

    pub fn num_clips(&self) -> usize {
        self.clips.len()
    }

    pub fn time_to_samples(&self, t: f64) -> SampleCount {
        time_to_samples(t, self.rate)
    }

    pub fn samples_to_time(&self, pos: SampleCount) -> f64 {
        samples_to_time(pos, self.rate)
    }

    pub fn start_time(&self) -> f64 {
        self.clips
            .iter()
            .map(WaveClip::start_time)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    pub fn end_time(&self) -> f64 {
        self.clips
            .iter()
            .map(WaveClip::end_time)
            .reduce(f64::max)
            .unwrap_or(0.0)
    }

    /// Read a span that may cross clips and the gaps between them;
    /// gaps read as zero. Returns false (with a zero-filled or
    /// partially filled buffer) instead of an error when `may_throw`
    /// is off.
    pub fn get(&self, dst: &mut [f32], start: SampleCount, may_throw: bool) -> Result<bool> {
        let len = dst.len();
        // When the span is contained in a single clip there is
        // nothing to clear.
        let mut do_clear = true;
        let mut result = true;
        for clip in &self.clips {
            if start >= clip.start_sample()
                && start + len as SampleCount <= clip.end_sample()
            {
                do_clear = false;
                break;
            }
        }
        if do_clear {
            dst.fill(0.0);
        }

        for clip in &self.clips {
            let clip_start = clip.start_sample();
            let clip_end = clip.end_sample();

            if clip_end > start && clip_start < start + len as SampleCount {
                // Overlap of the clip with the requested span.
                let mut samples_to_copy =
                    (start + len as SampleCount - clip_start).min(clip.num_samples());
                let mut start_delta = clip_start - start;
                let mut inclip_delta = 0;
                if start_delta < 0 {
                    inclip_delta = -start_delta;
                    samples_to_copy -= inclip_delta;
                    start_delta = 0;
                }

                let at = start_delta as usize;
                let n = samples_to_copy as usize;
                if !clip.get_samples(&mut dst[at..at + n], inclip_delta, may_throw)? {
                    result = false;
                }
            }
        }
        Ok(result)
    }

    /// Write a span that may cross clips; samples outside any clip
    /// are dropped.
    pub fn set(&mut self, src: &[f32], start: SampleCount) -> Result<()> {
        let len = src.len();
        for clip in &mut self.clips {
            let clip_start = clip.start_sample();
            let clip_end = clip.end_sample();

            if clip_end > start && clip_start < start + len as SampleCount {
                let mut samples_to_copy =
                    (start + len as SampleCount - clip_start).min(clip.num_samples());
                let mut start_delta = clip_start - start;
                let mut inclip_delta = 0;
                if start_delta < 0 {
                    inclip_delta = -start_delta;
                    samples_to_copy -= inclip_delta;
                    start_delta = 0;
                }

                let at = start_delta as usize;
                let n = samples_to_copy as usize;
                clip.set_samples(Some(&src[at..at + n]), inclip_delta, samples_to_copy)?;
            }
        }
        Ok(())
    }

    /// Fill `buffer` with envelope gains for the span beginning at
    /// absolute time `t0`, one value per sample. Gaps between clips
    /// read as unity.
    pub fn get_envelope_values(&self, buffer: &mut [f64], t0: f64) {
        // Clips are not stored in time order, so the default has to
        // cover the whole span first and clip spans overwrite it.
        buffer.fill(1.0);

        let tstep = 1.0 / self.rate as f64;
        let end_time = t0 + tstep * buffer.len() as f64;
        for clip in &self.clips {
            let clip_start = clip.start_time();
            let clip_end = clip.end_time();
            if clip_start < end_time && clip_end > t0 {
                let mut at = 0usize;
                let mut rlen = buffer.len();
                let mut rt0 = t0;

                if rt0 < clip_start {
                    let diff = time_to_samples(clip_start - rt0, self.rate) as usize;
                    at += diff;
                    rlen = rlen.saturating_sub(diff);
                    rt0 = clip_start;
                }

                if rt0 + rlen as f64 * tstep > clip_end {
                    let clip_len = (clip.end_sample() - clip.start_sample()).max(0) as usize;
                    if clip_len == 0 {
                        return;
                    }
                    // Never increase rlen here.
                    rlen = rlen.min(clip_len);
                    rlen = rlen.min((0.5 + (clip_end - rt0) / tstep).floor() as usize);
                }
                clip.envelope().values(&mut buffer[at..at + rlen], rt0, tstep);
            }
        }
    }

    /// Gain for an output channel, combining pan and track gain.
    /// Even channels take the left gain, odd the right.
    pub fn channel_gain(&self, channel: usize) -> f32 {
        let mut left = 1.0;
        let mut right = 1.0;

        if self.pan < 0.0 {
            right = self.pan + 1.0;
        } else if self.pan > 0.0 {
            left = 1.0 - self.pan;
        }

        if channel % 2 == 0 {
            left * self.gain
        } else {
            right * self.gain
        }
    }

    /// Start of the block containing sample `s`, if any clip holds it.
    pub fn block_start(&self, s: SampleCount) -> Option<SampleCount> {
        for clip in &self.clips {
            let start_sample = clip.start_sample();
            let end_sample = start_sample + clip.num_samples();
            if s >= start_sample && s < end_sample {
                return Some(start_sample + clip.sequence().block_start(s - start_sample));
            }
        }
        None
    }

    /// A good chunk size for sequential reads at `s`.
    pub fn best_block_size(&self, s: SampleCount) -> usize {
        for clip in &self.clips {
            let start_sample = clip.start_sample();
            let end_sample = start_sample + clip.num_samples();
            if s >= start_sample && s < end_sample {
                return clip.sequence().best_block_size(s - start_sample);
            }
        }
        self.max_block_size()
    }

    pub fn max_block_size(&self) -> usize {
        let max = self
            .clips
            .iter()
            .map(|c| c.sequence().max_block_size())
            .max()
            .unwrap_or(0);
        if max > 0 {
            max
        } else {
            // No clips yet; a throwaway sequence knows the answer.
            Sequence::new(Arc::clone(&self.dir), self.format).max_block_size()
        }
    }

    /// Append to the rightmost clip, creating one if none exists.
    pub fn append(&mut self, buffer: &[f32]) -> Result<()> {
        self.rightmost_or_new_clip().append(buffer)
    }

    /// Flush the rightmost clip's append buffer.
    pub fn flush(&mut self) -> Result<()> {
        self.rightmost_or_new_clip().flush()
    }

    pub fn rightmost_or_new_clip(&mut self) -> &mut WaveClip {
        if self.clips.is_empty() {
            let mut clip = WaveClip::new(Arc::clone(&self.dir), self.format, self.rate);
            clip.set_offset(self.offset);
            self.clips.push(clip);
        }
        let mut rightmost = 0;
        let mut max_offset = self.clips[0].offset();
        for (i, clip) in self.clips.iter().enumerate().skip(1) {
            if clip.offset() > max_offset {
                max_offset = clip.offset();
                rightmost = i;
            }
        }
        &mut self.clips[rightmost]
    }

    pub fn create_clip(&mut self) -> &mut WaveClip {
        self.clips
            .push(WaveClip::new(Arc::clone(&self.dir), self.format, self.rate));
        self.clips.last_mut().unwrap()
    }

    /// Whether no clip overlaps `[t0, t1]`.
    pub fn is_empty(&self, t0: f64, t1: f64) -> bool {
        if t0 > t1 {
            return true;
        }
        !self
            .clips
            .iter()
            .any(|clip| !clip.before_clip(t1) && !clip.after_clip(t0))
    }

    /// Clip indices sorted by start time.
    pub fn sorted_clip_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.clips.len()).collect();
        indices.sort_by(|&a, &b| {
            self.clips[a]
                .start_time()
                .total_cmp(&self.clips[b].start_time())
        });
        indices
    }

    /// Remove `[t0, t1)` from every affected clip. Strong guarantee.
    ///
    /// Wholly covered clips are dropped. Partially covered clips are
    /// cleared on fresh copies; with `split`, a middle deletion
    /// produces separate left and right clips (the right one shifted
    /// left); with `add_cut_lines`, the removed audio is remembered
    /// on the clip, provided the region touches the interior of a
    /// single clip only.
    pub fn handle_clear(
        &mut self,
        t0: f64,
        t1: f64,
        mut add_cut_lines: bool,
        split: bool,
    ) -> Result<()> {
        if t1 < t0 {
            return Err(Error::inconsistency("handle_clear range"));
        }

        // Cut lines only when deleting in the middle of a single
        // clip; the cutline machinery is not prepared for more.
        if add_cut_lines {
            for clip in &self.clips {
                if !clip.before_clip(t1)
                    && !clip.after_clip(t0)
                    && (clip.before_clip(t0) || clip.after_clip(t1))
                {
                    add_cut_lines = false;
                    break;
                }
            }
        }

        let mut to_delete: Vec<usize> = Vec::new();
        let mut to_add: Vec<WaveClip> = Vec::new();

        for (i, clip) in self.clips.iter().enumerate() {
            if clip.before_clip(t0) && clip.after_clip(t1) {
                // Whole clip is deleted.
                to_delete.push(i);
            } else if !clip.before_clip(t1) && !clip.after_clip(t0) {
                // Clip data is affected. Never modify in place: the
                // strong guarantee must hold even when a later clip's
                // edit fails.
                if add_cut_lines {
                    to_delete.push(i);
                    let mut replacement = clip.duplicate(&self.dir, true)?;
                    replacement.clear_and_add_cut_line(t0, t1)?;
                    to_add.push(replacement);
                } else if split {
                    if clip.before_clip(t0) {
                        // Deletion from the left edge.
                        to_delete.push(i);
                        let mut replacement = clip.duplicate(&self.dir, true)?;
                        replacement.clear(clip.start_time(), t1)?;
                        replacement.shift(t1 - clip.start_time());
                        to_add.push(replacement);
                    } else if clip.after_clip(t1) {
                        // Deletion to the right edge.
                        to_delete.push(i);
                        let mut replacement = clip.duplicate(&self.dir, true)?;
                        replacement.clear(t0, clip.end_time())?;
                        to_add.push(replacement);
                    } else {
                        // Deletion in the middle: left and right
                        // halves become separate clips.
                        let mut left = clip.duplicate(&self.dir, true)?;
                        left.clear(t0, clip.end_time())?;
                        to_add.push(left);

                        let mut right = clip.duplicate(&self.dir, true)?;
                        right.clear(clip.start_time(), t1)?;
                        right.shift(t1 - clip.start_time());
                        to_add.push(right);

                        to_delete.push(i);
                    }
                } else {
                    to_delete.push(i);
                    let mut replacement = clip.duplicate(&self.dir, true)?;
                    // keeps envelope points < t0 and >= t1
                    replacement.clear(t0, t1)?;
                    to_add.push(replacement);
                }
            }
        }

        // Only now change this track; none of the rest fails.

        if self.edit_clip_can_move && !split {
            for clip in &mut self.clips {
                if clip.before_clip(t1) {
                    // Clip is past the region: ripple it left.
                    clip.shift(-(t1 - t0));
                }
            }
        }

        for &i in to_delete.iter().rev() {
            self.clips.remove(i);
        }
        self.clips.extend(to_add);
        Ok(())
    }

    /// Paste a track's clips at `t0`.
    ///
    /// A single-clip source landing inside an existing clip splices
    /// into it without creating a new clip. Otherwise each source
    /// clip is inserted as a new clip at `t0 + its offset`; pasting
    /// into occupied territory is an inconsistency.
    pub fn paste(&mut self, t0: f64, other: &WaveTrack) -> Result<()> {
        if other.clips.is_empty() {
            return Ok(());
        }

        let single_clip_mode = other.clips.len() == 1 && other.start_time() == 0.0;

        let insert_duration = other.end_time();
        if insert_duration != 0.0 && insert_duration < 1.0 / self.rate as f64 {
            // Shorter than one sample; nothing sensible to insert
            // (but zero-length sources remain no-ops rather than
            // errors).
            return Ok(());
        }

        if single_clip_mode {
            let mut inside: Option<usize> = None;
            for (i, clip) in self.clips.iter().enumerate() {
                // Also allow prepending exactly at a clip start.
                if clip.within_clip(t0) || self.time_to_samples(t0) == clip.start_sample() {
                    inside = Some(i);
                    break;
                }
            }

            if let Some(i) = inside {
                let inside_start = self.clips[i].start_time();
                let inside_end = self.clips[i].end_time();
                for clip in &self.clips {
                    if clip.start_time() > inside_start
                        && inside_end + insert_duration > clip.start_time()
                    {
                        warn!("paste would overlap the next clip");
                        return Err(Error::inconsistency("paste into occupied space"));
                    }
                }
                return self.clips[i].paste(t0, &other.clips[0]);
            }
            // No clip here; fall through and insert a new one.
        }

        if !self.edit_clip_can_move
            && !self.is_empty(t0, t0 + insert_duration - 1.0 / self.rate as f64)
        {
            warn!("paste would overlap existing clips");
            return Err(Error::inconsistency("paste into occupied space"));
        }

        for clip in &other.clips {
            if !clip.is_placeholder() {
                let mut new_clip = clip.duplicate(&self.dir, true)?;
                new_clip.resample(self.rate)?;
                new_clip.shift(t0);
                self.clips.push(new_clip);
            }
        }
        Ok(())
    }

    /// Append clip `clip2` onto `clip1` and drop `clip2`. Strong
    /// guarantee.
    pub fn merge_clips(&mut self, clip1: usize, clip2: usize) -> Result<()> {
        if clip1 == clip2 || clip1 >= self.clips.len() || clip2 >= self.clips.len() {
            // Could happen when one track of a linked pair had a
            // split and the other did not; do nothing.
            return Ok(());
        }

        let removed = self.clips.remove(clip2);
        let dest = if clip2 < clip1 { clip1 - 1 } else { clip1 };
        let end = self.clips[dest].end_time();
        if let Err(e) = self.clips[dest].paste(end, &removed) {
            self.clips.insert(clip2.min(self.clips.len()), removed);
            return Err(e);
        }
        Ok(())
    }

    /// Split the clip containing `t` into two, snapping `t` onto the
    /// sample grid.
    pub fn split_at(&mut self, t: f64) -> Result<()> {
        for i in 0..self.clips.len() {
            if self.clips[i].within_clip(t) {
                let t = self.samples_to_time(self.time_to_samples(t));
                let mut right = self.clips[i].duplicate(&self.dir, true)?;

                let clip = &mut self.clips[i];
                let clip_start = clip.start_time();
                let clip_end = clip.end_time();
                clip.clear(t, clip_end)?;
                right.clear(clip_start, t)?;
                // right is still anchored at the old clip start;
                // advance it to the split point.
                let here = time_to_samples(t - clip_start, self.rate);
                right.shift(samples_to_time(here, self.rate));

                self.clips.push(right);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Clear `[t0, t1)` then paste `src` at `t0`, optionally merging
    /// seams at the paste boundaries and reinserting preserved
    /// splits and cutlines (their positions run through `warper`).
    ///
    /// The track remains usable on error, but some of its cutline
    /// clips may already have moved.
    pub fn clear_and_paste(
        &mut self,
        t0: f64,
        t1: f64,
        src: &WaveTrack,
        preserve: bool,
        merge: bool,
        warper: Option<&dyn TimeWarper>,
    ) -> Result<()> {
        let dur = (t1 - t0).min(src.end_time());
        if dur == 0.0 {
            // Zero duration: just a plain paste.
            return self.paste(t0, src);
        }

        let identity = IdentityTimeWarper;
        let warper = warper.unwrap_or(&identity);

        // Align to samples.
        let t0 = self.samples_to_time(self.time_to_samples(t0));
        let t1 = self.samples_to_time(self.time_to_samples(t1));

        // Save clip boundaries and cutlines in range whether
        // preserving or not: merging needs to know when a boundary is
        // crossed.
        let mut splits: Vec<f64> = Vec::new();
        let mut cuts: Vec<WaveClip> = Vec::new();
        let rate = self.rate;
        for clip in &mut self.clips {
            for boundary in [clip.start_time(), clip.end_time()] {
                let st = samples_to_time(time_to_samples(boundary, rate), rate);
                if st >= t0 && st <= t1 && !splits.contains(&st) {
                    splits.push(st);
                }
            }

            let clip_offset = clip.offset();
            let cutlines = clip.cut_lines_mut();
            let mut i = 0;
            while i < cutlines.len() {
                let position = clip_offset + cutlines[i].offset();
                let cs = samples_to_time(time_to_samples(position, rate), rate);
                if cs >= t0 && cs <= t1 {
                    // Remember the absolute position.
                    let mut cut = cutlines.remove(i);
                    cut.set_offset(cs);
                    cuts.push(cut);
                } else {
                    i += 1;
                }
            }
        }

        let tolerance = 2.0 / self.rate as f64;

        self.handle_clear(t0, t1, false, false)?;
        self.paste(t0, src)?;

        // Merge the new clip(s) in with the existing ones at the end
        // of the pasted region.
        if merge && !splits.is_empty() {
            let paste_end = t0 + src.end_time();
            let order = self.sorted_clip_indices();
            let mut prev: Option<usize> = None;
            for &ci in &order {
                if (paste_end - self.clips[ci].start_time()).abs() < tolerance {
                    if let Some(p) = prev {
                        self.merge_clips(p, ci)?;
                    }
                    break;
                }
                prev = Some(ci);
            }
        }

        // And at the start of the pasted region.
        {
            let order = self.sorted_clip_indices();
            let mut prev: Option<usize> = None;
            for &ci in &order {
                if let Some(p) = prev {
                    // ci is what was pasted and it begins where the
                    // previous clip ends.
                    self.merge_clips(p, ci)?;
                    break;
                }
                if (t0 - self.clips[ci].end_time()).abs() < tolerance {
                    prev = Some(ci);
                } else {
                    prev = None;
                }
            }
        }

        if preserve {
            // Restore the split lines, warping positions as needed.
            for &split in &splits {
                self.split_at(warper.warp(split))?;
            }

            // Restore the saved cutlines into whichever clip now
            // covers their position.
            for clip in &mut self.clips {
                let st = clip.start_time();
                let et = clip.end_time();
                let mut i = 0;
                while i < cuts.len() {
                    let cs = cuts[i].offset();
                    if cs >= st && cs <= et {
                        let mut cut = cuts.remove(i);
                        cut.set_offset(warper.warp(cs) - st);
                        clip.cut_lines_mut().push(cut);
                    } else {
                        i += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(rate: u32) -> (tempfile::TempDir, WaveTrack) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DirManager::new(tmp.path());
        (tmp, WaveTrack::new(dir, SampleFormat::Float, rate))
    }

    fn filled_track(rate: u32, value: f32, seconds: f64) -> (tempfile::TempDir, WaveTrack) {
        let (tmp, mut t) = track(rate);
        let len = (seconds * rate as f64).round() as usize;
        t.append(&vec![value; len]).unwrap();
        t.flush().unwrap();
        (tmp, t)
    }

    fn read(t: &WaveTrack, start: SampleCount, len: usize) -> Vec<f32> {
        let mut out = vec![0f32; len];
        t.get(&mut out, start, true).unwrap();
        out
    }

    #[test]
    fn test_append_flush_get() {
        let (_tmp, t) = filled_track(1000, 0.5, 2.0);
        assert_eq!(t.num_clips(), 1);
        assert!((t.end_time() - 2.0).abs() < 1e-9);
        let out = read(&t, 0, 2000);
        assert!(out.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_get_fills_gaps_with_zero() {
        let (_tmp, mut t) = track(1000);
        t.append(&[0.5; 1000]).unwrap();
        t.flush().unwrap();
        t.clips_mut()[0].set_offset(1.0);

        let out = read(&t, 0, 3000);
        assert!(out[..1000].iter().all(|&s| s == 0.0));
        assert!(out[1000..2000].iter().all(|&s| s == 0.5));
        assert!(out[2000..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_handle_clear_whole_and_partial() {
        let (_tmp, mut t) = filled_track(1000, 0.5, 3.0);
        t.handle_clear(1.0, 2.0, false, false).unwrap();
        assert_eq!(t.num_clips(), 1);
        assert_eq!(t.clips()[0].num_samples(), 2000);
    }

    #[test]
    fn test_handle_clear_split_produces_two_clips() {
        let (_tmp, mut t) = filled_track(1000, 0.5, 3.0);
        t.handle_clear(1.0, 2.0, false, true).unwrap();
        assert_eq!(t.num_clips(), 2);

        let order = t.sorted_clip_indices();
        let left = &t.clips()[order[0]];
        let right = &t.clips()[order[1]];
        assert!((left.start_time() - 0.0).abs() < 1e-9);
        assert_eq!(left.num_samples(), 1000);
        assert!((right.start_time() - 2.0).abs() < 1e-9);
        assert_eq!(right.num_samples(), 1000);
    }

    #[test]
    fn test_handle_clear_cutlines_interior_only() {
        let (_tmp, mut t) = filled_track(1000, 0.5, 3.0);
        t.handle_clear(1.0, 2.0, true, false).unwrap();
        assert_eq!(t.num_clips(), 1);
        let clip = &t.clips()[0];
        assert_eq!(clip.num_samples(), 2000);
        assert_eq!(clip.cut_lines().len(), 1);
        assert!((clip.cut_lines()[0].offset() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_handle_clear_drops_contained_clip() {
        let (_tmp, mut t) = track(1000);
        t.append(&[0.5; 500]).unwrap();
        t.flush().unwrap();
        t.clips_mut()[0].set_offset(1.0);
        t.handle_clear(0.5, 2.0, false, false).unwrap();
        assert_eq!(t.num_clips(), 0);
    }

    #[test]
    fn test_paste_into_clip_splices() {
        let (_tmp, mut t) = filled_track(1000, 0.25, 2.0);
        let (_tmp2, src) = filled_track(1000, 0.75, 0.5);

        t.paste(1.0, &src).unwrap();
        assert_eq!(t.num_clips(), 1);
        assert_eq!(t.clips()[0].num_samples(), 2500);
        let out = read(&t, 0, 2500);
        assert!(out[1000..1500].iter().all(|&s| s == 0.75));
    }

    #[test]
    fn test_paste_outside_clips_inserts() {
        let (_tmp, mut t) = filled_track(1000, 0.25, 1.0);
        let (_tmp2, src) = filled_track(1000, 0.75, 0.5);

        t.paste(2.0, &src).unwrap();
        assert_eq!(t.num_clips(), 2);
        let order = t.sorted_clip_indices();
        assert!((t.clips()[order[1]].start_time() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_paste_overlap_is_inconsistency() {
        let (_tmp, mut t) = filled_track(1000, 0.25, 2.0);
        // two clips in the source defeat single-clip splicing
        let (_tmp2, mut src) = filled_track(1000, 0.75, 0.5);
        let second = {
            let dir = Arc::clone(src.dir_manager());
            let mut c = WaveClip::new(dir, SampleFormat::Float, 1000);
            c.append(&[0.5; 100]).unwrap();
            c.flush().unwrap();
            c.set_offset(1.0);
            c
        };
        src.clips_mut().push(second);

        assert!(t.paste(0.5, &src).is_err());
    }

    #[test]
    fn test_split_at() {
        let (_tmp, mut t) = filled_track(1000, 0.5, 2.0);
        t.split_at(0.75).unwrap();
        assert_eq!(t.num_clips(), 2);
        let order = t.sorted_clip_indices();
        assert_eq!(t.clips()[order[0]].num_samples(), 750);
        assert_eq!(t.clips()[order[1]].num_samples(), 1250);
        assert!((t.clips()[order[1]].start_time() - 0.75).abs() < 1e-9);

        // audio is unchanged across the split
        let out = read(&t, 0, 2000);
        assert!(out.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_merge_clips() {
        let (_tmp, mut t) = filled_track(1000, 0.5, 2.0);
        t.split_at(1.0).unwrap();
        assert_eq!(t.num_clips(), 2);
        let order = t.sorted_clip_indices();
        t.merge_clips(order[0], order[1]).unwrap();
        assert_eq!(t.num_clips(), 1);
        assert_eq!(t.clips()[0].num_samples(), 2000);
    }

    #[test]
    fn test_clear_and_paste_merges_seams() {
        let (_tmp, mut t) = filled_track(1000, 0.25, 3.0);
        let (_tmp2, src) = filled_track(1000, 0.75, 1.0);

        t.clear_and_paste(1.0, 2.0, &src, false, true, None).unwrap();
        assert_eq!(t.num_clips(), 1);
        assert_eq!(t.clips()[0].num_samples(), 3000);
        let out = read(&t, 0, 3000);
        assert!(out[..1000].iter().all(|&s| s == 0.25));
        assert!(out[1000..2000].iter().all(|&s| s == 0.75));
        assert!(out[2000..].iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_clear_and_paste_preserves_splits() {
        let (_tmp, mut t) = filled_track(1000, 0.25, 3.0);
        t.split_at(1.5).unwrap();
        assert_eq!(t.num_clips(), 2);

        let (_tmp2, src) = filled_track(1000, 0.75, 2.0);
        t.clear_and_paste(0.5, 2.5, &src, true, true, None).unwrap();

        // the split at 1.5 was restored
        assert!(t
            .clips()
            .iter()
            .any(|c| (c.start_time() - 1.5).abs() < 1e-6 || (c.end_time() - 1.5).abs() < 1e-6));
    }

    #[test]
    fn test_envelope_values_across_clips() {
        let (_tmp, mut t) = filled_track(1000, 0.5, 1.0);
        {
            let clip = &mut t.clips_mut()[0];
            let len = clip.envelope().track_len();
            clip.envelope_mut().insert_or_replace(0.0, 0.5);
            clip.envelope_mut().insert_or_replace(len, 0.5);
        }

        let mut values = vec![0.0; 2000];
        t.get_envelope_values(&mut values, 0.0);
        assert!((values[500] - 0.5).abs() < 1e-6);
        // past the clip, unity
        assert!((values[1500] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_channel_gain_pan() {
        let (_tmp, mut t) = track(44100);
        t.set_gain(0.8);
        t.set_pan(1.0);
        assert!((t.channel_gain(0) - 0.0).abs() < 1e-6);
        assert!((t.channel_gain(1) - 0.8).abs() < 1e-6);

        t.set_pan(-0.5);
        assert!((t.channel_gain(0) - 0.8).abs() < 1e-6);
        assert!((t.channel_gain(1) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_is_empty() {
        let (_tmp, mut t) = track(1000);
        assert!(t.is_empty(0.0, 10.0));
        t.append(&[0.5; 1000]).unwrap();
        t.flush().unwrap();
        assert!(!t.is_empty(0.5, 1.5));
        assert!(t.is_empty(1.5, 2.0));
    }
}
