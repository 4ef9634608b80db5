//! A sequence plus an envelope at a time offset.

use std::sync::Arc;

use strata_blocks::DirManager;
use strata_core::{
    samples_to_time, time_to_samples, Error, Result, SampleCount, SampleFormat,
};
use strata_envelope::Envelope;
use strata_resample::Resampler;
use strata_sequence::Sequence;

// Chunking for whole-clip resampling.
const RESAMPLE_BUFSIZE: usize = 65536;

/// One contiguous piece of audio on a track.
///
/// Owns a [`Sequence`] of sample blocks and a gain [`Envelope`] whose
/// domain tracks the sequence length, both anchored at `offset`
/// seconds of absolute time. Small appends gather in a memory buffer
/// until a block's worth is ready. Cutlines are child clips holding
/// audio removed by [`WaveClip::clear_and_add_cut_line`], each kept
/// at its original clip-relative offset.
pub struct WaveClip {
    offset: f64,
    rate: u32,
    sequence: Sequence,
    envelope: Envelope,
    append_buffer: Vec<f32>,
    cut_lines: Vec<WaveClip>,
    is_placeholder: bool,
}

impl WaveClip {
    pub fn new(dir: Arc<DirManager>, format: SampleFormat, rate: u32) -> WaveClip {
        WaveClip {
            offset: 0.0,
            rate,
            sequence: Sequence::new(dir, format),
            envelope: Envelope::new(true, 1e-7, 2.0, 1.0),
            append_buffer: Vec::new(),
            cut_lines: Vec::new(),
            is_placeholder: false,
        }
    }

    /// Full copy, possibly into another project's manager.
    pub fn duplicate(&self, dir: &Arc<DirManager>, copy_cutlines: bool) -> Result<WaveClip> {
        let mut clip = WaveClip {
            offset: self.offset,
            rate: self.rate,
            sequence: self.sequence.duplicate(dir)?,
            envelope: self.envelope.clone(),
            append_buffer: Vec::new(),
            cut_lines: Vec::new(),
            is_placeholder: self.is_placeholder,
        };
        if copy_cutlines {
            for cutline in &self.cut_lines {
                clip.cut_lines.push(cutline.duplicate(dir, true)?);
            }
        }
        Ok(clip)
    }

    /// Copy only the range `[t0, t1]` (absolute times), with the
    /// cutlines whose positions fall inside it.
    pub fn copy_range(
        &self,
        dir: &Arc<DirManager>,
        copy_cutlines: bool,
        t0: f64,
        t1: f64,
    ) -> Result<WaveClip> {
        let s0 = self.time_to_samples_clip(t0);
        let s1 = self.time_to_samples_clip(t1);

        let mut clip = WaveClip {
            offset: self.offset,
            rate: self.rate,
            sequence: self.sequence.copy(s0, s1)?,
            envelope: Envelope::from_range(
                &self.envelope,
                self.offset + s0 as f64 / self.rate as f64,
                self.offset + s1 as f64 / self.rate as f64,
            ),
            append_buffer: Vec::new(),
            cut_lines: Vec::new(),
            is_placeholder: false,
        };

        if copy_cutlines {
            for cutline in &self.cut_lines {
                let position = self.offset + cutline.offset();
                if position >= t0 && position <= t1 {
                    let mut copy = cutline.duplicate(dir, true)?;
                    copy.set_offset(position - t0);
                    clip.cut_lines.push(copy);
                }
            }
        }
        Ok(clip)
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Change the nominal rate without touching samples; envelope
    /// times rescale to the new duration.
    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate;
        let new_len = self.sequence.num_samples() as f64 / rate as f64;
        self.envelope.rescale_times(new_len);
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
        self.envelope.set_offset(offset);
    }

    /// Move the clip by `delta` seconds.
    pub fn shift(&mut self, delta: f64) {
        self.set_offset(self.offset + delta);
    }

    pub fn is_placeholder(&self) -> bool {
        self.is_placeholder
    }

    pub fn set_placeholder(&mut self, value: bool) {
        self.is_placeholder = value;
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    pub fn cut_lines(&self) -> &[WaveClip] {
        &self.cut_lines
    }

    pub fn cut_lines_mut(&mut self) -> &mut Vec<WaveClip> {
        &mut self.cut_lines
    }

    /// The minimum time of the clip; not clipped to zero.
    pub fn start_time(&self) -> f64 {
        self.offset
    }

    /// One past the last sample, counting unflushed appends.
    pub fn end_time(&self) -> f64 {
        let samples = self.sequence.num_samples() + self.append_buffer.len() as SampleCount;
        self.offset + samples as f64 / self.rate as f64
    }

    pub fn start_sample(&self) -> SampleCount {
        time_to_samples(self.offset, self.rate)
    }

    pub fn end_sample(&self) -> SampleCount {
        self.start_sample() + self.sequence.num_samples()
    }

    pub fn num_samples(&self) -> SampleCount {
        self.sequence.num_samples()
    }

    /// Absolute time to a clip-relative sample index, clamped to the
    /// sequence bounds.
    pub fn time_to_samples_clip(&self, t: f64) -> SampleCount {
        if t < self.offset {
            0
        } else if t > self.offset + self.sequence.num_samples() as f64 / self.rate as f64 {
            self.sequence.num_samples()
        } else {
            time_to_samples(t - self.offset, self.rate)
        }
    }

    pub fn within_clip(&self, t: f64) -> bool {
        let ts = time_to_samples(t, self.rate);
        ts > self.start_sample()
            && ts < self.end_sample() + self.append_buffer.len() as SampleCount
    }

    /// Whether `t` is earlier than all of this clip.
    pub fn before_clip(&self, t: f64) -> bool {
        let ts = time_to_samples(t, self.rate);
        ts <= self.start_sample()
    }

    /// Whether `t` is later than all of this clip.
    pub fn after_clip(&self, t: f64) -> bool {
        let ts = time_to_samples(t, self.rate);
        ts >= self.end_sample() + self.append_buffer.len() as SampleCount
    }

    pub fn get_samples(
        &self,
        dst: &mut [f32],
        start: SampleCount,
        may_throw: bool,
    ) -> Result<bool> {
        self.sequence.get(dst, start, may_throw)
    }

    pub fn set_samples(
        &mut self,
        src: Option<&[f32]>,
        start: SampleCount,
        len: SampleCount,
    ) -> Result<()> {
        self.sequence.set_samples(src, start, len)
    }

    /// Buffered append. Small writes gather in memory and flush into
    /// the sequence a block at a time.
    ///
    /// In case of failure some prefix of the buffer may have been
    /// appended; nothing already flushed is lost.
    pub fn append(&mut self, mut buffer: &[f32]) -> Result<()> {
        let max_block = self.sequence.max_block_size();
        let mut block_size = self.sequence.ideal_append_len();

        let result = (|| {
            loop {
                if self.append_buffer.len() >= block_size {
                    // Flush some previously appended contents.
                    self.sequence.append(&self.append_buffer[..block_size])?;
                    self.append_buffer.drain(..block_size);
                    block_size = self.sequence.ideal_append_len();
                }

                if buffer.is_empty() {
                    break;
                }

                debug_assert!(self.append_buffer.len() <= max_block);
                let to_copy = buffer.len().min(max_block - self.append_buffer.len());
                self.append_buffer.extend_from_slice(&buffer[..to_copy]);
                buffer = &buffer[to_copy..];
            }
            Ok(())
        })();

        // Track length follows every append, error or not.
        self.update_envelope_track_len();
        result
    }

    /// Drain the append buffer into the sequence. The buffer is reset
    /// even if the flush fails, so the clip ends up flushed either
    /// way; on failure some earlier portion may still have landed.
    pub fn flush(&mut self) -> Result<()> {
        if self.append_buffer.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut self.append_buffer);
        let result = self.sequence.append(&pending);
        self.update_envelope_track_len();
        result
    }

    fn update_envelope_track_len(&mut self) {
        self.envelope.set_track_len(
            self.sequence.num_samples() as f64 / self.rate as f64,
            1.0 / self.rate as f64,
        );
    }

    /// Remove `[t0, t1)`, collapsing the envelope to match and
    /// dropping cutlines inside the range. Cutlines after the range
    /// shift left. Strong guarantee.
    pub fn clear(&mut self, t0: f64, t1: f64) -> Result<()> {
        let s0 = self.time_to_samples_clip(t0);
        let s1 = self.time_to_samples_clip(t1);

        self.sequence.delete(s0, s1 - s0)?;

        // Nothing below fails.
        let clip_t0 = t0.max(self.start_time());
        let clip_t1 = t1.min(self.end_time());

        let offset = self.offset;
        self.cut_lines.retain_mut(|cutline| {
            let position = offset + cutline.offset;
            if position >= t0 && position <= t1 {
                false
            } else {
                if position >= t1 {
                    cutline.shift(clip_t0 - clip_t1);
                }
                true
            }
        });

        let sample_time = 1.0 / self.rate as f64;
        self.envelope.collapse_region(t0, t1, sample_time);
        if t0 < self.start_time() {
            let delta = self.start_time() - t0;
            self.shift(-delta);
        }
        Ok(())
    }

    /// Like [`clear`], but the removed material (and the cutlines in
    /// range) survive as a new cutline anchored at `t0`.
    ///
    /// The clip stays usable on error, but some cutlines may already
    /// have been dropped.
    pub fn clear_and_add_cut_line(&mut self, t0: f64, t1: f64) -> Result<()> {
        if t0 > self.end_time() || t1 < self.start_time() {
            return Ok(()); // time out of bounds
        }

        let clip_t0 = t0.max(self.start_time());
        let clip_t1 = t1.min(self.end_time());

        let dir = Arc::clone(self.sequence.dir_manager());
        let mut new_clip = self.copy_range(&dir, true, clip_t0, clip_t1)?;
        new_clip.set_offset(clip_t0 - self.offset);

        // Remove cutlines that were in the selection, shift left
        // those after it.
        let offset = self.offset;
        self.cut_lines.retain_mut(|cutline| {
            let position = offset + cutline.offset;
            if position >= t0 && position <= t1 {
                false
            } else {
                if position >= t1 {
                    cutline.shift(clip_t0 - clip_t1);
                }
                true
            }
        });

        let s0 = self.time_to_samples_clip(t0);
        let s1 = self.time_to_samples_clip(t1);
        self.sequence.delete(s0, s1 - s0)?;

        let sample_time = 1.0 / self.rate as f64;
        self.envelope.collapse_region(t0, t1, sample_time);
        if t0 < self.start_time() {
            let delta = self.start_time() - t0;
            self.shift(-delta);
        }

        self.cut_lines.push(new_clip);
        Ok(())
    }

    /// Find a cutline at time `t` (within one sample) and splice its
    /// contents back in at its position. Returns whether one was
    /// found.
    pub fn expand_cut_line(&mut self, t: f64) -> Result<bool> {
        let tolerance = 1.0 / self.rate as f64;
        let position = self
            .cut_lines
            .iter()
            .position(|c| (self.offset + c.offset - t).abs() < tolerance);
        let Some(index) = position else {
            return Ok(false);
        };

        let cutline = self.cut_lines.remove(index);
        let at = self.offset + cutline.offset;
        match self.paste(at, &cutline) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.cut_lines.insert(index, cutline);
                Err(e)
            }
        }
    }

    /// Insert a copy of `other` at absolute time `t0`, resampling
    /// and/or converting formats first when they differ. The
    /// envelope is pasted in parallel coordinates and `other`'s
    /// cutlines come along, offset to their new positions. Strong
    /// guarantee.
    pub fn paste(&mut self, t0: f64, other: &WaveClip) -> Result<()> {
        let needs_resampling = other.rate != self.rate;
        let needs_new_format = other.sequence.format() != self.sequence.format();

        let converted;
        let pasted: &WaveClip = if needs_resampling || needs_new_format {
            let mut clip = other.duplicate(self.sequence.dir_manager(), true)?;
            if needs_resampling {
                clip.resample(self.rate)?;
            }
            if needs_new_format {
                clip.convert_to_sample_format(self.sequence.format())?;
            }
            converted = clip;
            &converted
        } else {
            other
        };

        // Cutlines contained in the pasted clip. Cutlines of
        // cutlines copy recursively and need no offset adjustment.
        let mut new_cutlines = Vec::with_capacity(pasted.cut_lines.len());
        for cutline in &pasted.cut_lines {
            let mut copy = cutline.duplicate(self.sequence.dir_manager(), true)?;
            copy.shift(t0 - self.offset);
            new_cutlines.push(copy);
        }

        let s0 = self.time_to_samples_clip(t0);
        self.sequence.paste(s0, &pasted.sequence)?;

        // Nothing below fails.
        // The pasted envelope is re-anchored at zero so the space it
        // opens matches the samples just inserted, wherever the
        // source clip sat on its own timeline.
        let mut pasted_envelope = pasted.envelope.clone();
        pasted_envelope.set_offset(0.0);
        let sample_time = 1.0 / self.rate as f64;
        self.envelope.paste(
            s0 as f64 / self.rate as f64 + self.offset,
            &pasted_envelope,
            sample_time,
        );
        self.offset_cut_lines(t0, pasted.end_time() - pasted.start_time());
        self.cut_lines.append(&mut new_cutlines);
        Ok(())
    }

    /// Shift right by `len` every cutline at or after `t0`.
    pub fn offset_cut_lines(&mut self, t0: f64, len: f64) {
        let offset = self.offset;
        for cutline in &mut self.cut_lines {
            if offset + cutline.offset >= t0 {
                cutline.shift(len);
            }
        }
    }

    /// Rebuild the whole sequence at a new rate through the sinc
    /// resampler. Strong guarantee. Cutlines are left alone; they get
    /// resampled as needed when they are expanded.
    pub fn resample(&mut self, rate: u32) -> Result<()> {
        if rate == self.rate {
            return Ok(());
        }

        let factor = rate as f64 / self.rate as f64;
        let mut resampler = Resampler::new(true, factor, factor)
            .map_err(|_| Error::inconsistency("resampler construction"))?;

        let mut in_buffer = vec![0f32; RESAMPLE_BUFSIZE];
        let mut out_buffer = vec![0f32; RESAMPLE_BUFSIZE];
        let mut pos: SampleCount = 0;
        let num_samples = self.sequence.num_samples();

        let mut new_sequence = Sequence::new(
            Arc::clone(self.sequence.dir_manager()),
            self.sequence.format(),
        );

        // Keep going while there is input to feed OR the resampler
        // still spews output, which continues for a few iterations
        // after the input runs dry.
        let mut out_generated = 0usize;
        while pos < num_samples || out_generated > 0 {
            let in_len = (RESAMPLE_BUFSIZE as SampleCount).min(num_samples - pos) as usize;
            let is_last = pos + in_len as SampleCount == num_samples;

            self.sequence.get(&mut in_buffer[..in_len], pos, true)?;

            let (input_used, generated) = resampler
                .process(factor, &in_buffer[..in_len], is_last, &mut out_buffer)
                .map_err(|_| Error::inconsistency("resample processing"))?;
            out_generated = generated;
            pos += input_used as SampleCount;

            new_sequence.append(&out_buffer[..generated])?;
        }

        self.sequence = new_sequence;
        self.rate = rate;
        self.update_envelope_track_len();
        Ok(())
    }

    pub fn convert_to_sample_format(&mut self, format: SampleFormat) -> Result<bool> {
        self.sequence.convert_to_sample_format(format)
    }

    /// Snap a time onto this clip's sample grid.
    pub fn snap_to_sample(&self, t: f64) -> f64 {
        samples_to_time(time_to_samples(t, self.rate), self.rate)
    }
}
