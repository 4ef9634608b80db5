//! Two-buffer sliding cache over contiguous sequential track reads.

use std::sync::Arc;

use strata_core::{Result, SampleCount};

use crate::track::WaveTrack;

#[derive(Default)]
struct CacheBuffer {
    data: Vec<f32>,
    start: SampleCount,
    len: usize,
}

impl CacheBuffer {
    fn end(&self) -> SampleCount {
        self.start + self.len as SampleCount
    }
}

/// Serves repeated in-order reads on one track without re-fetching.
///
/// Two buffers cover adjacent spans: buffer 0 precedes buffer 1, and
/// when both are valid `buffers[0].end() == buffers[1].start`.
/// Requests inside a single buffer return a borrowed slice with no
/// copying; spans crossing buffers (or gaps) are assembled in a
/// reusable overlap buffer. Buffers refill one track-defined best
/// block at a time.
pub struct TrackCache {
    track: Arc<WaveTrack>,
    buffer_size: usize,
    buffers: [CacheBuffer; 2],
    overlap: Vec<f32>,
    n_valid: usize,
}

impl TrackCache {
    pub fn new(track: Arc<WaveTrack>) -> TrackCache {
        let buffer_size = track.max_block_size();
        TrackCache {
            track,
            buffer_size,
            buffers: [
                CacheBuffer { data: vec![0.0; buffer_size], ..Default::default() },
                CacheBuffer { data: vec![0.0; buffer_size], ..Default::default() },
            ],
            overlap: Vec::new(),
            n_valid: 0,
        }
    }

    pub fn track(&self) -> &Arc<WaveTrack> {
        &self.track
    }

    pub fn set_track(&mut self, track: Arc<WaveTrack>) {
        if !Arc::ptr_eq(&self.track, &track) {
            let buffer_size = track.max_block_size();
            if buffer_size != self.buffer_size {
                self.buffer_size = buffer_size;
                self.buffers[0].data = vec![0.0; buffer_size];
                self.buffers[1].data = vec![0.0; buffer_size];
            }
            self.track = track;
            self.n_valid = 0;
        }
    }

    /// Read `len` samples at `start`, preferring cached data.
    ///
    /// `Ok(None)` reports an underlying read failure in non-throwing
    /// mode, mirroring the track's `false` return.
    pub fn get(
        &mut self,
        start: SampleCount,
        len: usize,
        may_throw: bool,
    ) -> Result<Option<&[f32]>> {
        if len == 0 {
            return Ok(Some(&[]));
        }

        let end = start + len as SampleCount;
        let mut fill_first = self.n_valid < 1;
        let mut fill_second = self.n_valid < 2;

        // Discard cached results no longer useful for this request.
        if self.n_valid > 0
            && (end <= self.buffers[0].start || start >= self.buffers[self.n_valid - 1].end())
        {
            // Complete miss.
            fill_first = true;
            fill_second = true;
        } else if self.n_valid == 2
            && start >= self.buffers[1].start
            && end > self.buffers[1].end()
        {
            // Request starts in the second buffer and extends past
            // it: rotate, keeping the allocation.
            self.buffers.swap(0, 1);
            fill_second = true;
            self.n_valid = 1;
        } else if self.n_valid > 0
            && start < self.buffers[0].start
            && self.track.block_start(start).is_some()
        {
            // Not a total miss but starts before the cache, with a
            // clip to fetch from. Not the usual forward pattern, but
            // marching backwards produces it.
            self.buffers.swap(0, 1);
            fill_first = true;
            fill_second = false;
            // Not in a consistent state until the first buffer fills.
            self.n_valid = 0;
        }

        if fill_first {
            match self.track.block_start(start) {
                Some(start0) => {
                    let len0 = self.track.best_block_size(start0);
                    debug_assert!(len0 <= self.buffer_size);
                    if !self
                        .track
                        .get(&mut self.buffers[0].data[..len0], start0, may_throw)?
                    {
                        return Ok(None);
                    }
                    self.buffers[0].start = start0;
                    self.buffers[0].len = len0;
                    if !fill_second && self.buffers[0].end() != self.buffers[1].start {
                        fill_second = true;
                    }
                    // Keep the partially updated state consistent.
                    self.n_valid = if fill_second { 1 } else { 2 };
                }
                None => {
                    // Between clips; the track read below will supply
                    // zeroes.
                    self.n_valid = 0;
                    fill_second = false;
                }
            }
        }
        debug_assert!(!fill_second || self.n_valid > 0);
        if fill_second {
            self.n_valid = 1;
            let end0 = self.buffers[0].end();
            if end > end0 {
                if let Some(start1) = self.track.block_start(end0) {
                    if start1 == end0 {
                        let len1 = self.track.best_block_size(start1);
                        debug_assert!(len1 <= self.buffer_size);
                        if !self
                            .track
                            .get(&mut self.buffers[1].data[..len1], start1, may_throw)?
                        {
                            return Ok(None);
                        }
                        self.buffers[1].start = start1;
                        self.buffers[1].len = len1;
                        self.n_valid = 2;
                    }
                }
            }
        }
        debug_assert!(self.n_valid < 2 || self.buffers[0].end() == self.buffers[1].start);

        let mut remaining = len;
        let mut start = start;
        let mut offset = 0usize;
        let mut using_overlap = false;

        // Possibly an initial portion that is uncached; this may be
        // fetching zeroes between clips.
        let init_len: SampleCount = if self.n_valid < 1 {
            len as SampleCount
        } else {
            (len as SampleCount).min(self.buffers[0].start - start)
        };
        if init_len > 0 {
            if self.overlap.len() < len {
                self.overlap.resize(len, 0.0);
            }
            let n = init_len as usize;
            if !self.track.get(&mut self.overlap[..n], start, may_throw)? {
                return Ok(None);
            }
            remaining -= n;
            start += init_len;
            offset = n;
            using_overlap = true;
        }

        // Satisfy the rest from the buffers.
        for ii in 0..self.n_valid {
            if remaining == 0 {
                break;
            }
            let starti = start - self.buffers[ii].start;
            debug_assert!(starti >= 0);

            let leni =
                (remaining as SampleCount).min(self.buffers[ii].len as SampleCount - starti);
            if init_len <= 0 && leni == len as SampleCount {
                // All contiguous in one buffer; no copy at all.
                let at = starti as usize;
                return Ok(Some(&self.buffers[ii].data[at..at + len]));
            } else if leni > 0 {
                if !using_overlap {
                    if self.overlap.len() < len {
                        self.overlap.resize(len, 0.0);
                    }
                    using_overlap = true;
                }
                let at = starti as usize;
                let n = leni as usize;
                self.overlap[offset..offset + n]
                    .copy_from_slice(&self.buffers[ii].data[at..at + n]);
                remaining -= n;
                start += leni;
                offset += n;
            }
        }

        if remaining > 0 {
            // Request bigger than both buffers; direct fetch for the
            // tail.
            if self.overlap.len() < len {
                self.overlap.resize(len, 0.0);
            }
            if !self
                .track
                .get(&mut self.overlap[offset..offset + remaining], start, may_throw)?
            {
                return Ok(None);
            }
        }

        Ok(Some(&self.overlap[..len]))
    }
}
