//! Piecewise linear (or log-linear) automation envelopes.
//!
//! An [`Envelope`] is a list of control points sorted by time.
//! Up to two points may share one time coordinate, representing a
//! discontinuity; queries there select the left or the right limit.
//! Collapse/expand/paste operations mirror the edits a sequence
//! undergoes, preserving boundary limits so that audio edits never
//! shift the surrounding automation.
//!
//! Point times are relative to the envelope's `offset`; the envelope
//! spans `[0, track_len]` in relative time.

use std::cell::Cell;

/// Coincident points whose values differ by no more than this are a
/// removable discontinuity.
const VALUE_TOLERANCE: f64 = 1e-3;

/// One control point, in envelope-relative time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvPoint {
    pub t: f64,
    pub value: f64,
}

/// A draggable automation curve over a track's time range.
#[derive(Debug, Clone)]
pub struct Envelope {
    points: Vec<EnvPoint>,
    track_len: f64,
    /// Interpolate in log10 space when set.
    exponential: bool,
    min_value: f64,
    max_value: f64,
    default_value: f64,
    offset: f64,
    // Caches the last bracket returned, accelerating the monotone
    // query pattern. Interior mutability only; external callers must
    // synchronize access to the envelope itself.
    search_guess: Cell<isize>,
}

impl Envelope {
    pub fn new(
        exponential: bool,
        min_value: f64,
        max_value: f64,
        default_value: f64,
    ) -> Envelope {
        let mut env = Envelope {
            points: Vec::new(),
            track_len: 0.0,
            exponential,
            min_value,
            max_value,
            default_value: 0.0,
            offset: 0.0,
            search_guess: Cell::new(-2),
        };
        env.default_value = env.clamp_value(default_value);
        env
    }

    /// Copy the sub-range `[t0, t1]` (absolute times) of another
    /// envelope, interpolating boundary points as needed.
    pub fn from_range(orig: &Envelope, t0: f64, t1: f64) -> Envelope {
        let mut env = Envelope::new(
            orig.exponential,
            orig.min_value,
            orig.max_value,
            orig.default_value,
        );
        env.offset = t0.max(orig.offset);
        env.track_len = t1.min(orig.offset + orig.track_len) - env.offset;

        let range1 = orig.equal_range(t0 - orig.offset, 0.0);
        let range2 = orig.equal_range(t1 - orig.offset, 0.0);
        env.copy_range(orig, range1.0, range2.1);
        env
    }

    fn copy_range(&mut self, orig: &Envelope, begin: usize, end: usize) {
        let len = orig.points.len();
        let mut i = begin;

        // The point at 0 may need an interpolated representation.
        if i > 0 {
            self.add_point_at_end(0.0, orig.value(self.offset));
        }

        while i < end {
            let point = &orig.points[i];
            self.add_point_at_end(point.t + (orig.offset - self.offset), point.value);
            i += 1;
        }

        // So may the final point. If the last point of orig was
        // exactly at t1, this effectively copies it too.
        if self.track_len > 0.0 && i < len {
            self.add_point_at_end(self.track_len, orig.value(self.offset + self.track_len));
        }
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[EnvPoint] {
        &self.points
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
    }

    pub fn track_len(&self) -> f64 {
        self.track_len
    }

    pub fn is_exponential(&self) -> bool {
        self.exponential
    }

    pub fn default_value(&self) -> f64 {
        self.default_value
    }

    pub fn clamp_value(&self, value: f64) -> f64 {
        value.clamp(self.min_value, self.max_value)
    }

    /// Envelope value at absolute time `t` (right limit).
    pub fn value(&self, t: f64) -> f64 {
        let mut out = [0.0];
        self.values(&mut out, t, 0.0);
        out[0]
    }

    /// Fill `buffer` with interpolated values starting at absolute
    /// time `t0`, stepping by `tstep` (right limits at
    /// discontinuities).
    pub fn values(&self, buffer: &mut [f64], t0: f64, tstep: f64) {
        self.values_relative(buffer, t0 - self.offset, tstep, false);
    }

    /// Value at relative time `t`, approaching from below
    /// (`left_limit`) or above.
    pub fn value_relative(&self, t: f64, left_limit: bool) -> f64 {
        let mut out = [0.0];
        self.values_relative(&mut out, t, 0.0, left_limit);
        out[0]
    }

    /// Dense interpolation in relative time. At a duplicated time the
    /// `left_limit` flag selects which limit samples exactly at the
    /// discontinuity take; a half-step nudge keeps samples that round
    /// slightly across a boundary on the intended side.
    pub fn values_relative(
        &self,
        buffer: &mut [f64],
        t0: f64,
        tstep: f64,
        left_limit: bool,
    ) {
        let epsilon = tstep / 2.0;
        let len = self.points.len();

        let mut t = t0;
        let mut increment = 0.0;
        if len > 1 && t <= self.points[0].t && self.points[0].t == self.points[1].t {
            increment = if left_limit { -epsilon } else { epsilon };
        }

        let mut tprev = 0.0;
        let mut vprev = 0.0;
        let mut tnext = 0.0;
        let mut vnext;
        let mut vstep = 0.0;

        for b in 0..buffer.len() {
            // easiest cases first: empty envelope yields the default
            if len == 0 {
                buffer[b] = self.default_value;
                t += tstep;
                continue;
            }

            let tplus = t + increment;

            // before the envelope: first value
            let before = if left_limit {
                tplus <= self.points[0].t
            } else {
                tplus < self.points[0].t
            };
            if before {
                buffer[b] = self.points[0].value;
                t += tstep;
                continue;
            }
            // after the envelope: last value
            let after = if left_limit {
                tplus > self.points[len - 1].t
            } else {
                tplus >= self.points[len - 1].t
            };
            if after {
                buffer[b] = self.points[len - 1].value;
                t += tstep;
                continue;
            }

            // Careful to get the correct limit even when epsilon == 0.
            if b == 0
                || (if left_limit { tplus > tnext } else { tplus >= tnext })
            {
                // Beyond the current bracket; binary search rather
                // than scanning, since zoomed-out queries can skip
                // many points per step.
                let (lo, hi) = if left_limit {
                    self.binary_search_left_limit(tplus)
                } else {
                    self.binary_search(tplus)
                };
                // the eliminations above keep both indices interior
                debug_assert!(lo >= 0 && hi <= len as isize - 1);
                let (lo, hi) = (lo as usize, hi as usize);

                tprev = self.points[lo].t;
                tnext = self.points[hi].t;

                if hi + 1 < len && tnext == self.points[hi + 1].t {
                    // A discontinuity follows this interval. Usually
                    // evaluation should stop slightly before tnext and
                    // resume with the right limit; for a left limit it
                    // continues until shortly after instead.
                    increment = if left_limit { -epsilon } else { epsilon };
                } else {
                    increment = 0.0;
                }

                vprev = self.interpolation_start_value(lo);
                vnext = self.interpolation_start_value(hi);

                let dt = tnext - tprev;
                let to = t - tprev;
                let mut v;
                if dt > 0.0 {
                    v = (vprev * (dt - to) + vnext * to) / dt;
                    vstep = (vnext - vprev) * tstep / dt;
                } else {
                    v = vnext;
                    vstep = 0.0;
                }

                if self.exponential {
                    v = 10f64.powf(v);
                    vstep = 10f64.powf(vstep);
                }

                buffer[b] = v;
            } else {
                // consecutive-increment fast path
                buffer[b] = if self.exponential {
                    buffer[b - 1] * vstep
                } else {
                    buffer[b - 1] + vstep
                };
            }

            t += tstep;
        }
    }

    /// The stored value, or its log10 in exponential mode, for use as
    /// an interpolation endpoint.
    fn interpolation_start_value(&self, index: usize) -> f64 {
        let v = self.points[index].value;
        if self.exponential {
            v.log10()
        } else {
            v
        }
    }

    /// Bracket `t` (relative): last index at or before, first index
    /// after. Either may fall outside `0..len`. The monotone search
    /// guess is tried, and its successor, before bisecting.
    fn binary_search(&self, t: f64) -> (isize, isize) {
        let len = self.points.len() as isize;

        let mut guess = self.search_guess.get();
        for _ in 0..2 {
            if guess >= 0
                && guess < len
                && t >= self.points[guess as usize].t
                && (guess + 1 == len || t < self.points[(guess + 1) as usize].t)
            {
                self.search_guess.set(guess);
                return (guess, guess + 1);
            }
            guess += 1;
        }

        let mut lo = -1isize;
        let mut hi = len;
        while hi > lo + 1 {
            let mid = (lo + hi) / 2;
            if t < self.points[mid as usize].t {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        debug_assert!(hi == lo + 1);
        self.search_guess.set(lo);
        (lo, hi)
    }

    /// As [`binary_search`], but the bracket excludes points exactly
    /// at `t`: last index strictly before, first index at or after.
    fn binary_search_left_limit(&self, t: f64) -> (isize, isize) {
        let mut lo = -1isize;
        let mut hi = self.points.len() as isize;
        while hi > lo + 1 {
            let mid = (lo + hi) / 2;
            if t <= self.points[mid as usize].t {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        debug_assert!(hi == lo + 1);
        self.search_guess.set(lo);
        (lo, hi)
    }

    /// Indices of points whose time matches `when` within
    /// `sample_dur / 2`; an empty range still tells where to insert.
    pub fn equal_range(&self, when: f64, sample_dur: f64) -> (usize, usize) {
        let tolerance = sample_dur / 2.0;
        let first = self.points.partition_point(|p| p.t < when - tolerance);
        let mut after = first;
        while after < self.points.len() && self.points[after].t <= when + tolerance {
            after += 1;
        }
        (first, after)
    }

    /// Truncate or extend the domain, preserving the left-side limit
    /// at the new length.
    pub fn set_track_len(&mut self, track_len: f64, sample_dur: f64) {
        let range = self.equal_range(track_len, sample_dur);
        let need_point = range.0 == range.1 && track_len < self.track_len;
        let value = if need_point {
            self.value_relative(track_len, false)
        } else {
            0.0
        };

        self.track_len = track_len;

        // If more than one point already sits at the end, keep only
        // the first of them.
        self.points.truncate((1 + range.0).min(range.1));

        if need_point {
            self.add_point_at_end(track_len, value);
        }
    }

    /// Append a point known to be last, allowing no more than two
    /// points at exactly the same time. Of three or more coincident
    /// points, one in the middle is erased, never the newest.
    pub fn add_point_at_end(&mut self, t: f64, value: f64) {
        self.points.push(EnvPoint { t, value });

        let mut nn = self.points.len() - 1;
        while nn >= 2 && self.points[nn - 2].t == t {
            self.points.remove(nn - 1);
            nn -= 1;
        }
    }

    /// Replace any point at relative time `when` (at a discontinuity,
    /// always the left-limit point), or insert in sorted order.
    /// Returns the affected index.
    pub fn insert_or_replace_relative(&mut self, when: f64, value: f64) -> usize {
        let when = when.clamp(0.0, self.track_len);
        let value = self.clamp_value(value);

        let range = self.equal_range(when, 0.0);
        let index = range.0;
        if index < range.1 {
            self.points[index].value = value;
        } else {
            self.points.insert(index, EnvPoint { t: when, value });
        }
        index
    }

    /// As [`insert_or_replace_relative`], in absolute time.
    pub fn insert_or_replace(&mut self, t: f64, value: f64) -> usize {
        self.insert_or_replace_relative(t - self.offset, value)
    }

    pub fn delete_point(&mut self, index: usize) {
        self.points.remove(index);
    }

    pub fn insert_point(&mut self, index: usize, point: EnvPoint) {
        self.points.insert(index, point);
    }

    /// Remove points in `(t0, t1)` (absolute), preserving the
    /// left-side limit at the start and the right-side limit at the
    /// end, then shift later points left. Mirrors a sample deletion.
    pub fn collapse_region(&mut self, t0: f64, t1: f64, sample_dur: f64) {
        if t1 <= t0 {
            return;
        }

        let epsilon = sample_dur / 2.0;
        let t0 = (t0 - self.offset).clamp(0.0, self.track_len);
        let t1 = (t1 - self.offset).clamp(0.0, self.track_len);
        let mut left_point = true;
        let mut right_point = true;

        // Start of the range of points to remove.
        let range0 = self.equal_range(t0, 0.0);
        let mut begin = range0.0;
        if range0.0 == range0.1 {
            if t0 > epsilon {
                // No point exactly at t0; insert one to preserve the
                // value there.
                let val = self.value_relative(t0, false);
                self.insert_or_replace_relative(t0, val);
                begin += 1;
            } else {
                left_point = false;
            }
        } else {
            // Keep the first (or only) point that was at t0.
            begin += 1;
        }

        // One past the range of points to remove.
        let range1 = self.equal_range(t1, 0.0);
        let mut end = range1.1;
        if range1.0 == end {
            if self.track_len - t1 > epsilon {
                let val = self.value_relative(t1, false);
                self.insert_or_replace_relative(t1, val);
                // end is now the index of this new point, which is
                // what the erase below wants.
            } else {
                right_point = false;
            }
        } else {
            // Keep the last (or only) point that was at t1.
            end -= 1;
        }

        self.points.drain(begin..end);

        // Shift points left after the deleted region.
        let len = self.points.len();
        for i in begin..len {
            if right_point && i == begin {
                // Exactly equal times of neighboring points make a
                // real discontinuity; avoid roundoff drift.
                self.points[i].t = t0;
            } else {
                self.points[i].t -= t1 - t0;
            }
        }

        if right_point {
            self.remove_unneeded_points(begin, true, true);
        }
        if left_point && begin > 0 {
            self.remove_unneeded_points(begin - 1, false, true);
        }

        self.track_len -= t1 - t0;
    }

    /// Open a space of duration `tlen` at relative time `t0`,
    /// preserving both limits and optionally pinning explicit
    /// discontinuity values at the boundaries. Returns the index
    /// range of the inserted boundary points.
    pub fn expand_region(
        &mut self,
        t0: f64,
        tlen: f64,
        left_val: Option<f64>,
        right_val: Option<f64>,
    ) -> (usize, usize) {
        let val = self.value_relative(t0, false);
        let range = self.equal_range(t0, 0.0);

        // Preserve the left-side limit.
        let mut index = 1 + range.0;
        if index > range.1 {
            // No control point yet; make one.
            self.points.insert(range.0, EnvPoint { t: t0, value: val });
        }

        // Shift everything after the opening point.
        let len = self.points.len();
        for i in index..len {
            self.points[i].t += tlen;
        }

        self.track_len += tlen;

        // Preserve the right-side limit.
        if index >= range.1 {
            self.points.insert(index, EnvPoint { t: t0 + tlen, value: val });
        }

        // Discontinuities at the ends, maybe.
        if let Some(v) = left_val {
            self.points.insert(index, EnvPoint { t: t0, value: v });
            index += 1;
        }
        if let Some(v) = right_val {
            self.points.insert(index, EnvPoint { t: t0 + tlen, value: v });
            index += 1;
        }

        // Includes the inside limiting points: none, one, or two.
        (1 + range.0, index)
    }

    /// Transplant another envelope's points into a space opened at
    /// absolute time `t0`. `sample_dur` supplies the tolerance for
    /// snapping onto an existing discontinuity. Mirrors a sample
    /// paste.
    ///
    /// The domain runs `t=0` (first sample) to `t=track_len`
    /// (one-past the last sample), which makes the endpoint handling
    /// trickier than it looks: boundary points equivalent to the
    /// limits just introduced are skipped rather than duplicated.
    pub fn paste(&mut self, t0: f64, other: &Envelope, sample_dur: f64) {
        let was_empty = self.points.is_empty();
        let mut other_size = other.points.len();
        let other_dur = other.track_len;
        let other_offset = other.offset;
        let deltat = other_offset + other_dur;

        if other_size == 0 && was_empty && other.default_value == self.default_value {
            // Nothing to insert, but the envelope does get longer.
            self.track_len += deltat;
            return;
        }

        // Make t0 relative, trimmed to this domain.
        let mut t0 = (t0 - self.offset).clamp(0.0, self.track_len);

        // Adjust if the insertion point rounds off near an existing
        // discontinuity.
        {
            let range = self.equal_range(t0, sample_dur);
            if range.0 + 2 == range.1 && self.points[range.0].t == self.points[range.0 + 1].t {
                t0 = self.points[range.0].t;
            }
        }

        // Open up a space.
        let left_val = other.value(0.0);
        let right_val = other.value_relative(other_dur, false);
        // The returned range includes the right-side limit of the
        // left end and the left-side limit of the right end.
        let range = self.expand_region(t0, deltat, Some(left_val), Some(right_val));
        let insert_at = range.0 + 1;

        // Copy points, maybe skipping those at the extremes.
        let mut end = other.points.len();
        if other_size != 0 && other.points[other_size - 1].t == other_dur {
            // expand_region already made an equivalent limit point
            end -= 1;
            other_size -= 1;
        }
        let mut begin = 0;
        if other_size != 0 && other_offset == 0.0 && other.points[0].t == 0.0 {
            begin += 1;
            other_size -= 1;
        }

        let incoming: Vec<EnvPoint> = other.points[begin..end]
            .iter()
            .map(|p| EnvPoint { t: p.t + other_offset + t0, value: p.value })
            .collect();
        self.points.splice(insert_at..insert_at, incoming);

        // Treat removable discontinuities.
        // Right edge outward:
        self.remove_unneeded_points(insert_at + other_size + 1, true, true);
        // Right edge inward:
        self.remove_unneeded_points(insert_at + other_size, false, false);
        // Left edge inward:
        self.remove_unneeded_points(range.0, true, false);
        // Left edge outward:
        if range.0 > 0 {
            self.remove_unneeded_points(range.0 - 1, false, true);
        }
    }

    /// Try removing the point at `start_at` (a recent insertion that
    /// might make no difference to evaluation); if it is needed, and
    /// `test_neighbors`, try nearby points instead, stopping at any
    /// real discontinuity. A discontinuity is removable when its
    /// coincident values differ by less than the tolerance.
    pub fn remove_unneeded_points(
        &mut self,
        start_at: usize,
        rightward: bool,
        test_neighbors: bool,
    ) {
        let mut len = self.points.len();
        if start_at >= len {
            return;
        }

        let left_limit =
            !rightward && start_at + 1 < len && self.is_discontinuity(start_at);

        if self.try_remove_point(start_at, left_limit) {
            // The given point was removable. Done.
            return;
        }

        if !test_neighbors {
            return;
        }

        // Did its insertion make nearby points removable?
        let mut index = start_at as isize + if rightward { 1 } else { -1 };
        while index >= 0 && (index as usize) < len {
            let i = index as usize;
            // Stop at any discontinuity.
            if i > 0 && self.is_discontinuity(i - 1) {
                break;
            }
            if i + 1 < len && self.is_discontinuity(i) {
                break;
            }

            if !self.try_remove_point(i, false) {
                break;
            }

            len -= 1;
            if !rightward {
                index -= 1;
            }
        }
    }

    fn is_discontinuity(&self, index: usize) -> bool {
        let p1 = &self.points[index];
        let p2 = &self.points[index + 1];
        p1.t == p2.t && (p1.value - p2.value).abs() > VALUE_TOLERANCE
    }

    // Delete the point to see whether it was doing anything; put it
    // back if the evaluated value moves beyond the tolerance.
    fn try_remove_point(&mut self, index: usize, left_limit: bool) -> bool {
        let point = self.points[index];
        self.points.remove(index);
        let val = self.value_relative(point.t, left_limit);
        if (point.value - val).abs() > VALUE_TOLERANCE {
            self.points.insert(index, point);
            false
        } else {
            true
        }
    }

    /// Stretch or squeeze all point times to a new domain length.
    pub fn rescale_times(&mut self, new_length: f64) {
        if self.track_len == 0.0 {
            for point in &mut self.points {
                point.t = 0.0;
            }
        } else {
            let ratio = new_length / self.track_len;
            for point in &mut self.points {
                point.t *= ratio;
            }
        }
        self.track_len = new_length;
    }
}
