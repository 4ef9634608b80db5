//! Ordered runs of block files with contiguous sample indices.
//!
//! A [`Sequence`] is an array of [`SeqBlock`]s, each pairing a shared
//! [`BlockFile`] with the cumulative index of its first sample.
//! Editing never touches an existing block file: every primitive
//! assembles replacement blocks, verifies the result against the
//! sequence invariants, and swaps it in atomically. On any failure
//! the sequence is left exactly as it was.
//!
//! Block sizes are kept between `min_samples` and
//! `max_samples = 2 * min_samples` (derived from the maximum on-disk
//! block size and the storage format), except that the last block may
//! run short.

use std::sync::Arc;

use tracing::warn;

use strata_blocks::{BlockFile, DirManager};
use strata_core::{Error, Result, SampleCount, SampleFormat};

/// Upper bound for a block file's data section, in bytes.
pub const MAX_DISK_BLOCK_SIZE: usize = 1_048_576;

/// One entry of a sequence: a shared block file and the index of its
/// first sample within the sequence.
#[derive(Debug, Clone)]
pub struct SeqBlock {
    pub start: SampleCount,
    pub file: Arc<BlockFile>,
}

impl SeqBlock {
    fn new(file: Arc<BlockFile>, start: SampleCount) -> Self {
        SeqBlock { start, file }
    }

    /// Same file, shifted start.
    fn plus(&self, delta: SampleCount) -> Self {
        SeqBlock {
            start: self.start + delta,
            file: Arc::clone(&self.file),
        }
    }
}

fn overflows(total: f64) -> bool {
    total > i64::MAX as f64
}

/// An editable, immutable-block audio sequence.
pub struct Sequence {
    blocks: Vec<SeqBlock>,
    format: SampleFormat,
    num_samples: SampleCount,
    min_samples: usize,
    max_samples: usize,
    dir: Arc<DirManager>,
}

impl Sequence {
    pub fn new(dir: Arc<DirManager>, format: SampleFormat) -> Sequence {
        let min_samples = MAX_DISK_BLOCK_SIZE / format.sample_size() / 2;
        Sequence {
            blocks: Vec::new(),
            format,
            num_samples: 0,
            min_samples,
            max_samples: min_samples * 2,
            dir,
        }
    }

    /// Copy this sequence, possibly into another project's manager.
    pub fn duplicate(&self, dir: &Arc<DirManager>) -> Result<Sequence> {
        let mut dest = Sequence::new(Arc::clone(dir), self.format);
        dest.paste(0, self)?;
        Ok(dest)
    }

    pub fn num_samples(&self) -> SampleCount {
        self.num_samples
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn dir_manager(&self) -> &Arc<DirManager> {
        &self.dir
    }

    pub fn blocks(&self) -> &[SeqBlock] {
        &self.blocks
    }

    pub fn max_block_size(&self) -> usize {
        self.max_samples
    }

    pub fn min_block_size(&self) -> usize {
        self.min_samples
    }

    /// Target size for freshly appended blocks.
    pub fn ideal_block_size(&self) -> usize {
        self.max_samples
    }

    /// How many samples an append buffer should gather before
    /// flushing, so the flush lands on a block boundary.
    pub fn ideal_append_len(&self) -> usize {
        let max = self.max_samples;
        match self.blocks.last() {
            None => max,
            Some(last) => {
                let len = last.file.len();
                if len >= max {
                    max
                } else {
                    max - len
                }
            }
        }
    }

    /// A nice number of samples to grab in one chunk starting at
    /// `start`, so that sequential reads land on block boundaries.
    /// Always nonzero and never more than `max_block_size`.
    pub fn best_block_size(&self, start: SampleCount) -> usize {
        if start < 0 || start >= self.num_samples {
            return self.max_samples;
        }

        let mut b = self.find_block(start);
        let num_blocks = self.blocks.len();
        let block = &self.blocks[b];
        let mut result = (block.start + block.file.len() as SampleCount - start) as usize;

        while result < self.min_samples && b + 1 < num_blocks {
            let length = self.blocks[b + 1].file.len();
            if result + length > self.max_samples {
                break;
            }
            b += 1;
            result += length;
        }

        debug_assert!(result > 0 && result <= self.max_samples);
        result
    }

    /// Start index of the block containing `pos`.
    pub fn block_start(&self, pos: SampleCount) -> SampleCount {
        self.blocks[self.find_block(pos)].start
    }

    /// Locate the block containing `pos` by dictionary search:
    /// interpolate a guess from the sample position, then contract.
    /// O(log n) worst case, O(1) for uniform block sizes.
    pub fn find_block(&self, pos: SampleCount) -> usize {
        debug_assert!(pos >= 0 && pos < self.num_samples);

        if pos == 0 {
            return 0;
        }

        let mut lo = 0usize;
        let mut hi = self.blocks.len();
        let mut lo_samples: SampleCount = 0;
        let mut hi_samples: SampleCount = self.num_samples;

        loop {
            let frac = (pos - lo_samples) as f64 / (hi_samples - lo_samples) as f64;
            let guess = (lo + (frac * (hi - lo) as f64) as usize).min(hi - 1);
            let block = &self.blocks[guess];

            debug_assert!(block.file.len() > 0);
            debug_assert!(lo <= guess && guess < hi && lo < hi);

            if pos < block.start {
                debug_assert!(lo != guess);
                hi = guess;
                hi_samples = block.start;
            } else {
                let next_start = block.start + block.file.len() as SampleCount;
                if pos < next_start {
                    return guess;
                }
                debug_assert!(guess < hi - 1);
                lo = guess + 1;
                lo_samples = next_start;
            }
        }
    }

    /// Streaming read across block boundaries into `dst`.
    ///
    /// If `may_throw` is false, out-of-range or short reads zero-fill
    /// and report `Ok(false)` instead of failing.
    pub fn get(&self, dst: &mut [f32], start: SampleCount, may_throw: bool) -> Result<bool> {
        if start == self.num_samples {
            return Ok(dst.is_empty());
        }

        if start < 0 || start + dst.len() as SampleCount > self.num_samples {
            if may_throw {
                return Err(Error::inconsistency("get out of range"));
            }
            dst.fill(0.0);
            return Ok(false);
        }

        let b = self.find_block(start);
        self.get_from(b, dst, start, may_throw)
    }

    fn get_from(
        &self,
        mut b: usize,
        dst: &mut [f32],
        mut start: SampleCount,
        may_throw: bool,
    ) -> Result<bool> {
        let mut result = true;
        let mut off = 0usize;
        while off < dst.len() {
            let block = &self.blocks[b];
            let bstart = (start - block.start) as usize;
            let blen = (dst.len() - off).min(block.file.len() - bstart);

            let got = block.file.read_data(&mut dst[off..off + blen], bstart, may_throw)?;
            if got != blen {
                result = false;
            }

            off += blen;
            start += blen as SampleCount;
            b += 1;
        }
        Ok(result)
    }

    /// Read one whole-or-partial block, failing on short reads.
    fn read_block(block: &SeqBlock, dst: &mut [f32], from: usize) -> Result<()> {
        block.file.read_data(dst, from, true)?;
        Ok(())
    }

    /// Overwrite `[start, start + len)` with `src`, or with silence
    /// when `src` is `None`. Blocks are immutable, so each affected
    /// block is read whole, spliced, and replaced by a fresh file.
    /// Strong guarantee: the new block array is swapped in only after
    /// a consistency check.
    pub fn set_samples(
        &mut self,
        src: Option<&[f32]>,
        start: SampleCount,
        len: SampleCount,
    ) -> Result<()> {
        if start < 0 || len < 0 || start + len > self.num_samples {
            return Err(Error::inconsistency("set_samples range"));
        }
        if let Some(buf) = src {
            debug_assert_eq!(buf.len() as SampleCount, len);
        }
        if len == 0 {
            return Ok(());
        }

        let b0 = self.find_block(start);
        let mut new_blocks: Vec<SeqBlock> = self.blocks[..b0].to_vec();

        let mut scratch = vec![0f32; self.max_samples];
        let mut remaining = len;
        let mut pos = start;
        let mut src_off = 0usize;
        let mut b = b0;

        // The redundant `b < len` condition guards against a stalled
        // loop should a corrupt project present zero-length blocks.
        while remaining > 0 && b < self.blocks.len() {
            let block = &self.blocks[b];
            let bstart = (pos - block.start) as usize;
            let file_len = block.file.len();
            let blen = (file_len - bstart.min(file_len)).min(remaining as usize);
            debug_assert!(blen == 0 || bstart + blen <= file_len);

            let file = if bstart > 0 || blen < file_len {
                // Partially overwritten: splice into a full copy.
                if scratch.len() < file_len {
                    scratch.resize(file_len, 0.0);
                }
                Self::read_block(block, &mut scratch[..file_len], 0)?;
                match src {
                    Some(buf) => scratch[bstart..bstart + blen]
                        .copy_from_slice(&buf[src_off..src_off + blen]),
                    None => scratch[bstart..bstart + blen].fill(0.0),
                }
                self.dir.new_simple_block(&scratch[..file_len], self.format)?
            } else {
                // Total replacement: no need to read the old data.
                match src {
                    Some(buf) => self
                        .dir
                        .new_simple_block(&buf[src_off..src_off + blen], self.format)?,
                    None => self.dir.silent_block(file_len),
                }
            };
            new_blocks.push(SeqBlock::new(file, block.start));

            if src.is_some() {
                src_off += blen;
            }
            remaining -= blen as SampleCount;
            pos += blen as SampleCount;
            b += 1;
        }

        new_blocks.extend_from_slice(&self.blocks[b..]);
        self.commit_if_consistent(new_blocks, self.num_samples, "set_samples")
    }

    /// Append samples, first topping up a sub-minimum last block,
    /// then splitting the remainder into ideally sized blocks.
    /// Strong guarantee.
    pub fn append(&mut self, buffer: &[f32]) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        if overflows(self.num_samples as f64 + buffer.len() as f64) {
            return Err(Error::inconsistency("append overflow"));
        }

        let mut new_blocks = Vec::new();
        let mut new_num = self.num_samples;
        let mut src = buffer;
        let mut replace_last = false;

        if let Some(last) = self.blocks.last() {
            let length = last.file.len();
            if length < self.min_samples {
                // Enlarge a sub-minimum block at the end.
                let add_len = (self.max_samples - length).min(src.len());
                let mut merged = vec![0f32; length + add_len];
                Self::read_block(last, &mut merged[..length], 0)?;
                merged[length..].copy_from_slice(&src[..add_len]);

                let file = self.dir.new_simple_block(&merged, self.format)?;
                new_blocks.push(SeqBlock::new(file, last.start));

                src = &src[add_len..];
                new_num += add_len as SampleCount;
                replace_last = true;
            }
        }

        while !src.is_empty() {
            let added = self.ideal_block_size().min(src.len());
            let file = self.dir.new_simple_block(&src[..added], self.format)?;
            new_blocks.push(SeqBlock::new(file, new_num));
            src = &src[added..];
            new_num += added as SampleCount;
        }

        self.append_blocks_if_consistent(new_blocks, replace_last, new_num, "append")
    }

    /// Remove `[start, start + len)`. Strong guarantee.
    ///
    /// A deletion confined to one block whose remainder stays above
    /// the minimum replaces just that block in place; otherwise a new
    /// array is assembled with synthesized fringe blocks, merged with
    /// their neighbors when they would come out sub-minimum.
    pub fn delete(&mut self, start: SampleCount, len: SampleCount) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if len < 0 || start < 0 || start + len > self.num_samples {
            return Err(Error::inconsistency("delete range"));
        }

        let num_blocks = self.blocks.len();
        let b0 = self.find_block(start);
        let mut b1 = self.find_block(start + len - 1);

        // Deletion within a single block, leaving enough behind.
        if b0 == b1 {
            let block = &self.blocks[b0];
            let length = block.file.len();
            if length as SampleCount - len >= self.min_samples as SampleCount {
                let pos = (start - block.start) as usize;
                debug_assert!((len as usize) < length);
                let new_len = length - len as usize;

                let mut scratch = vec![0f32; new_len];
                Self::read_block(block, &mut scratch[..pos], 0)?;
                Self::read_block(block, &mut scratch[pos..], pos + len as usize)?;

                let file = self.dir.new_simple_block(&scratch, self.format)?;

                // One allocation done; the rest cannot fail.
                self.blocks[b0].file = file;
                for block in &mut self.blocks[b0 + 1..] {
                    block.start -= len;
                }
                self.num_samples -= len;
                self.check_consistency_nofail("delete branch one");
                return Ok(());
            }
        }

        let mut new_blocks = Vec::with_capacity(num_blocks - (b1 - b0) + 2);
        new_blocks.extend_from_slice(&self.blocks[..b0]);

        // Samples of block b0 before the deletion point: own block if
        // big enough or first in the array, else merge with the
        // previous block and re-split 50/50.
        let pre_block = self.blocks[b0].clone();
        let pre_len = (start - pre_block.start) as usize;
        if pre_len > 0 {
            if pre_len >= self.min_samples || b0 == 0 {
                let mut scratch = vec![0f32; pre_len];
                Self::read_block(&pre_block, &mut scratch, 0)?;
                let file = self.dir.new_simple_block(&scratch, self.format)?;
                new_blocks.push(SeqBlock::new(file, pre_block.start));
            } else {
                let prepre = &self.blocks[b0 - 1];
                let prepre_len = prepre.file.len();
                let sum = prepre_len + pre_len;

                let mut scratch = vec![0f32; sum];
                Self::read_block(prepre, &mut scratch[..prepre_len], 0)?;
                Self::read_block(&pre_block, &mut scratch[prepre_len..], 0)?;

                new_blocks.pop();
                Self::blockify(
                    &self.dir,
                    self.max_samples,
                    self.format,
                    &mut new_blocks,
                    prepre.start,
                    &scratch,
                )?;
            }
        }
        // else: the deletion starts exactly on a block boundary.

        // Symmetrically for block b1 after the deletion point.
        let post_block = self.blocks[b1].clone();
        let post_len =
            (post_block.start + post_block.file.len() as SampleCount - (start + len)) as usize;
        if post_len > 0 {
            let pos = (start + len - post_block.start) as usize;
            if post_len >= self.min_samples || b1 == num_blocks - 1 {
                let mut scratch = vec![0f32; post_len];
                Self::read_block(&post_block, &mut scratch, pos)?;
                let file = self.dir.new_simple_block(&scratch, self.format)?;
                new_blocks.push(SeqBlock::new(file, start));
            } else {
                let postpost = &self.blocks[b1 + 1];
                let postpost_len = postpost.file.len();
                let sum = postpost_len + post_len;

                let mut scratch = vec![0f32; sum];
                Self::read_block(&post_block, &mut scratch[..post_len], pos)?;
                Self::read_block(postpost, &mut scratch[post_len..], 0)?;

                Self::blockify(
                    &self.dir,
                    self.max_samples,
                    self.format,
                    &mut new_blocks,
                    start,
                    &scratch,
                )?;
                b1 += 1;
            }
        }
        // else: the deletion ends exactly on a block boundary.

        for block in &self.blocks[b1 + 1..] {
            new_blocks.push(block.plus(-len));
        }

        self.commit_if_consistent(new_blocks, self.num_samples - len, "delete branch two")
    }

    /// Insert a copy of `src` at sample position `s`. Strong
    /// guarantee. Block files are shared with `src` wherever the
    /// block-size invariants allow.
    pub fn paste(&mut self, s: SampleCount, src: &Sequence) -> Result<()> {
        if s < 0 || s > self.num_samples {
            warn!(s, num_samples = self.num_samples, "paste position out of range");
            return Err(Error::inconsistency("paste position"));
        }
        if overflows(self.num_samples as f64 + src.num_samples as f64) {
            warn!("paste would overflow the sample count");
            return Err(Error::inconsistency("paste overflow"));
        }
        if src.format != self.format {
            warn!(
                src_format = ?src.format,
                dst_format = ?self.format,
                "paste format mismatch"
            );
            return Err(Error::inconsistency("paste format"));
        }

        let added_len = src.num_samples;
        let src_num_blocks = src.blocks.len();
        if added_len == 0 || src_num_blocks == 0 {
            return Ok(());
        }

        let num_blocks = self.blocks.len();

        if num_blocks == 0
            || (s == self.num_samples && self.blocks.last().unwrap().file.len() >= self.min_samples)
        {
            // Empty destination, or appending after a full last
            // block: share every source block.
            let mut new_blocks = self.blocks.clone();
            let mut samples = self.num_samples;
            for block in &src.blocks {
                // May fail for limited disk space when pasting from
                // another project's locked blocks.
                Self::append_block(&self.dir, &mut new_blocks, &mut samples, block)?;
            }
            return self.commit_if_consistent(new_blocks, samples, "paste branch one");
        }

        let b = if s == self.num_samples {
            num_blocks - 1
        } else {
            self.find_block(s)
        };
        let split_block = self.blocks[b].clone();
        let split_len = split_block.file.len();
        let split_point = (s - split_block.start) as usize;

        let larger_len = added_len as usize + split_len;
        if larger_len <= self.max_samples {
            // Everything fits into the split block.
            let s_added = added_len as usize;
            let mut buffer = vec![0f32; larger_len];
            Self::read_block(&split_block, &mut buffer[..split_point], 0)?;
            src.get_from(0, &mut buffer[split_point..split_point + s_added], 0, true)?;
            Self::read_block(
                &split_block,
                &mut buffer[split_point + s_added..],
                split_point,
            )?;

            let file = self.dir.new_simple_block(&buffer, self.format)?;

            // Single block replaced in place; the rest cannot fail.
            self.blocks[b].file = file;
            for block in &mut self.blocks[b + 1..] {
                block.start += added_len;
            }
            self.num_samples += added_len;
            self.check_consistency_nofail("paste branch two");
            return Ok(());
        }

        let mut new_blocks = Vec::with_capacity(num_blocks + src_num_blocks + 2);
        new_blocks.extend_from_slice(&self.blocks[..b]);

        if src_num_blocks <= 4 {
            // Few enough source blocks: lump the split block and the
            // whole source together and re-split.
            let s_added = added_len as usize;
            let sum = split_len + s_added;

            let mut buffer = vec![0f32; sum];
            Self::read_block(&split_block, &mut buffer[..split_point], 0)?;
            src.get_from(0, &mut buffer[split_point..split_point + s_added], 0, true)?;
            Self::read_block(
                &split_block,
                &mut buffer[split_point + s_added..],
                split_point,
            )?;

            Self::blockify(
                &self.dir,
                self.max_samples,
                self.format,
                &mut new_blocks,
                split_block.start,
                &buffer,
            )?;
        } else {
            // At least five source blocks: merge the first two with
            // the left half of the split block, share the middle
            // blocks, merge the last two with the right half. This
            // bounds both copying and the number of sub-minimum
            // blocks created.
            let first_two = src.blocks[0].file.len() + src.blocks[1].file.len();
            let left_len = split_point + first_two;

            let penultimate = &src.blocks[src_num_blocks - 2];
            let last_two =
                penultimate.file.len() + src.blocks[src_num_blocks - 1].file.len();
            let right_split = split_len - split_point;
            let right_len = right_split + last_two;

            let mut buffer = vec![0f32; left_len.max(right_len)];

            Self::read_block(&split_block, &mut buffer[..split_point], 0)?;
            src.get_from(0, &mut buffer[split_point..left_len], 0, true)?;
            Self::blockify(
                &self.dir,
                self.max_samples,
                self.format,
                &mut new_blocks,
                split_block.start,
                &buffer[..left_len],
            )?;

            for block in &src.blocks[2..src_num_blocks - 2] {
                let file = self.dir.copy_block(&block.file)?;
                new_blocks.push(SeqBlock::new(file, block.start + s));
            }

            let last_start = penultimate.start;
            src.get_from(
                src_num_blocks - 2,
                &mut buffer[..last_two],
                last_start,
                true,
            )?;
            Self::read_block(&split_block, &mut buffer[last_two..right_len], split_point)?;
            Self::blockify(
                &self.dir,
                self.max_samples,
                self.format,
                &mut new_blocks,
                s + last_start,
                &buffer[..right_len],
            )?;
        }

        for block in &self.blocks[b + 1..] {
            new_blocks.push(block.plus(added_len));
        }

        self.commit_if_consistent(
            new_blocks,
            self.num_samples + added_len,
            "paste branch three",
        )
    }

    /// Extract `[s0, s1)` as a new sequence, sharing whole blocks
    /// where possible.
    pub fn copy(&self, s0: SampleCount, s1: SampleCount) -> Result<Sequence> {
        let mut dest = Sequence::new(Arc::clone(&self.dir), self.format);
        if s0 >= s1 || s0 >= self.num_samples || s1 < 0 {
            return Ok(dest);
        }
        let s1 = s1.min(self.num_samples);

        let b0 = self.find_block(s0) as isize;
        let b1 = self.find_block(s1 - 1);

        let mut buffer = vec![0f32; self.max_samples];

        // The first block, unless the copy begins on its boundary.
        let mut b0 = b0;
        let first = &self.blocks[b0 as usize];
        if s0 != first.start {
            let block_len =
                (s1.min(first.start + first.file.len() as SampleCount) - s0) as usize;
            debug_assert!(first.file.is_alias() || block_len <= self.max_samples);
            if buffer.len() < block_len {
                buffer.resize(block_len, 0.0);
            }
            self.get_from(b0 as usize, &mut buffer[..block_len], s0, true)?;
            dest.append(&buffer[..block_len])?;
        } else {
            b0 -= 1;
        }

        // Whole blocks in the middle are shared by reference.
        for bb in (b0 + 1) as usize..b1 {
            Self::append_block(
                &dest.dir,
                &mut dest.blocks,
                &mut dest.num_samples,
                &self.blocks[bb],
            )?;
        }

        // The last block, shared if the copy covers all of it.
        if b1 as isize > b0 {
            let block = &self.blocks[b1];
            let block_len = (s1 - block.start) as usize;
            debug_assert!(block.file.is_alias() || block_len <= self.max_samples);
            if block_len < block.file.len() {
                if buffer.len() < block_len {
                    buffer.resize(block_len, 0.0);
                }
                self.get_from(b1, &mut buffer[..block_len], block.start, true)?;
                dest.append(&buffer[..block_len])?;
            } else {
                Self::append_block(
                    &dest.dir,
                    &mut dest.blocks,
                    &mut dest.num_samples,
                    block,
                )?;
            }
        }

        dest.check_consistency("copy")?;
        Ok(dest)
    }

    /// Re-encode every block in a new storage format, re-splitting to
    /// the new block-size bounds. No-op when the format is unchanged.
    /// Strong guarantee. Returns whether anything changed.
    pub fn convert_to_sample_format(&mut self, format: SampleFormat) -> Result<bool> {
        if format == self.format {
            return Ok(false);
        }

        let new_min = MAX_DISK_BLOCK_SIZE / format.sample_size() / 2;
        let new_max = new_min * 2;

        if self.blocks.is_empty() {
            self.format = format;
            self.min_samples = new_min;
            self.max_samples = new_max;
            return Ok(true);
        }

        let mut new_blocks =
            Vec::with_capacity(1 + self.blocks.len() * (self.max_samples / new_max).max(1));
        let mut buffer = vec![0f32; self.max_samples];

        for block in &self.blocks {
            let len = block.file.len();
            if buffer.len() < len {
                buffer.resize(len, 0.0);
            }
            Self::read_block(block, &mut buffer[..len], 0)?;
            // Blockify handles len exceeding the new maximum; going to
            // a wider format can leave blocks below the new minimum,
            // which the invariant tolerates only for the last block
            // but has always been accepted here.
            Self::blockify(
                &self.dir,
                new_max,
                format,
                &mut new_blocks,
                block.start,
                &buffer[..len],
            )?;
        }

        Self::check_blocks(&new_blocks, new_max, 0, self.num_samples, "convert_to_sample_format")?;

        self.blocks = new_blocks;
        self.format = format;
        self.min_samples = new_min;
        self.max_samples = new_max;
        Ok(true)
    }

    /// Slice `buffer` into `ceil(len / max_samples)` equal blocks
    /// appended to `list`.
    fn blockify(
        dir: &DirManager,
        max_samples: usize,
        format: SampleFormat,
        list: &mut Vec<SeqBlock>,
        start: SampleCount,
        buffer: &[f32],
    ) -> Result<()> {
        let len = buffer.len();
        if len == 0 {
            return Ok(());
        }
        let num = (len + max_samples - 1) / max_samples;
        list.reserve(num);

        for i in 0..num {
            let offset = i * len / num;
            let end = (i + 1) * len / num;
            let file = dir.new_simple_block(&buffer[offset..end], format)?;
            list.push(SeqBlock::new(file, start + offset as SampleCount));
        }
        Ok(())
    }

    /// Share `b`'s file onto the end of `blocks` (copy-on-write when
    /// the block is locked).
    fn append_block(
        dir: &DirManager,
        blocks: &mut Vec<SeqBlock>,
        num_samples: &mut SampleCount,
        b: &SeqBlock,
    ) -> Result<()> {
        if overflows(*num_samples as f64 + b.file.len() as f64) {
            return Err(Error::inconsistency("append_block overflow"));
        }
        let file = dir.copy_block(&b.file)?;
        blocks.push(SeqBlock::new(file, *num_samples));
        *num_samples += b.file.len() as SampleCount;
        // No consistency check here; this runs in inner loops.
        Ok(())
    }

    /// Verify invariants over `blocks[from..]`: contiguous starts
    /// summing to `num_samples`, every length within `max_samples`.
    fn check_blocks(
        blocks: &[SeqBlock],
        max_samples: usize,
        from: usize,
        num_samples: SampleCount,
        context: &'static str,
    ) -> Result<()> {
        let mut pos = if from < blocks.len() {
            blocks[from].start
        } else {
            num_samples
        };
        if from == 0 && pos != 0 {
            warn!(context, "consistency check failed: first block start nonzero");
            return Err(Error::inconsistency("first block start"));
        }

        for block in &blocks[from..] {
            if pos != block.start {
                warn!(context, pos, block_start = block.start, "consistency check failed");
                return Err(Error::inconsistency("block start mismatch"));
            }
            let length = block.file.len();
            if length > max_samples {
                warn!(context, length, max_samples, "consistency check failed: oversized block");
                return Err(Error::inconsistency("block too long"));
            }
            pos += length as SampleCount;
        }
        if pos != num_samples {
            warn!(context, pos, num_samples, "consistency check failed: total mismatch");
            return Err(Error::inconsistency("sample total mismatch"));
        }
        Ok(())
    }

    /// Full-array invariant check.
    pub fn check_consistency(&self, context: &'static str) -> Result<()> {
        Self::check_blocks(&self.blocks, self.max_samples, 0, self.num_samples, context)
    }

    // For paths where consistency is provable; failure indicates a
    // bug rather than a recoverable condition.
    fn check_consistency_nofail(&self, context: &'static str) {
        let result = self.check_consistency(context);
        debug_assert!(result.is_ok(), "consistency lost after {context}");
        if let Err(e) = result {
            warn!(context, error = %e, "consistency lost on a no-fail path");
        }
    }

    fn commit_if_consistent(
        &mut self,
        new_blocks: Vec<SeqBlock>,
        num_samples: SampleCount,
        context: &'static str,
    ) -> Result<()> {
        Self::check_blocks(&new_blocks, self.max_samples, 0, num_samples, context)?;
        self.blocks = new_blocks;
        self.num_samples = num_samples;
        Ok(())
    }

    /// Append `additional` (replacing the final block if
    /// `replace_last`), committing only if the appended region checks
    /// out; otherwise restore the original array.
    fn append_blocks_if_consistent(
        &mut self,
        additional: Vec<SeqBlock>,
        replace_last: bool,
        num_samples: SampleCount,
        context: &'static str,
    ) -> Result<()> {
        if additional.is_empty() {
            return Ok(());
        }

        let mut replaced = None;
        if replace_last && !self.blocks.is_empty() {
            replaced = self.blocks.pop();
        }
        let prev_size = self.blocks.len();
        self.blocks.extend(additional);

        // Check only the blocks that were added, avoiding quadratic
        // time across repeated appends.
        match Self::check_blocks(&self.blocks, self.max_samples, prev_size, num_samples, context) {
            Ok(()) => {
                self.num_samples = num_samples;
                Ok(())
            }
            Err(e) => {
                self.blocks.truncate(prev_size);
                if let Some(block) = replaced {
                    self.blocks.push(block);
                }
                Err(e)
            }
        }
    }
}
