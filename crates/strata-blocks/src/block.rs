//! Immutable audio blocks: simple, silent, and alias variants.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use strata_core::{Error, Result, SampleCount, SampleFormat};

use crate::au;
use crate::summary::{calc_summary, SummaryInfo};

/// Extension of simple block files.
pub const AU_EXTENSION: &str = "au";
/// Extension of alias summary files.
pub const SUMMARY_EXTENSION: &str = "auf";

// Drives the DirManager's lazy sweep of dead registry entries.
static DESTRUCTION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of block files destroyed process-wide.
pub fn destruction_count() -> u64 {
    DESTRUCTION_COUNT.load(Ordering::Relaxed)
}

#[derive(Debug)]
enum BlockKind {
    /// Owns its sample data in an `.au` file.
    Simple { path: PathBuf, format: SampleFormat },
    /// No file; reads as zeros.
    Silent,
    /// Summary in an `.auf` file, sample data read from an external
    /// WAV file this block does not own.
    Alias {
        summary_path: PathBuf,
        alias_path: PathBuf,
        alias_start: SampleCount,
        alias_channel: u16,
    },
}

/// An immutable chunk of audio samples plus precomputed summaries.
///
/// Blocks are shared between sequences (and between clips and their
/// cutlines) behind `Arc`. The on-disk file is removed when the last
/// reference drops, unless the block is locked.
#[derive(Debug)]
pub struct BlockFile {
    kind: BlockKind,
    len: usize,
    min: f32,
    max: f32,
    rms: f32,
    summary: SummaryInfo,
    lock_count: AtomicU32,
}

impl BlockFile {
    /// Write a new simple block file at `path` and describe it.
    pub fn new_simple(
        path: PathBuf,
        samples: &[f32],
        format: SampleFormat,
    ) -> Result<Arc<BlockFile>> {
        let summary = calc_summary(samples);
        au::write_block_file(&path, samples, format, &summary.data)?;
        Ok(Arc::new(BlockFile {
            kind: BlockKind::Simple { path, format },
            len: samples.len(),
            min: summary.min,
            max: summary.max,
            rms: summary.rms,
            summary: SummaryInfo::new(samples.len()),
            lock_count: AtomicU32::new(0),
        }))
    }

    /// Describe an existing simple block file without rewriting it.
    pub fn existing_simple(
        path: PathBuf,
        format: SampleFormat,
        len: usize,
        min: f32,
        max: f32,
        rms: f32,
    ) -> Arc<BlockFile> {
        Arc::new(BlockFile {
            kind: BlockKind::Simple { path, format },
            len,
            min,
            max,
            rms,
            summary: SummaryInfo::new(len),
            lock_count: AtomicU32::new(0),
        })
    }

    /// A block of silence with no backing file.
    pub fn silent(len: usize) -> Arc<BlockFile> {
        Arc::new(BlockFile {
            kind: BlockKind::Silent,
            len,
            min: 0.0,
            max: 0.0,
            rms: 0.0,
            summary: SummaryInfo::new(len),
            lock_count: AtomicU32::new(0),
        })
    }

    /// Write an alias block: summary stored at `summary_path`, sample
    /// data read on demand from channel `alias_channel` of the WAV
    /// file at `alias_path`, starting `alias_start` frames in.
    pub fn new_alias(
        summary_path: PathBuf,
        alias_path: PathBuf,
        alias_start: SampleCount,
        len: usize,
        alias_channel: u16,
    ) -> Result<Arc<BlockFile>> {
        let mut samples = vec![0f32; len];
        read_wav_region(&alias_path, alias_start, alias_channel, &mut samples)?;
        let summary = calc_summary(&samples);
        std::fs::write(&summary_path, &summary.data).map_err(|_| {
            Error::FileWrite { path: summary_path.clone() }
        })?;
        Ok(Arc::new(BlockFile {
            kind: BlockKind::Alias {
                summary_path,
                alias_path,
                alias_start,
                alias_channel,
            },
            len,
            min: summary.min,
            max: summary.max,
            rms: summary.rms,
            summary: SummaryInfo::new(len),
            lock_count: AtomicU32::new(0),
        }))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn rms(&self) -> f32 {
        self.rms
    }

    pub fn summary_info(&self) -> &SummaryInfo {
        &self.summary
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.kind, BlockKind::Alias { .. })
    }

    pub fn is_silent(&self) -> bool {
        matches!(self.kind, BlockKind::Silent)
    }

    /// The file this block owns on disk, if any.
    pub fn path(&self) -> Option<&Path> {
        match &self.kind {
            BlockKind::Simple { path, .. } => Some(path),
            BlockKind::Silent => None,
            BlockKind::Alias { summary_path, .. } => Some(summary_path),
        }
    }

    /// Base name (no directory, no extension) used as the registry key.
    pub fn name(&self) -> Option<String> {
        self.path().and_then(|p| {
            p.file_stem().map(|s| s.to_string_lossy().into_owned())
        })
    }

    /// While locked, the block's file survives even when the last
    /// reference drops. Used for files shared across projects.
    pub fn lock(&self) {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock(&self) {
        self.lock_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count.load(Ordering::Acquire) > 0
    }

    /// Read `dst.len()` samples starting at `start` into `dst`.
    ///
    /// Returns the number actually read. If `may_throw` is set a
    /// short read fails with `FileRead`; otherwise the tail of `dst`
    /// is zero-filled and the short count returned.
    pub fn read_data(
        &self,
        dst: &mut [f32],
        start: usize,
        may_throw: bool,
    ) -> Result<usize> {
        let wanted = dst.len();
        let got = match &self.kind {
            BlockKind::Silent => {
                dst.fill(0.0);
                wanted
            }
            BlockKind::Simple { path, .. } => match au::read_data(path, start, dst) {
                Ok(n) => n,
                Err(e) => {
                    if may_throw {
                        return Err(e);
                    }
                    debug!(path = %path.display(), "block read failed, zero-filling");
                    0
                }
            },
            BlockKind::Alias {
                alias_path,
                alias_start,
                alias_channel,
                ..
            } => match read_wav_region(
                alias_path,
                alias_start + start as SampleCount,
                *alias_channel,
                dst,
            ) {
                Ok(n) => n,
                Err(e) => {
                    if may_throw {
                        return Err(e);
                    }
                    debug!(path = %alias_path.display(), "alias read failed, zero-filling");
                    0
                }
            },
        };

        if got < wanted {
            if may_throw {
                let path = self
                    .path()
                    .map(Path::to_owned)
                    .unwrap_or_default();
                return Err(Error::FileRead { path });
            }
            warn!(wanted, got, "short block read");
            dst[got..].fill(0.0);
        }
        Ok(got)
    }

    /// Fill `out` with the on-disk summary section (header tag plus
    /// both decimation levels). Silent blocks read as zeros.
    pub fn read_summary(&self, out: &mut Vec<u8>) -> Result<()> {
        let total = self.summary.total_summary_bytes;
        match &self.kind {
            BlockKind::Silent => {
                out.clear();
                out.resize(total, 0);
                Ok(())
            }
            BlockKind::Simple { path, .. } => {
                *out = au::read_summary(path, total)?;
                Ok(())
            }
            BlockKind::Alias { summary_path, .. } => {
                *out = std::fs::read(summary_path).map_err(|_| {
                    Error::FileRead { path: summary_path.clone() }
                })?;
                out.truncate(total);
                Ok(())
            }
        }
    }

    /// An identical block description pointing at `new_path`. The
    /// caller is responsible for having copied the file contents.
    pub fn copy_to(&self, new_path: Option<PathBuf>) -> Arc<BlockFile> {
        match &self.kind {
            BlockKind::Silent => BlockFile::silent(self.len),
            BlockKind::Simple { format, path } => Arc::new(BlockFile {
                kind: BlockKind::Simple {
                    path: new_path.unwrap_or_else(|| path.clone()),
                    format: *format,
                },
                len: self.len,
                min: self.min,
                max: self.max,
                rms: self.rms,
                summary: self.summary,
                lock_count: AtomicU32::new(0),
            }),
            BlockKind::Alias {
                summary_path,
                alias_path,
                alias_start,
                alias_channel,
            } => Arc::new(BlockFile {
                kind: BlockKind::Alias {
                    summary_path: new_path.unwrap_or_else(|| summary_path.clone()),
                    alias_path: alias_path.clone(),
                    alias_start: *alias_start,
                    alias_channel: *alias_channel,
                },
                len: self.len,
                min: self.min,
                max: self.max,
                rms: self.rms,
                summary: self.summary,
                lock_count: AtomicU32::new(0),
            }),
        }
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        if !self.is_locked() {
            if let Some(path) = self.path() {
                if let Err(e) = std::fs::remove_file(path) {
                    debug!(path = %path.display(), error = %e, "could not remove block file");
                }
            }
        }
        DESTRUCTION_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read one channel of a WAV file starting at frame `start`.
/// Returns the number of frames read, which may be short.
fn read_wav_region(
    path: &Path,
    start: SampleCount,
    channel: u16,
    dst: &mut [f32],
) -> Result<usize> {
    let mut reader = hound::WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(source) => Error::FileOpen {
            path: path.to_owned(),
            source,
        },
        other => Error::Wav(other),
    })?;
    let spec = reader.spec();
    let channels = spec.channels.max(1);
    let channel = channel.min(channels - 1);

    let start = start.max(0) as u32;
    if start >= reader.duration() {
        return Ok(0);
    }
    reader
        .seek(start)
        .map_err(|_| Error::FileRead { path: path.to_owned() })?;

    let mut written = 0;
    match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, _) => {
            let mut samples = reader.samples::<f32>();
            'frames: for slot in dst.iter_mut() {
                let mut value = 0.0;
                for c in 0..channels {
                    match samples.next() {
                        Some(s) => {
                            let s = s.map_err(Error::Wav)?;
                            if c == channel {
                                value = s;
                            }
                        }
                        None => break 'frames,
                    }
                }
                *slot = value;
                written += 1;
            }
        }
        (hound::SampleFormat::Int, bits) => {
            let shift = 32 - bits as u32;
            let mut samples = reader.samples::<i32>();
            'frames: for slot in dst.iter_mut() {
                let mut value = 0.0;
                for c in 0..channels {
                    match samples.next() {
                        Some(s) => {
                            let s = s.map_err(Error::Wav)?;
                            if c == channel {
                                // normalize any integer width via i32
                                value = (s << shift) as f32 / 2147483648.0;
                            }
                        }
                        None => break 'frames,
                    }
                }
                *slot = value;
                written += 1;
            }
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, channels: u16, data: &[f32]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 44100,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in data {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_simple_block_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e0000abc.au");
        let samples: Vec<f32> = (0..500).map(|i| (i as f32 / 50.0).sin()).collect();
        let block =
            BlockFile::new_simple(path.clone(), &samples, SampleFormat::Float)
                .unwrap();

        assert_eq!(block.len(), 500);
        let mut out = vec![0f32; 100];
        block.read_data(&mut out, 200, true).unwrap();
        assert_eq!(out, &samples[200..300]);
        assert!(path.exists());
    }

    #[test]
    fn test_block_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e0000def.au");
        let block =
            BlockFile::new_simple(path.clone(), &[0.5; 64], SampleFormat::Int16)
                .unwrap();
        assert!(path.exists());
        let before = destruction_count();
        drop(block);
        assert!(!path.exists());
        assert_eq!(destruction_count(), before + 1);
    }

    #[test]
    fn test_locked_block_survives_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e0000aaa.au");
        let block =
            BlockFile::new_simple(path.clone(), &[0.5; 64], SampleFormat::Float)
                .unwrap();
        block.lock();
        drop(block);
        assert!(path.exists());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_silent_block() {
        let block = BlockFile::silent(256);
        let mut out = vec![1.0f32; 256];
        let got = block.read_data(&mut out, 0, true).unwrap();
        assert_eq!(got, 256);
        assert!(out.iter().all(|&s| s == 0.0));

        let mut summary = Vec::new();
        block.read_summary(&mut summary).unwrap();
        assert_eq!(summary.len(), block.summary_info().total_summary_bytes);
        assert!(summary.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_read_zero_fills_when_not_throwing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e0000bbb.au");
        let block =
            BlockFile::new_simple(path.clone(), &[0.5; 64], SampleFormat::Float)
                .unwrap();

        // Truncate the data section behind the block's back.
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        file.set_len(len - 64).unwrap();

        let mut out = vec![1.0f32; 64];
        let got = block.read_data(&mut out, 0, false).unwrap();
        assert_eq!(got, 48);
        assert!(out[48..].iter().all(|&s| s == 0.0));

        assert!(block.read_data(&mut out, 0, true).is_err());
    }

    #[test]
    fn test_alias_block_reads_external_channel() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("external.wav");
        // stereo: left ramps up, right ramps down
        let frames = 1000;
        let mut interleaved = Vec::new();
        for i in 0..frames {
            interleaved.push(i as f32 / frames as f32);
            interleaved.push(-(i as f32) / frames as f32);
        }
        write_wav(&wav, 2, &interleaved);

        let summary_path = dir.path().join("e0000ccc.auf");
        let block = BlockFile::new_alias(summary_path.clone(), wav, 100, 200, 1)
            .unwrap();
        assert!(block.is_alias());
        assert!(summary_path.exists());

        let mut out = vec![0f32; 10];
        block.read_data(&mut out, 0, true).unwrap();
        for (i, &s) in out.iter().enumerate() {
            let expected = -((100 + i) as f32) / frames as f32;
            assert!((s - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_copy_to_shares_content_description() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e0000ddd.au");
        let block =
            BlockFile::new_simple(path.clone(), &[0.25; 128], SampleFormat::Float)
                .unwrap();
        let new_path = dir.path().join("e0000eee.au");
        std::fs::copy(&path, &new_path).unwrap();
        let copy = block.copy_to(Some(new_path.clone()));
        assert_eq!(copy.len(), block.len());
        assert_eq!(copy.min(), block.min());

        let mut out = vec![0f32; 128];
        copy.read_data(&mut out, 0, true).unwrap();
        assert!(out.iter().all(|&s| s == 0.25));
    }
}
