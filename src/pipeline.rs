//! WAV import and export over the engine.
//!
//! Import reads a PCM file into one track per channel, appending in
//! chunks through the clips' buffered append path. Export pulls a
//! mixdown of the given tracks through a [`Mixer`] and encodes it.
//! Both report progress through a callback whose `false` return
//! cancels the operation between iterations; output already written
//! at that point stays on disk.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use strata_core::{Error, Progress, Result, SampleFormat};
use strata_mix::{Mixer, MixerSpec};
use strata_track::{Channel, WaveTrack};

use strata_blocks::DirManager;

// Frames pulled from the mixer per export iteration.
const EXPORT_BLOCK_LEN: usize = 44100 * 5;

static CODEC_MUTEX: Mutex<()> = Mutex::new(());

/// Serializes file-codec calls; the codec layer is treated as
/// non-reentrant. This is the pipeline's only guaranteed suspension
/// point.
pub fn codec_lock() -> MutexGuard<'static, ()> {
    CODEC_MUTEX.lock()
}

/// How to encode an export.
#[derive(Debug, Clone)]
pub struct ExportSpec {
    /// Seconds; `None` spans the tracks' full extent.
    pub t0: Option<f64>,
    pub t1: Option<f64>,
    pub format: SampleFormat,
    pub num_channels: usize,
    pub mixer_spec: Option<MixerSpec>,
}

impl Default for ExportSpec {
    fn default() -> Self {
        ExportSpec {
            t0: None,
            t1: None,
            format: SampleFormat::Int16,
            num_channels: 1,
            mixer_spec: None,
        }
    }
}

/// Import a WAV file as one [`WaveTrack`] per channel, pushed onto
/// `tracks`. `on_progress` receives the completed fraction; return
/// `false` from it to cancel, keeping the tracks imported so far out
/// of the result.
pub fn import_wav(
    dir: &Arc<DirManager>,
    path: impl AsRef<Path>,
    tracks: &mut Vec<WaveTrack>,
    mut on_progress: impl FnMut(f32) -> bool,
) -> Result<Progress> {
    let path = path.as_ref();

    let _codec = codec_lock();
    let mut reader = hound::WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(source) => Error::FileOpen { path: path.to_owned(), source },
        other => Error::Wav(other),
    })?;
    let spec = reader.spec();
    let num_channels = spec.channels.max(1) as usize;
    let total_frames = reader.duration() as u64;

    // Keep the storage width of the source: 16-bit files stay 16-bit
    // on disk, anything wider is stored as float.
    let format = if spec.bits_per_sample <= 16 && spec.sample_format == hound::SampleFormat::Int
    {
        SampleFormat::Int16
    } else {
        SampleFormat::Float
    };

    let mut channels: Vec<WaveTrack> = (0..num_channels)
        .map(|c| {
            let mut track = WaveTrack::new(Arc::clone(dir), format, spec.sample_rate);
            if num_channels > 1 {
                track.set_channel(match c {
                    0 => Channel::Left,
                    1 => Channel::Right,
                    _ => Channel::Mono,
                });
            }
            track
        })
        .collect();

    let max_block = channels[0].max_block_size();
    let mut interleaved: Vec<f32> = Vec::with_capacity(max_block * num_channels);
    let mut deinterleaved = vec![0f32; max_block];
    let mut frames_completed: u64 = 0;

    debug!(path = %path.display(), num_channels, total_frames, "importing WAV");

    let shift = 32 - spec.bits_per_sample as u32;
    let mut next_sample: Box<
        dyn FnMut() -> Option<std::result::Result<f32, hound::Error>> + '_,
    > = match spec.sample_format {
        hound::SampleFormat::Float => {
            let mut samples = reader.samples::<f32>();
            Box::new(move || samples.next())
        }
        hound::SampleFormat::Int => {
            let mut samples = reader.samples::<i32>();
            Box::new(move || {
                samples
                    .next()
                    .map(|s| s.map(|v| (v << shift) as f32 / 2147483648.0))
            })
        }
    };

    loop {
        let block_frames = (max_block as u64).min(total_frames - frames_completed) as usize;
        if block_frames == 0 {
            break;
        }

        interleaved.clear();
        for _ in 0..block_frames * num_channels {
            match next_sample() {
                Some(sample) => interleaved.push(sample.map_err(Error::Wav)?),
                None => break,
            }
        }
        let got_frames = interleaved.len() / num_channels;
        if got_frames == 0 {
            break;
        }

        for (c, track) in channels.iter_mut().enumerate() {
            for (j, slot) in deinterleaved[..got_frames].iter_mut().enumerate() {
                *slot = interleaved[num_channels * j + c];
            }
            track.append(&deinterleaved[..got_frames])?;
        }

        frames_completed += got_frames as u64;
        if !on_progress(frames_completed as f32 / total_frames.max(1) as f32) {
            warn!(path = %path.display(), "import cancelled");
            return Ok(Progress::Cancelled);
        }
    }

    for track in &mut channels {
        track.flush()?;
    }
    tracks.append(&mut channels);

    Ok(Progress::Success)
}

/// Mix `tracks` down and encode them as a WAV file at `path`.
///
/// The output rate is the first track's rate. Integer widths clip;
/// floats are written as-is. Cancellation leaves the partial file on
/// disk.
pub fn export_wav(
    tracks: &[Arc<WaveTrack>],
    path: impl AsRef<Path>,
    spec: ExportSpec,
    mut on_progress: impl FnMut(f32) -> bool,
) -> Result<Progress> {
    let path = path.as_ref();
    let Some(first) = tracks.first() else {
        return Ok(Progress::Failed);
    };

    let rate = first.rate();
    let t0 = spec
        .t0
        .unwrap_or_else(|| tracks.iter().map(|t| t.start_time()).fold(f64::MAX, f64::min));
    let t1 = spec
        .t1
        .unwrap_or_else(|| tracks.iter().map(|t| t.end_time()).fold(0.0, f64::max));

    let wav_spec = hound::WavSpec {
        channels: spec.num_channels as u16,
        sample_rate: rate,
        bits_per_sample: spec.format.bits(),
        sample_format: match spec.format {
            SampleFormat::Float => hound::SampleFormat::Float,
            _ => hound::SampleFormat::Int,
        },
    };

    let mut mixer = Mixer::new(
        tracks.to_vec(),
        true,
        t0,
        t1,
        spec.num_channels,
        EXPORT_BLOCK_LEN,
        true,
        rate as f64,
        spec.format,
        true,
        spec.mixer_spec,
    )?;

    let _codec = codec_lock();
    let mut writer = hound::WavWriter::create(path, wav_spec)
        .map_err(|_| Error::FileWrite { path: path.to_owned() })?;

    let outcome = loop {
        let frames = mixer.process(EXPORT_BLOCK_LEN)?;
        if frames == 0 {
            break Progress::Success;
        }

        let mixed = mixer.float_output(0);
        let write_failed = |_| Error::FileWrite { path: path.to_owned() };
        match spec.format {
            SampleFormat::Int16 => {
                for &s in mixed {
                    writer
                        .write_sample(strata_core::i16_from_f32(s))
                        .map_err(write_failed)?;
                }
            }
            SampleFormat::Int24 => {
                for &s in mixed {
                    writer
                        .write_sample(strata_core::i24_from_f32(s))
                        .map_err(write_failed)?;
                }
            }
            SampleFormat::Float => {
                for &s in mixed {
                    writer.write_sample(s).map_err(write_failed)?;
                }
            }
        }

        if !on_progress(((mixer.time() - t0) / (t1 - t0 + f64::EPSILON)).abs() as f32) {
            warn!(path = %path.display(), "export cancelled");
            // Close out what was written; the partial file stays.
            writer
                .finalize()
                .map_err(|_| Error::FileWrite { path: path.to_owned() })?;
            return Ok(Progress::Cancelled);
        }
    };

    writer
        .finalize()
        .map_err(|_| Error::FileWrite { path: path.to_owned() })?;

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav_i16(path: &Path, rate: u32, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_import_builds_one_track_per_channel() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DirManager::new(tmp.path().join("proj"));
        let wav = tmp.path().join("stereo.wav");

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&wav, spec).unwrap();
        for i in 0..1000i16 {
            writer.write_sample(i).unwrap(); // left
            writer.write_sample(-i).unwrap(); // right
        }
        writer.finalize().unwrap();

        let mut tracks = Vec::new();
        let outcome = import_wav(&dir, &wav, &mut tracks, |_| true).unwrap();
        assert_eq!(outcome, Progress::Success);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].channel(), Channel::Left);
        assert_eq!(tracks[1].channel(), Channel::Right);
        assert_eq!(tracks[0].clips()[0].num_samples(), 1000);

        let mut out = vec![0f32; 1000];
        tracks[1].get(&mut out, 0, true).unwrap();
        for (i, &s) in out.iter().enumerate() {
            assert_eq!(s, strata_core::f32_from_i16(-(i as i16)));
        }
    }

    #[test]
    fn test_import_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DirManager::new(tmp.path().join("proj"));
        let wav = tmp.path().join("mono.wav");
        write_wav_i16(&wav, 44100, &vec![100i16; 44100]);

        let mut tracks = Vec::new();
        let outcome = import_wav(&dir, &wav, &mut tracks, |_| false).unwrap();
        assert_eq!(outcome, Progress::Cancelled);
        assert!(tracks.is_empty());
    }

    #[test]
    fn test_import_export_identity_int16() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DirManager::new(tmp.path().join("proj"));
        let src = tmp.path().join("in.wav");
        let dst = tmp.path().join("out.wav");

        let samples: Vec<i16> = (0..44100)
            .map(|i| ((i as f64 / 50.0).sin() * 12000.0) as i16)
            .collect();
        write_wav_i16(&src, 44100, &samples);

        let mut tracks = Vec::new();
        import_wav(&dir, &src, &mut tracks, |_| true).unwrap();
        let tracks: Vec<_> = tracks.into_iter().map(Arc::new).collect();

        let outcome =
            export_wav(&tracks, &dst, ExportSpec::default(), |_| true).unwrap();
        assert_eq!(outcome, Progress::Success);

        let a = std::fs::read(&src).unwrap();
        let b = std::fs::read(&dst).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_export_empty_track_list_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("out.wav");
        let outcome = export_wav(&[], &dst, ExportSpec::default(), |_| true).unwrap();
        assert_eq!(outcome, Progress::Failed);
    }
}
