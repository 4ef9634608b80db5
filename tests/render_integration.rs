//! Mixdown and file round-trip scenarios.

use std::sync::Arc;

use strata::{
    export_wav, import_wav, Channel, DirManager, ExportSpec, Mixer, Progress,
    SampleFormat, WaveTrack,
};

fn project() -> (tempfile::TempDir, Arc<DirManager>) {
    let tmp = tempfile::tempdir().unwrap();
    let dir = DirManager::new(tmp.path().join("proj"));
    (tmp, dir)
}

fn dc_track(dir: &Arc<DirManager>, rate: u32, value: f32, len: usize) -> Arc<WaveTrack> {
    let mut track = WaveTrack::new(Arc::clone(dir), SampleFormat::Float, rate);
    track.append(&vec![value; len]).unwrap();
    track.flush().unwrap();
    Arc::new(track)
}

fn drain_mono(mixer: &mut Mixer) -> Vec<f32> {
    let mut out = Vec::new();
    loop {
        let n = mixer.process(8192).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(mixer.float_output(0));
    }
    out
}

#[test]
fn import_export_identity_via_pipeline() {
    let (tmp, dir) = project();
    let src = tmp.path().join("in.wav");
    let dst = tmp.path().join("out.wav");

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 44100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&src, spec).unwrap();
    for i in 0..44100u32 {
        let s = ((i as f64 / 37.0).sin() * 20000.0) as i16;
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();

    let mut tracks = Vec::new();
    assert_eq!(
        import_wav(&dir, &src, &mut tracks, |_| true).unwrap(),
        Progress::Success
    );
    let tracks: Vec<_> = tracks.into_iter().map(Arc::new).collect();
    assert_eq!(
        export_wav(&tracks, &dst, ExportSpec::default(), |_| true).unwrap(),
        Progress::Success
    );

    assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&dst).unwrap());
}

#[test]
fn two_dc_tracks_mix_to_double() {
    let (_tmp, dir) = project();
    let a = dc_track(&dir, 44100, 0.5, 44100);
    let b = dc_track(&dir, 44100, 0.5, 44100);

    let mut mixer = Mixer::new(
        vec![a, b],
        true,
        0.0,
        1.0,
        1,
        8192,
        true,
        44100.0,
        SampleFormat::Float,
        true,
        None,
    )
    .unwrap();

    let out = drain_mono(&mut mixer);
    assert_eq!(out.len(), 44100);
    assert!(out.iter().all(|&s| (s - 1.0).abs() < 1e-6));
}

#[test]
fn hard_right_pan_splits_channels() {
    let (_tmp, dir) = project();
    let mut panned = WaveTrack::new(Arc::clone(&dir), SampleFormat::Float, 44100);
    panned.append(&vec![0.5f32; 4410]).unwrap();
    panned.flush().unwrap();
    panned.set_pan(1.0);
    let panned = Arc::new(panned);
    let centered = dc_track(&dir, 44100, 0.5, 4410);

    let mut mixer = Mixer::new(
        vec![panned, centered],
        true,
        0.0,
        0.1,
        2,
        8192,
        true,
        44100.0,
        SampleFormat::Float,
        true,
        None,
    )
    .unwrap();

    let n = mixer.process(4096).unwrap();
    assert!(n > 0);
    for frame in mixer.float_output(0).chunks_exact(2) {
        // channel 0 hears only the centered track, channel 1 both
        assert!((frame[0] - 0.5).abs() < 1e-6);
        assert!((frame[1] - 1.0).abs() < 1e-6);
    }
}

#[test]
fn cross_rate_mix_length_matches_ratio() {
    let (_tmp, dir) = project();
    let track = dc_track(&dir, 48000, 0.5, 48000);

    let mut mixer = Mixer::new(
        vec![track],
        true,
        0.0,
        1.0,
        1,
        8192,
        true,
        44100.0,
        SampleFormat::Float,
        true,
        None,
    )
    .unwrap();

    let out = drain_mono(&mut mixer);
    let expected = (48000f64 * 44100.0 / 48000.0).round() as i64;
    assert!((out.len() as i64 - expected).abs() <= 1);
}

#[test]
fn envelope_shapes_the_mix() {
    let (_tmp, dir) = project();
    let mut track = WaveTrack::new(Arc::clone(&dir), SampleFormat::Float, 44100);
    track.append(&vec![1.0f32; 44100]).unwrap();
    track.flush().unwrap();
    {
        // fade from 1.0 down to 0.25 across the second
        let clip = &mut track.clips_mut()[0];
        let len = clip.envelope().track_len();
        clip.envelope_mut().insert_or_replace(0.0, 1.0);
        clip.envelope_mut().insert_or_replace(len, 0.25);
    }
    let track = Arc::new(track);

    let mut mixer = Mixer::new(
        vec![track],
        true,
        0.0,
        1.0,
        1,
        8192,
        true,
        44100.0,
        SampleFormat::Float,
        true,
        None,
    )
    .unwrap();

    let out = drain_mono(&mut mixer);
    assert_eq!(out.len(), 44100);
    assert!((out[0] - 1.0).abs() < 1e-2);
    assert!(out[11025] > out[33075]);
    assert!((out[44099] - 0.25).abs() < 2e-2);
}

#[test]
fn export_cancellation_leaves_partial_file() {
    let (tmp, dir) = project();
    let dst = tmp.path().join("partial.wav");
    let track = dc_track(&dir, 44100, 0.5, 10 * 44100);

    let mut calls = 0;
    let outcome = export_wav(
        &[track],
        &dst,
        ExportSpec::default(),
        |_| {
            calls += 1;
            calls < 2
        },
    )
    .unwrap();
    assert_eq!(outcome, Progress::Cancelled);
    assert!(dst.exists());

    // what was written is a readable WAV
    let reader = hound::WavReader::open(&dst).unwrap();
    assert!(reader.duration() > 0);
}

#[test]
fn stereo_import_keeps_channel_assignment_and_mixes_back() {
    let (tmp, dir) = project();
    let src = tmp.path().join("stereo.wav");

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&src, spec).unwrap();
    for _ in 0..4410 {
        writer.write_sample(8192i16).unwrap();
        writer.write_sample(-8192i16).unwrap();
    }
    writer.finalize().unwrap();

    let mut tracks = Vec::new();
    import_wav(&dir, &src, &mut tracks, |_| true).unwrap();
    assert_eq!(tracks[0].channel(), Channel::Left);
    assert_eq!(tracks[1].channel(), Channel::Right);
    let tracks: Vec<_> = tracks.into_iter().map(Arc::new).collect();

    let mut mixer = Mixer::new(
        tracks,
        true,
        0.0,
        0.1,
        2,
        8192,
        true,
        44100.0,
        SampleFormat::Float,
        true,
        None,
    )
    .unwrap();
    let n = mixer.process(4096).unwrap();
    assert!(n > 0);
    let expected = strata::f32_from_i16(8192);
    for frame in mixer.float_output(0).chunks_exact(2) {
        assert!((frame[0] - expected).abs() < 1e-6);
        assert!((frame[1] + expected).abs() < 1e-6);
    }
}

#[test]
fn envelope_discontinuity_limits_are_queryable() {
    // The canonical four-point envelope with a jump at 0.5.
    let mut env = strata::Envelope::new(false, 0.0, 2.0, 1.0);
    for (t, v) in [(0.0, 0.2), (0.5, 0.4), (0.5, 0.8), (1.0, 1.0)] {
        env.add_point_at_end(t, v);
    }

    assert!((env.value_relative(0.5, true) - 0.4).abs() < 1e-12);
    assert!((env.value_relative(0.5, false) - 0.8).abs() < 1e-12);
    assert!((env.value(0.25) - 0.3).abs() < 1e-12);
    assert!((env.value(0.75) - 0.9).abs() < 1e-12);
}
