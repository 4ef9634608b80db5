//! End-to-end editing scenarios across the whole engine stack.

use std::sync::Arc;

use strata::{DirManager, SampleCount, SampleFormat, Sequence, WaveClip, WaveTrack};

fn project() -> (tempfile::TempDir, Arc<DirManager>) {
    let tmp = tempfile::tempdir().unwrap();
    let dir = DirManager::new(tmp.path().join("proj"));
    (tmp, dir)
}

fn signal(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as f64 / 73.0).sin() * 0.8) as f32)
        .collect()
}

fn sequence_content(seq: &Sequence) -> Vec<f32> {
    let mut out = vec![0f32; seq.num_samples() as usize];
    seq.get(&mut out, 0, true).unwrap();
    out
}

fn clip_content(clip: &WaveClip) -> Vec<f32> {
    let mut out = vec![0f32; clip.num_samples() as usize];
    clip.get_samples(&mut out, 0, true).unwrap();
    out
}

#[test]
fn paste_then_delete_restores_sequence() {
    let (_tmp, dir) = project();
    let mut seq = Sequence::new(Arc::clone(&dir), SampleFormat::Float);
    let data = signal(300_000);
    seq.append(&data).unwrap();
    let before = sequence_content(&seq);

    let copied = seq.copy(40_000, 140_000).unwrap();
    seq.paste(200_000, &copied).unwrap();
    seq.delete(200_000, 100_000).unwrap();

    assert_eq!(sequence_content(&seq), before);
    seq.check_consistency("round trip").unwrap();
}

#[test]
fn convert_to_same_format_is_identity() {
    let (_tmp, dir) = project();
    let mut seq = Sequence::new(Arc::clone(&dir), SampleFormat::Int16);
    let data: Vec<f32> = (0..50_000)
        .map(|i| strata::f32_from_i16((i % 30_000) as i16))
        .collect();
    seq.append(&data).unwrap();
    let before = sequence_content(&seq);

    assert!(!seq.convert_to_sample_format(SampleFormat::Int16).unwrap());
    assert_eq!(sequence_content(&seq), before);
}

#[test]
fn blocks_stay_contiguous_after_many_edits() {
    let (_tmp, dir) = project();
    let mut seq = Sequence::new(Arc::clone(&dir), SampleFormat::Float);
    seq.append(&signal(500_000)).unwrap();

    seq.delete(123_456, 20_000).unwrap();
    let copied = seq.copy(0, 60_000).unwrap();
    seq.paste(400_000, &copied).unwrap();
    seq.set_samples(None, 10_000, 5_000).unwrap();
    seq.delete(0, 1).unwrap();

    // invariant: starts form a strictly increasing chain from zero
    // and lengths sum to the total
    let blocks = seq.blocks();
    assert_eq!(blocks[0].start, 0);
    let mut pos: SampleCount = 0;
    for block in blocks {
        assert_eq!(block.start, pos);
        assert!(block.file.len() <= seq.max_block_size());
        pos += block.file.len() as SampleCount;
    }
    assert_eq!(pos, seq.num_samples());
}

#[test]
fn cutline_round_trip_reproduces_samples() {
    let (_tmp, dir) = project();
    let mut clip = WaveClip::new(Arc::clone(&dir), SampleFormat::Float, 44100);
    let data = signal(3 * 44100);
    clip.append(&data).unwrap();
    clip.flush().unwrap();

    clip.clear_and_add_cut_line(1.0, 2.0).unwrap();
    assert_eq!(clip.cut_lines().len(), 1);
    assert!((clip.cut_lines()[0].offset() - 1.0).abs() < 1e-9);

    // paste the remembered material into a fresh clip at the same
    // position it came from
    let mut fresh = WaveClip::new(Arc::clone(&dir), SampleFormat::Float, 44100);
    fresh.append(&data[..44100]).unwrap();
    fresh.flush().unwrap();
    fresh.paste(1.0, &clip.cut_lines()[0]).unwrap();

    let out = clip_content(&fresh);
    assert_eq!(out[44100..2 * 44100], data[44100..2 * 44100]);
}

#[test]
fn append_scenario_block_shapes() {
    // Empty int16 sequence, 524289 appended samples: exactly two
    // blocks of 524288 and 1; deleting the first 262144 leaves two
    // blocks summing to 262145, the first starting at zero.
    let (_tmp, dir) = project();
    let mut seq = Sequence::new(Arc::clone(&dir), SampleFormat::Int16);
    let data: Vec<f32> = (0..524_289)
        .map(|i| strata::f32_from_i16((i % 32_768) as i16))
        .collect();
    seq.append(&data).unwrap();

    let lens: Vec<usize> = seq.blocks().iter().map(|b| b.file.len()).collect();
    assert_eq!(lens, [524_288, 1]);

    seq.delete(0, 262_144).unwrap();
    let blocks = seq.blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].start, 0);
    assert_eq!(
        blocks.iter().map(|b| b.file.len()).sum::<usize>(),
        262_145
    );
}

#[test]
fn track_clear_and_paste_preserves_surroundings() {
    let (_tmp, dir) = project();
    let mut track = WaveTrack::new(Arc::clone(&dir), SampleFormat::Float, 44100);
    let data = signal(3 * 44100);
    track.append(&data).unwrap();
    track.flush().unwrap();

    let mut replacement = WaveTrack::new(Arc::clone(&dir), SampleFormat::Float, 44100);
    let patch = vec![0.123f32; 44100];
    replacement.append(&patch).unwrap();
    replacement.flush().unwrap();

    track
        .clear_and_paste(1.0, 2.0, &replacement, false, true, None)
        .unwrap();

    let mut out = vec![0f32; 3 * 44100];
    track.get(&mut out, 0, true).unwrap();
    assert_eq!(out[..44100], data[..44100]);
    assert!(out[44100..2 * 44100].iter().all(|&s| s == 0.123));
    assert_eq!(out[2 * 44100..], data[2 * 44100..]);
}

#[test]
fn split_then_merge_is_lossless() {
    let (_tmp, dir) = project();
    let mut track = WaveTrack::new(Arc::clone(&dir), SampleFormat::Float, 44100);
    let data = signal(2 * 44100);
    track.append(&data).unwrap();
    track.flush().unwrap();

    track.split_at(0.7).unwrap();
    track.split_at(1.3).unwrap();
    assert_eq!(track.num_clips(), 3);

    while track.num_clips() > 1 {
        let order = track.sorted_clip_indices();
        track.merge_clips(order[0], order[1]).unwrap();
    }

    let mut out = vec![0f32; 2 * 44100];
    track.get(&mut out, 0, true).unwrap();
    assert_eq!(out, data);
}

#[test]
fn block_files_disappear_with_their_sequences() {
    let (_tmp, dir) = project();
    {
        let mut seq = Sequence::new(Arc::clone(&dir), SampleFormat::Float);
        seq.append(&signal(400_000)).unwrap();
        assert!(dir.live_blocks() > 0);
    }
    assert_eq!(dir.live_blocks(), 0);
}
