//! Multi-resolution min/max/RMS summaries for fast visualization.
//!
//! Each block file carries two decimation levels: one triple per 256
//! source samples and one per 65536. Both are written after a fixed
//! 20-byte header tag, as three native-endian `f32`s per frame.

/// Identifies the summary section of a block file on disk.
pub const HEADER_TAG: &[u8; 20] = b"AudacityBlockFile112";

const FIELDS: usize = 3; // min, max, rms
const BYTES_PER_FRAME: usize = FIELDS * 4;

/// Byte layout of the summary section for a block of a given length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryInfo {
    pub frames_64k: usize,
    pub frames_256: usize,
    pub offset_64k: usize,
    pub offset_256: usize,
    pub total_summary_bytes: usize,
}

impl SummaryInfo {
    pub fn new(samples: usize) -> Self {
        let frames_64k = (samples + 65535) / 65536;
        // The 1:256 level is padded out to a multiple of 256 frames so
        // that every 1:65536 frame aggregates a full run beneath it.
        let frames_256 = frames_64k * 256;
        let offset_64k = HEADER_TAG.len();
        let offset_256 = offset_64k + frames_64k * BYTES_PER_FRAME;
        let total_summary_bytes = offset_256 + frames_256 * BYTES_PER_FRAME;
        Self {
            frames_64k,
            frames_256,
            offset_64k,
            offset_256,
            total_summary_bytes,
        }
    }
}

/// A computed summary section plus the block-level scalars.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    /// Header tag, 1:65536 frames, then 1:256 frames.
    pub data: Vec<u8>,
    pub min: f32,
    pub max: f32,
    pub rms: f32,
}

/// Parse `count` min/max/rms triples out of a summary byte buffer.
pub fn read_frames(data: &[u8], offset: usize, count: usize) -> Vec<[f32; 3]> {
    (0..count)
        .map(|i| {
            let at = offset + i * BYTES_PER_FRAME;
            let mut frame = [0f32; 3];
            for (f, chunk) in frame.iter_mut().zip(data[at..at + BYTES_PER_FRAME].chunks_exact(4)) {
                *f = f32::from_ne_bytes(chunk.try_into().unwrap());
            }
            frame
        })
        .collect()
}

/// Compute both decimation levels and the block-level scalars.
///
/// The last 1:256 bucket may cover fewer than 256 samples; its RMS is
/// exact for the samples it has, and the short tail is weighted out
/// of the aggregate 1:65536 RMS through `summaries - fraction`.
/// Padding frames beyond the real data hold `+inf/-inf/0` so they
/// cannot influence mins and maxes.
pub fn calc_summary(samples: &[f32]) -> BlockSummary {
    let len = samples.len();
    let info = SummaryInfo::new(len);

    if len == 0 {
        return BlockSummary {
            data: HEADER_TAG.to_vec(),
            min: 0.0,
            max: 0.0,
            rms: 0.0,
        };
    }

    let mut level_256 = vec![0f32; info.frames_256 * FIELDS];
    let mut level_64k = vec![0f32; info.frames_64k * FIELDS];

    let sum_len_256 = (len + 255) / 256;
    let mut total_squares = 0.0f64;
    let mut fraction = 0.0f64;
    let mut summaries = 256i64;

    for i in 0..sum_len_256 {
        let start = i * 256;
        let count = 256.min(len - start);
        if count < 256 {
            fraction = 1.0 - count as f64 / 256.0;
        }
        let bucket = &samples[start..start + count];
        let mut min = bucket[0];
        let mut max = bucket[0];
        let mut sumsq = 0.0f32;
        for &s in bucket {
            sumsq += s * s;
            if s < min {
                min = s;
            } else if s > max {
                max = s;
            }
        }
        total_squares += sumsq as f64;
        let rms = (sumsq as f64 / count as f64).sqrt() as f32;
        level_256[i * 3] = min;
        level_256[i * 3 + 1] = max;
        level_256[i * 3 + 2] = rms;
    }
    for i in sum_len_256..info.frames_256 {
        // Padding cannot contribute to min/max; the zero RMS values
        // would distort aggregates, so keep count of them.
        summaries -= 1;
        level_256[i * 3] = f32::INFINITY;
        level_256[i * 3 + 1] = f32::NEG_INFINITY;
        level_256[i * 3 + 2] = 0.0;
    }

    // Exact while the squares are still at hand.
    let rms = (total_squares / len as f64).sqrt() as f32;

    let sum_len_64k = (len + 65535) / 65536;
    for i in 0..sum_len_64k {
        let mut min = level_256[3 * (i * 256)];
        let mut max = level_256[3 * (i * 256) + 1];
        let mut sumsq = 0.0f32;
        for j in 0..256 {
            let at = 3 * (i * 256 + j);
            if level_256[at] < min {
                min = level_256[at];
            }
            if level_256[at + 1] > max {
                max = level_256[at + 1];
            }
            let r = level_256[at + 2];
            sumsq += r * r;
        }
        let denom = if i < sum_len_64k - 1 {
            256.0
        } else {
            summaries as f64 - fraction
        };
        level_64k[i * 3] = min;
        level_64k[i * 3 + 1] = max;
        level_64k[i * 3 + 2] = (sumsq as f64 / denom).sqrt() as f32;
    }
    for i in sum_len_64k..info.frames_64k {
        level_64k[i * 3] = f32::INFINITY;
        level_64k[i * 3 + 1] = f32::NEG_INFINITY;
        level_64k[i * 3 + 2] = 0.0;
    }

    let mut min = level_64k[0];
    let mut max = level_64k[1];
    for i in 1..sum_len_64k {
        if level_64k[3 * i] < min {
            min = level_64k[3 * i];
        }
        if level_64k[3 * i + 1] > max {
            max = level_64k[3 * i + 1];
        }
    }

    let mut data = Vec::with_capacity(info.total_summary_bytes);
    data.extend_from_slice(HEADER_TAG);
    for v in &level_64k {
        data.extend_from_slice(&v.to_ne_bytes());
    }
    for v in &level_256 {
        data.extend_from_slice(&v.to_ne_bytes());
    }
    debug_assert_eq!(data.len(), info.total_summary_bytes);

    BlockSummary { data, min, max, rms }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let info = SummaryInfo::new(65536);
        assert_eq!(info.frames_64k, 1);
        assert_eq!(info.frames_256, 256);
        assert_eq!(info.offset_64k, 20);
        assert_eq!(info.offset_256, 20 + 12);
        assert_eq!(info.total_summary_bytes, 20 + 12 + 256 * 12);

        let info = SummaryInfo::new(65537);
        assert_eq!(info.frames_64k, 2);
        assert_eq!(info.frames_256, 512);
    }

    #[test]
    fn test_constant_signal() {
        let samples = vec![0.5f32; 1000];
        let s = calc_summary(&samples);
        assert_eq!(s.min, 0.5);
        assert_eq!(s.max, 0.5);
        assert!((s.rms - 0.5).abs() < 1e-6);

        let info = SummaryInfo::new(1000);
        let frames = read_frames(&s.data, info.offset_256, info.frames_256);
        // 4 real buckets (3 full + 1 short), the rest padding
        for frame in &frames[..4] {
            assert_eq!(frame[0], 0.5);
            assert_eq!(frame[1], 0.5);
            assert!((frame[2] - 0.5).abs() < 1e-6);
        }
        for frame in &frames[4..] {
            assert_eq!(frame[0], f32::INFINITY);
            assert_eq!(frame[1], f32::NEG_INFINITY);
            assert_eq!(frame[2], 0.0);
        }
    }

    #[test]
    fn test_alternating_signal_min_max() {
        let samples: Vec<f32> =
            (0..512).map(|i| if i % 2 == 0 { 0.25 } else { -0.75 }).collect();
        let s = calc_summary(&samples);
        assert_eq!(s.min, -0.75);
        assert_eq!(s.max, 0.25);
    }

    #[test]
    fn test_short_tail_rms_weighting() {
        // 256 samples of 1.0 then 128 samples of 0.0: aggregate RMS
        // must weight the short bucket by its true length.
        let mut samples = vec![1.0f32; 256];
        samples.extend(std::iter::repeat(0.0).take(128));
        let s = calc_summary(&samples);
        let expected = (256.0f64 / 384.0).sqrt() as f32;
        assert!((s.rms - expected).abs() < 1e-6);

        let info = SummaryInfo::new(samples.len());
        let frames = read_frames(&s.data, info.offset_64k, 1);
        assert!((frames[0][2] - expected).abs() < 1e-3);
    }

    #[test]
    fn test_multi_64k_buckets() {
        let samples = vec![0.1f32; 70000];
        let s = calc_summary(&samples);
        let info = SummaryInfo::new(70000);
        assert_eq!(info.frames_64k, 2);
        let frames = read_frames(&s.data, info.offset_64k, 2);
        for frame in frames {
            assert_eq!(frame[0], 0.1);
            assert_eq!(frame[1], 0.1);
            assert!((frame[2] - 0.1).abs() < 1e-3);
        }
        assert!((s.rms - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_empty() {
        let s = calc_summary(&[]);
        assert_eq!(s.data.len(), 20);
        assert_eq!(s.rms, 0.0);
    }
}
