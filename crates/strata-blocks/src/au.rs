//! The `.au` on-disk layout used by simple block files.
//!
//! Layout: 24-byte au header, then the summary section (tag plus both
//! decimation levels), then the sample data in the block's storage
//! format. All header fields are native-endian `u32`s; the magic
//! doubles as the byte-order witness.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use strata_core::{
    f32_from_i16, f32_from_i24, i16_from_f32, i24_from_f32, Error, Result,
    SampleFormat,
};

pub const AU_MAGIC: u32 = 0x2e73_6e64; // ".snd"
pub const AU_HEADER_LEN: usize = 24;

const AU_SAMPLE_FORMAT_16: u32 = 3;
const AU_SAMPLE_FORMAT_24: u32 = 4;
const AU_SAMPLE_FORMAT_FLOAT: u32 = 6;

#[derive(Debug, Clone, Copy)]
pub struct AuHeader {
    pub magic: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub encoding: u32,
    pub sample_rate: u32,
    pub channels: u32,
}

impl AuHeader {
    pub fn format(&self) -> Result<SampleFormat> {
        match self.encoding {
            AU_SAMPLE_FORMAT_16 => Ok(SampleFormat::Int16),
            AU_SAMPLE_FORMAT_24 => Ok(SampleFormat::Int24),
            AU_SAMPLE_FORMAT_FLOAT => Ok(SampleFormat::Float),
            _ => Err(Error::inconsistency("au header encoding")),
        }
    }
}

fn encoding_of(format: SampleFormat) -> u32 {
    match format {
        SampleFormat::Int16 => AU_SAMPLE_FORMAT_16,
        SampleFormat::Int24 => AU_SAMPLE_FORMAT_24,
        SampleFormat::Float => AU_SAMPLE_FORMAT_FLOAT,
    }
}

/// Write a complete block file: header, summary section, samples.
pub fn write_block_file(
    path: &Path,
    samples: &[f32],
    format: SampleFormat,
    summary: &[u8],
) -> Result<()> {
    let write_failed = |_| Error::FileWrite { path: path.to_owned() };

    let file = File::create(path).map_err(write_failed)?;
    let mut out = BufWriter::new(file);

    let header = AuHeader {
        magic: AU_MAGIC,
        data_offset: (AU_HEADER_LEN + summary.len()) as u32,
        // dataSize is optional and we opt out
        data_size: 0xffff_ffff,
        encoding: encoding_of(format),
        sample_rate: 44100,
        channels: 1,
    };

    let mut head = [0u8; AU_HEADER_LEN];
    for (slot, field) in head.chunks_exact_mut(4).zip([
        header.magic,
        header.data_offset,
        header.data_size,
        header.encoding,
        header.sample_rate,
        header.channels,
    ]) {
        slot.copy_from_slice(&field.to_ne_bytes());
    }
    out.write_all(&head).map_err(write_failed)?;
    out.write_all(summary).map_err(write_failed)?;

    match format {
        SampleFormat::Int16 => {
            for &s in samples {
                out.write_all(&i16_from_f32(s).to_ne_bytes())
                    .map_err(write_failed)?;
            }
        }
        SampleFormat::Int24 => {
            // 24-bit samples are packed, not padded to 32 bits as
            // they are in memory; the top byte is discarded.
            for &s in samples {
                let bytes = i24_from_f32(s).to_le_bytes();
                out.write_all(&bytes[..3]).map_err(write_failed)?;
            }
        }
        SampleFormat::Float => {
            for &s in samples {
                out.write_all(&s.to_ne_bytes()).map_err(write_failed)?;
            }
        }
    }

    out.flush().map_err(write_failed)?;
    Ok(())
}

pub fn read_header(file: &mut File, path: &Path) -> Result<AuHeader> {
    let mut head = [0u8; AU_HEADER_LEN];
    file.read_exact(&mut head)
        .map_err(|_| Error::FileRead { path: path.to_owned() })?;
    let field = |i: usize| {
        u32::from_ne_bytes(head[i * 4..i * 4 + 4].try_into().unwrap())
    };
    let header = AuHeader {
        magic: field(0),
        data_offset: field(1),
        data_size: field(2),
        encoding: field(3),
        sample_rate: field(4),
        channels: field(5),
    };
    if header.magic != AU_MAGIC {
        return Err(Error::inconsistency("au header magic"));
    }
    Ok(header)
}

/// Read `dst.len()` samples starting at `start` (in samples) from the
/// data section, decoding into `f32`. Returns the number actually
/// read; the caller decides whether a short read is an error.
pub fn read_data(path: &Path, start: usize, dst: &mut [f32]) -> Result<usize> {
    let mut file = File::open(path).map_err(|source| Error::FileOpen {
        path: path.to_owned(),
        source,
    })?;
    let header = read_header(&mut file, path)?;
    let format = header.format()?;
    let disk_size = format.disk_size();

    file.seek(SeekFrom::Start(
        header.data_offset as u64 + (start * disk_size) as u64,
    ))
    .map_err(|_| Error::FileRead { path: path.to_owned() })?;

    let mut raw = vec![0u8; dst.len() * disk_size];
    let mut filled = 0;
    while filled < raw.len() {
        match file.read(&mut raw[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    let got = filled / disk_size;

    match format {
        SampleFormat::Int16 => {
            for (out, chunk) in dst.iter_mut().zip(raw.chunks_exact(2)).take(got) {
                *out = f32_from_i16(i16::from_ne_bytes(chunk.try_into().unwrap()));
            }
        }
        SampleFormat::Int24 => {
            for (out, chunk) in dst.iter_mut().zip(raw.chunks_exact(3)).take(got) {
                // restore the 3 disk bytes into the low 3 bytes of an
                // i32, then sign-extend
                let v = (chunk[0] as i32)
                    | (chunk[1] as i32) << 8
                    | (chunk[2] as i32) << 16;
                *out = f32_from_i24(v << 8 >> 8);
            }
        }
        SampleFormat::Float => {
            for (out, chunk) in dst.iter_mut().zip(raw.chunks_exact(4)).take(got) {
                *out = f32::from_ne_bytes(chunk.try_into().unwrap());
            }
        }
    }

    Ok(got)
}

/// Read the summary section (tag included) of a block file.
pub fn read_summary(path: &Path, total_summary_bytes: usize) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|source| Error::FileOpen {
        path: path.to_owned(),
        source,
    })?;
    file.seek(SeekFrom::Start(AU_HEADER_LEN as u64))
        .map_err(|_| Error::FileRead { path: path.to_owned() })?;
    let mut data = vec![0u8; total_summary_bytes];
    file.read_exact(&mut data)
        .map_err(|_| Error::FileRead { path: path.to_owned() })?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::calc_summary;

    fn round_trip(format: SampleFormat, samples: &[f32]) -> Vec<f32> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.au");
        let summary = calc_summary(samples);
        write_block_file(&path, samples, format, &summary.data).unwrap();
        let mut out = vec![0f32; samples.len()];
        let got = read_data(&path, 0, &mut out).unwrap();
        assert_eq!(got, samples.len());
        out
    }

    #[test]
    fn test_float_round_trip() {
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 / 100.0).sin()).collect();
        assert_eq!(round_trip(SampleFormat::Float, &samples), samples);
    }

    #[test]
    fn test_int16_round_trip() {
        let samples: Vec<f32> =
            (-500..500).map(|i| f32_from_i16(i as i16 * 7)).collect();
        assert_eq!(round_trip(SampleFormat::Int16, &samples), samples);
    }

    #[test]
    fn test_int24_round_trip_packing() {
        // values exercising all three packed bytes and the sign
        let values = [-8388608, -65536, -259, -1, 0, 1, 300, 70000, 8388607];
        let samples: Vec<f32> = values.iter().map(|&v| f32_from_i24(v)).collect();
        assert_eq!(round_trip(SampleFormat::Int24, &samples), samples);

        // 3 bytes per sample on disk
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.au");
        let summary = calc_summary(&samples);
        write_block_file(&path, &samples, SampleFormat::Int24, &summary.data)
            .unwrap();
        let expected =
            AU_HEADER_LEN + summary.data.len() + samples.len() * 3;
        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, expected);
    }

    #[test]
    fn test_offset_read() {
        let samples: Vec<f32> = (0..256).map(|i| i as f32 / 256.0).collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.au");
        let summary = calc_summary(&samples);
        write_block_file(&path, &samples, SampleFormat::Float, &summary.data)
            .unwrap();

        let mut out = vec![0f32; 16];
        let got = read_data(&path, 100, &mut out).unwrap();
        assert_eq!(got, 16);
        assert_eq!(out, &samples[100..116]);
    }

    #[test]
    fn test_short_read_reports_count() {
        let samples: Vec<f32> = vec![0.5; 64];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.au");
        let summary = calc_summary(&samples);
        write_block_file(&path, &samples, SampleFormat::Float, &summary.data)
            .unwrap();

        let mut out = vec![0f32; 100];
        let got = read_data(&path, 32, &mut out).unwrap();
        assert_eq!(got, 32);
    }

    #[test]
    fn test_summary_round_trip() {
        let samples: Vec<f32> = vec![0.25; 300];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.au");
        let summary = calc_summary(&samples);
        write_block_file(&path, &samples, SampleFormat::Float, &summary.data)
            .unwrap();
        let read = read_summary(&path, summary.data.len()).unwrap();
        assert_eq!(read, summary.data);
        assert_eq!(&read[..20], crate::HEADER_TAG);
    }
}
