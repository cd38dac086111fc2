use anyhow::{Context, Result};
use std::{
    fs::File,
    io::{BufWriter, Seek, SeekFrom, Write},
    path::Path,
};

const HEADER_LEN: u32 = 44;
const BITS_PER_SAMPLE: u16 = 16;

/// Largest data chunk whose RIFF size still fits in a `u32`.
pub const MAX_DATA_LEN: u32 = u32::MAX - (HEADER_LEN - 8);

/// Streams 16-bit PCM to a RIFF/WAVE file. Sizes in the header are written
/// as zero up front and patched by [`finalize`](Self::finalize).
///
/// The file holds at most [`MAX_DATA_LEN`] bytes of audio; once
/// [`is_full`](Self::is_full) the caller has to continue in a new file.
pub struct WavWriter {
    out: BufWriter<File>,
    data_len: u32,
    capacity: u32,
    block_align: u16,
}

impl WavWriter {
    pub fn create(path: &Path, channels: u16, sample_rate: u32) -> Result<Self> {
        Self::create_with_limit(path, channels, sample_rate, MAX_DATA_LEN)
    }

    /// `limit` is clamped to [`MAX_DATA_LEN`] and rounded down to whole frames.
    pub(crate) fn create_with_limit(
        path: &Path,
        channels: u16,
        sample_rate: u32,
        limit: u32,
    ) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create recording {}", path.display()))?;
        let mut out = BufWriter::new(file);

        let block_align = channels * BITS_PER_SAMPLE / 8;
        let byte_rate = sample_rate * u32::from(block_align);

        out.write_all(b"RIFF")?;
        out.write_all(&0u32.to_le_bytes())?;
        out.write_all(b"WAVE")?;
        out.write_all(b"fmt ")?;
        out.write_all(&16u32.to_le_bytes())?;
        out.write_all(&1u16.to_le_bytes())?;
        out.write_all(&channels.to_le_bytes())?;
        out.write_all(&sample_rate.to_le_bytes())?;
        out.write_all(&byte_rate.to_le_bytes())?;
        out.write_all(&block_align.to_le_bytes())?;
        out.write_all(&BITS_PER_SAMPLE.to_le_bytes())?;
        out.write_all(b"data")?;
        out.write_all(&0u32.to_le_bytes())?;

        let limit = limit.min(MAX_DATA_LEN);
        let capacity = limit - limit % u32::from(block_align.max(1));
        Ok(Self {
            out,
            data_len: 0,
            capacity,
            block_align,
        })
    }

    /// Write as many whole frames of `samples` as still fit and return how
    /// many samples that was.
    pub fn write_samples(&mut self, samples: &[i16]) -> Result<usize> {
        let remaining = (self.capacity - self.data_len) as usize;
        let frame = usize::from(self.block_align.max(1));
        let fit = (samples.len() * 2).min(remaining);
        let take = (fit - fit % frame) / 2;

        for sample in &samples[..take] {
            self.out.write_all(&sample.to_le_bytes())?;
        }
        // take * 2 <= capacity - data_len, so this stays within capacity.
        self.data_len += (take * 2) as u32;
        Ok(take)
    }

    pub fn is_full(&self) -> bool {
        self.capacity - self.data_len < u32::from(self.block_align.max(1))
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    pub fn finalize(mut self) -> Result<()> {
        let riff_len = self
            .data_len
            .checked_add(HEADER_LEN - 8)
            .context("recording too large for a WAV header")?;
        self.out.seek(SeekFrom::Start(4))?;
        self.out.write_all(&riff_len.to_le_bytes())?;
        self.out.seek(SeekFrom::Start(40))?;
        self.out.write_all(&self.data_len.to_le_bytes())?;
        self.out.flush().context("Failed to flush recording")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn header_sizes_are_patched_on_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("night.wav");

        let mut writer = WavWriter::create(&path, 1, 12_000).unwrap();
        writer.write_samples(&[0, 1, -1, i16::MAX]).unwrap();
        writer.write_samples(&[i16::MIN]).unwrap();
        writer.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 44 + 10);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32_at(&bytes, 4), 36 + 10);
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(u32_at(&bytes, 24), 12_000);
        assert_eq!(u32_at(&bytes, 28), 24_000);
        assert_eq!(u32_at(&bytes, 40), 10);
        assert_eq!(&bytes[50..52], &i16::MAX.to_le_bytes());
    }

    #[test]
    fn writes_stop_at_the_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capped.wav");

        let mut writer = WavWriter::create_with_limit(&path, 1, 8_000, 7).unwrap();
        assert_eq!(writer.write_samples(&[1, 2]).unwrap(), 2);
        assert!(!writer.is_full());
        assert_eq!(writer.write_samples(&[3, 4, 5]).unwrap(), 1);
        assert!(writer.is_full());
        assert_eq!(writer.write_samples(&[6]).unwrap(), 0);
        assert_eq!(writer.data_len(), 6);
        writer.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 44 + 6);
        assert_eq!(u32_at(&bytes, 4), 36 + 6);
        assert_eq!(u32_at(&bytes, 40), 6);
    }

    #[test]
    fn limit_keeps_whole_stereo_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");

        let mut writer = WavWriter::create_with_limit(&path, 2, 8_000, 10).unwrap();
        assert_eq!(writer.write_samples(&[1, 1, 2, 2, 3, 3]).unwrap(), 4);
        assert!(writer.is_full());
        assert_eq!(writer.data_len(), 8);
    }

    #[test]
    fn full_size_header_does_not_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.wav");

        let mut writer = WavWriter::create(&path, 1, 44_100).unwrap();
        assert_eq!(writer.capacity, MAX_DATA_LEN - MAX_DATA_LEN % 2);
        writer.data_len = writer.capacity;
        assert!(writer.is_full());
        assert_eq!(writer.write_samples(&[1, 2, 3]).unwrap(), 0);
        writer.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(u32_at(&bytes, 4), MAX_DATA_LEN - MAX_DATA_LEN % 2 + 36);
        assert_eq!(u32_at(&bytes, 40), MAX_DATA_LEN - MAX_DATA_LEN % 2);
    }

    #[test]
    fn empty_recording_is_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");

        WavWriter::create(&path, 2, 44_100).unwrap().finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 44);
        assert_eq!(u32_at(&bytes, 40), 0);
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 2);
    }
}
