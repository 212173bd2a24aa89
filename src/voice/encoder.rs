use super::audio::AudioFormat;
use super::buffer::Chunk;
use super::error::ExportError;
use byteorder::{LittleEndian, ReadBytesExt};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;

/// Writes one speaker's chunks to a single-track file.
pub trait TrackEncoder: Send + Sync {
    /// Returns the number of chunks written.
    fn encode(
        &self,
        chunks: &mut dyn Iterator<Item = Chunk>,
        format: AudioFormat,
        path: &Path,
    ) -> Result<usize, ExportError>;
}

pub struct WavTrackEncoder;

pub fn wav_spec(format: AudioFormat) -> WavSpec {
    WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

impl TrackEncoder for WavTrackEncoder {
    fn encode(
        &self,
        chunks: &mut dyn Iterator<Item = Chunk>,
        format: AudioFormat,
        path: &Path,
    ) -> Result<usize, ExportError> {
        let wav_error = |source| ExportError::Wav {
            path: path.to_path_buf(),
            source,
        };

        let mut writer = WavWriter::create(path, wav_spec(format)).map_err(wav_error)?;
        let mut written = 0;

        for chunk in chunks {
            let mut payload = &chunk.payload[..];
            while let Ok(sample) = payload.read_i16::<LittleEndian>() {
                writer.write_sample(sample).map_err(wav_error)?;
            }
            written += 1;
        }

        writer.finalize().map_err(wav_error)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn chunk(value: i16, silent: bool) -> Chunk {
        let payload: Vec<u8> = value.to_le_bytes().repeat(4);
        Chunk {
            payload: Arc::from(payload),
            start_ms: 0,
            end_ms: 20,
            inserted_at: 0,
            silent,
        }
    }

    #[test]
    fn test_writes_samples_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("track.wav");
        let format = AudioFormat::new(16000, 2);

        let mut chunks = vec![chunk(5, false), chunk(0, true), chunk(-3, false)].into_iter();
        let written = WavTrackEncoder.encode(&mut chunks, format, &path).unwrap();
        assert_eq!(written, 3);

        let mut reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 16000);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![5, 5, 5, 5, 0, 0, 0, 0, -3, -3, -3, -3]);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("track.wav");
        let result = WavTrackEncoder.encode(
            &mut std::iter::empty(),
            AudioFormat::new(16000, 1),
            &path,
        );
        assert!(matches!(result, Err(ExportError::Wav { .. })));
    }
}
