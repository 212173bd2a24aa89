use byteorder::{ByteOrder, LittleEndian};

/// Fixed duration of one chunk on the buffer timeline.
pub const CHUNK_DURATION_MS: u64 = 20;

/// Signed 16-bit PCM.
pub const BYTES_PER_SAMPLE: u64 = 2;

/// Sample rates libopus can decode to.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Wall clock in milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes of one interleaved sample frame (one sample per channel).
    pub fn frame_bytes(&self) -> u64 {
        self.channels as u64 * BYTES_PER_SAMPLE
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.frame_bytes()
    }

    /// `bytes = duration * sample_rate * channels * bytes_per_sample`
    pub fn bytes_for_duration_ms(&self, duration_ms: u64) -> u64 {
        duration_ms * self.bytes_per_second() / 1000
    }

    pub fn duration_ms_of(&self, bytes: u64) -> u64 {
        bytes * 1000 / self.bytes_per_second()
    }

    /// Size of one fixed-duration timeline chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.bytes_for_duration_ms(CHUNK_DURATION_MS) as usize
    }

    pub fn is_frame_aligned(&self, bytes: usize) -> bool {
        bytes as u64 % self.frame_bytes() == 0
    }
}

pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * BYTES_PER_SAMPLE as usize];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_frame_sizes() {
        // 960 samples * 2 channels * 2 bytes
        assert_eq!(AudioFormat::new(48000, 2).chunk_bytes(), 3840);

        let format = AudioFormat::new(16000, 2);
        assert_eq!(format.chunk_bytes(), 1280);
        assert_eq!(format.duration_ms_of(1280), 20);
    }

    #[test]
    fn test_mono_formats() {
        let format = AudioFormat::new(8000, 1);
        assert_eq!(format.chunk_bytes(), 320);
        assert_eq!(format.bytes_for_duration_ms(1000), 16000);
        assert!(format.is_frame_aligned(320));
        assert!(!AudioFormat::new(8000, 2).is_frame_aligned(322));
    }

    #[test]
    fn test_sample_byte_conversion() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = samples_to_bytes(&samples);
        assert_eq!(&bytes[2..4], &[1, 0]);
        assert_eq!(&bytes[4..6], &[0xff, 0xff]);
        let mut decoded = vec![0i16; samples.len()];
        LittleEndian::read_i16_into(&bytes, &mut decoded);
        assert_eq!(decoded, samples);
    }
}
