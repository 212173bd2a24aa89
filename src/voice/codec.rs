use super::audio::{samples_to_bytes, AudioFormat};
use super::error::DecodeError;
use audiopus::{coder::Decoder, Channels, SampleRate};
use parking_lot::Mutex;
use std::sync::Arc;

/// Longest packet Opus allows.
const MAX_FRAME_MS: usize = 120;

/// Turns one encoded voice frame into interleaved 16-bit PCM bytes.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, frame: &[u8]) -> Result<Vec<u8>, DecodeError>;
}

/// Builds one decoder per speaker, since Opus decoders carry state between packets.
pub type DecoderFactory =
    Arc<dyn Fn(AudioFormat) -> Result<Box<dyn FrameDecoder>, DecodeError> + Send + Sync>;

pub fn opus_decoder_factory() -> DecoderFactory {
    Arc::new(|format| {
        OpusFrameDecoder::new(format).map(|decoder| Box::new(decoder) as Box<dyn FrameDecoder>)
    })
}

pub struct OpusFrameDecoder {
    decoder: Mutex<Decoder>,
    format: AudioFormat,
    max_samples: usize,
}

impl OpusFrameDecoder {
    pub fn new(format: AudioFormat) -> Result<Self, DecodeError> {
        let unsupported = || DecodeError::UnsupportedFormat {
            sample_rate: format.sample_rate,
            channels: format.channels,
        };

        let sample_rate = match format.sample_rate {
            8000 => SampleRate::Hz8000,
            12000 => SampleRate::Hz12000,
            16000 => SampleRate::Hz16000,
            24000 => SampleRate::Hz24000,
            48000 => SampleRate::Hz48000,
            _ => return Err(unsupported()),
        };
        let channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => return Err(unsupported()),
        };

        let decoder =
            Decoder::new(sample_rate, channels).map_err(|e| DecodeError::Opus(e.to_string()))?;

        Ok(Self {
            decoder: Mutex::new(decoder),
            format,
            max_samples: format.sample_rate as usize * MAX_FRAME_MS / 1000
                * format.channels as usize,
        })
    }
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&self, frame: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if frame.is_empty() {
            return Err(DecodeError::Empty);
        }

        let mut pcm = vec![0i16; self.max_samples];
        let packet = frame
            .try_into()
            .map_err(|e: audiopus::Error| DecodeError::Opus(e.to_string()))?;
        let output = (&mut pcm[..])
            .try_into()
            .map_err(|e: audiopus::Error| DecodeError::Opus(e.to_string()))?;
        let per_channel = self
            .decoder
            .lock()
            .decode(Some(packet), output, false)
            .map_err(|e| DecodeError::Opus(e.to_string()))?;

        if per_channel == 0 {
            return Err(DecodeError::Empty);
        }

        pcm.truncate(per_channel * self.format.channels as usize);
        Ok(samples_to_bytes(&pcm))
    }
}

/// Frames that are already PCM, checked for sample-frame alignment.
#[cfg(test)]
pub struct PassthroughDecoder {
    pub format: AudioFormat,
}

#[cfg(test)]
impl FrameDecoder for PassthroughDecoder {
    fn decode(&self, frame: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if frame.is_empty() {
            return Err(DecodeError::Empty);
        }
        if !self.format.is_frame_aligned(frame.len()) {
            return Err(DecodeError::Misaligned {
                len: frame.len(),
                frame_bytes: self.format.frame_bytes(),
            });
        }
        Ok(frame.to_vec())
    }
}

#[cfg(test)]
pub fn passthrough_factory() -> DecoderFactory {
    Arc::new(|format| Ok(Box::new(PassthroughDecoder { format }) as Box<dyn FrameDecoder>))
}
