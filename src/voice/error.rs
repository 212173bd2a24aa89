use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Opus error: {0}")]
    Opus(String),
    #[error("Decoded frame is empty")]
    Empty,
    #[error("Decoded {len} bytes, not a whole number of {frame_bytes}-byte sample frames")]
    Misaligned { len: usize, frame_bytes: u64 },
    #[error("Unsupported audio format: {sample_rate}Hz, {channels} channel(s)")]
    UnsupportedFormat { sample_rate: u32, channels: u16 },
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Voice connection dropped")]
    Disconnected,
    #[error("Voice receive failed: {0}")]
    Receive(String),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("No active recording for session {0}")]
    NoActiveSession(u64),
    #[error("Nothing to export for session {0}")]
    NothingToExport(u64),
    #[error("Failed to encode track for speaker {speaker}: {reason}")]
    Encode { speaker: u64, reason: String },
    #[error("Failed to write track {path}: {source}")]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
    #[error("Mixing failed: {0}")]
    Mix(String),
    #[error("Mixing did not finish within {0} seconds")]
    MixTimeout(u64),
}
