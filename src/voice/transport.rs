use super::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// One encoded frame, stamped when the transport received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceFrame {
    pub payload: Vec<u8>,
    pub arrival_ms: i64,
}

/// Encoded frames for one speaker. The channel closing ends the subscription.
pub type FrameReceiver = mpsc::UnboundedReceiver<Result<VoiceFrame, TransportError>>;

/// A live voice connection for one session.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Speaker ids, sent every time a speaker starts talking.
    async fn speaking_events(&self) -> mpsc::UnboundedReceiver<u64>;

    /// Frames from `speaker` until they have been silent for `end_after_silence`.
    async fn subscribe(&self, speaker: u64, end_after_silence: Duration) -> FrameReceiver;
}
