use super::audio::now_ms;
use super::error::TransportError;
use super::transport::{FrameReceiver, VoiceFrame, VoiceTransport};
use byteorder::{BigEndian, ByteOrder};
use songbird::{
    Call, CoreEvent, Event, EventContext, EventHandler, events::context_data::VoiceTick,
    model::payload::Speaking,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

struct Subscription {
    tx: mpsc::UnboundedSender<Result<VoiceFrame, TransportError>>,
    end_after_silence: Duration,
    last_voice: Instant,
}

/// What songbird has told us about the call so far.
pub struct ReceiverState {
    pub ssrc_map: HashMap<u32, u64>,
    speaking: HashSet<u64>,
    listeners: Vec<mpsc::UnboundedSender<u64>>,
    subscriptions: HashMap<u64, Subscription>,
}

impl ReceiverState {
    pub fn new() -> Self {
        Self {
            ssrc_map: HashMap::new(),
            speaking: HashSet::new(),
            listeners: Vec::new(),
            subscriptions: HashMap::new(),
        }
    }

    fn add_listener(&mut self) -> mpsc::UnboundedReceiver<u64> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    fn subscribe(&mut self, speaker: u64, end_after_silence: Duration) -> FrameReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.insert(
            speaker,
            Subscription {
                tx,
                end_after_silence,
                last_voice: Instant::now(),
            },
        );
        rx
    }

    /// `voiced` holds the Opus payload of every mapped speaker heard this tick.
    /// Frames are stamped with `arrival_ms`.
    fn handle_tick(&mut self, voiced: &HashMap<u64, Vec<u8>>, now: Instant, arrival_ms: i64) {
        self.speaking.retain(|speaker| voiced.contains_key(speaker));

        for speaker in voiced.keys() {
            if self.speaking.insert(*speaker) {
                self.listeners.retain(|tx| tx.send(*speaker).is_ok());
            }
        }

        self.subscriptions.retain(|speaker, sub| {
            if let Some(frame) = voiced.get(speaker) {
                sub.last_voice = now;
                let frame = VoiceFrame {
                    payload: frame.clone(),
                    arrival_ms,
                };
                return sub.tx.send(Ok(frame)).is_ok();
            }
            let open = !sub.tx.is_closed()
                && now.duration_since(sub.last_voice) < sub.end_after_silence;
            if !open {
                debug!("Ending subscription for speaker {}", speaker);
            }
            open
        });
    }

    fn fail_all(&mut self, error: TransportError) {
        for (_, sub) in self.subscriptions.drain() {
            let _ = sub.tx.send(Err(error.clone()));
        }
        self.speaking.clear();
    }
}

impl Default for ReceiverState {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed RTP header, before any CSRC entries.
const RTP_HEADER_LEN: usize = 12;

/// Opus frame inside a decrypted RTP packet. `payload_offset..payload_end`
/// is the range songbird reports within the RTP payload; a header extension
/// at its start is skipped.
fn opus_payload(packet: &[u8], payload_offset: usize, payload_end: usize) -> Option<&[u8]> {
    let first = *packet.first()?;
    let csrc_count = (first & 0x0f) as usize;
    let has_extension = first & 0x10 != 0;

    let payload = packet.get(RTP_HEADER_LEN + 4 * csrc_count..)?;
    let mut body = payload.get(payload_offset..payload_end)?;

    if has_extension {
        let words = BigEndian::read_u16(body.get(2..4)?) as usize;
        body = body.get(4 + 4 * words..)?;
    }

    (!body.is_empty()).then_some(body)
}

pub type SharedReceiverState = Arc<Mutex<ReceiverState>>;

pub struct Receiver {
    state: SharedReceiverState,
}

impl Receiver {
    pub fn new(state: SharedReceiverState) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl EventHandler for Receiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(Speaking {
                ssrc,
                user_id,
                ..
            }) => {
                if let Some(user_id) = user_id {
                    let mut state = self.state.lock().await;
                    state.ssrc_map.insert(*ssrc, user_id.0);
                }
            }
            EventContext::VoiceTick(VoiceTick { speaking, .. }) => {
                let mut state = self.state.lock().await;

                let voiced: HashMap<u64, Vec<u8>> = speaking
                    .iter()
                    .filter_map(|(ssrc, voice_data)| {
                        let speaker = state.ssrc_map.get(ssrc)?;
                        let rtp = voice_data.packet.as_ref()?;
                        let payload =
                            opus_payload(&rtp.packet, rtp.payload_offset, rtp.payload_end_pad)?;
                        Some((*speaker, payload.to_vec()))
                    })
                    .collect();

                state.handle_tick(&voiced, Instant::now(), now_ms());
            }
            EventContext::DriverDisconnect(_) => {
                warn!("Voice driver disconnected, ending all subscriptions");
                self.state.lock().await.fail_all(TransportError::Disconnected);
            }
            _ => {}
        }

        None
    }
}

/// Voice receive for one songbird call.
pub struct SongbirdTransport {
    state: SharedReceiverState,
}

impl SongbirdTransport {
    pub fn attach(call: &mut Call) -> Self {
        let state: SharedReceiverState = Arc::new(Mutex::new(ReceiverState::new()));

        call.add_global_event(
            CoreEvent::SpeakingStateUpdate.into(),
            Receiver::new(Arc::clone(&state)),
        );
        call.add_global_event(CoreEvent::VoiceTick.into(), Receiver::new(Arc::clone(&state)));
        call.add_global_event(
            CoreEvent::DriverDisconnect.into(),
            Receiver::new(Arc::clone(&state)),
        );

        Self { state }
    }
}

#[async_trait::async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn speaking_events(&self) -> mpsc::UnboundedReceiver<u64> {
        self.state.lock().await.add_listener()
    }

    async fn subscribe(&self, speaker: u64, end_after_silence: Duration) -> FrameReceiver {
        self.state.lock().await.subscribe(speaker, end_after_silence)
    }
}
