//! Tracks which speakers are being recorded in which session.

use super::audio::AudioFormat;
use super::buffer::{BufferConfig, ReplayBuffer};
use super::codec::DecoderFactory;
use super::error::DecodeError;
use super::transport::{FrameReceiver, VoiceTransport};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Decides whether a speaker who starts talking gets recorded.
pub type SpeakerFilter = Arc<dyn Fn(u64) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub format: AudioFormat,
    /// Retention window, also how long a speaker may stay silent before
    /// their subscription ends.
    pub retention: Duration,
    pub max_bytes_per_speaker: usize,
    pub eviction_interval: Duration,
}

struct SpeakerTrack {
    buffer: Arc<ReplayBuffer>,
    ingest: JoinHandle<()>,
}

struct SessionState {
    listener: JoinHandle<()>,
    speakers: Arc<DashMap<u64, SpeakerTrack>>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SpeakerStatus {
    pub speaker: u64,
    pub retained_ms: i64,
    pub retained_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct StoppedSession {
    pub started_at: DateTime<Utc>,
    pub speakers: usize,
}

impl StoppedSession {
    pub fn duration(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

pub struct SessionRegistry {
    config: RegistryConfig,
    decoders: DecoderFactory,
    sessions: DashMap<u64, SessionState>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, decoders: DecoderFactory) -> Self {
        Self {
            config,
            decoders,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Starts buffering every speaker in `session` that passes `filter`.
    /// Returns `false` if the session was already recording.
    pub async fn start_recording(
        &self,
        session: u64,
        transport: Arc<dyn VoiceTransport>,
        filter: SpeakerFilter,
    ) -> bool {
        if self.sessions.contains_key(&session) {
            debug!("Session {} is already recording", session);
            return false;
        }

        let mut events = transport.speaking_events().await;
        let speakers: Arc<DashMap<u64, SpeakerTrack>> = Arc::new(DashMap::new());

        let listener = {
            let speakers = Arc::clone(&speakers);
            let config = self.config.clone();
            let decoders = Arc::clone(&self.decoders);

            tokio::spawn(async move {
                while let Some(speaker) = events.recv().await {
                    if !filter(speaker) {
                        continue;
                    }

                    if speakers.contains_key(&speaker) {
                        continue;
                    }

                    let decoder = match decoders(config.format) {
                        Ok(decoder) => decoder,
                        Err(e) => {
                            error!("Cannot decode audio of speaker {}: {}", speaker, e);
                            continue;
                        }
                    };

                    let buffer = Arc::new(ReplayBuffer::new(
                        speaker,
                        BufferConfig {
                            format: config.format,
                            retention: config.retention,
                            max_bytes: config.max_bytes_per_speaker,
                        },
                        decoder,
                    ));
                    buffer.spawn_evictor(config.eviction_interval);

                    let frames = transport.subscribe(speaker, config.retention).await;

                    // Inserted under the shard lock so a transport that ends
                    // immediately cannot remove the entry before it exists.
                    if let Entry::Vacant(slot) = speakers.entry(speaker) {
                        let ingest = tokio::spawn(ingest(
                            session,
                            Arc::clone(&buffer),
                            frames,
                            Arc::clone(&speakers),
                        ));
                        slot.insert(SpeakerTrack { buffer, ingest });
                        info!("Recording speaker {} in session {}", speaker, session);
                    }
                }
            })
        };

        match self.sessions.entry(session) {
            Entry::Occupied(_) => {
                listener.abort();
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionState {
                    listener,
                    speakers,
                    started_at: Utc::now(),
                });
                info!("Started recording session {}", session);
                true
            }
        }
    }

    /// Stops listening for speakers and ends every speaker's ingestion.
    pub fn stop_recording(&self, session: u64) -> Option<StoppedSession> {
        let Some((_, state)) = self.sessions.remove(&session) else {
            warn!("Session {} is not recording, nothing to stop", session);
            return None;
        };

        state.listener.abort();
        let speakers = state.speakers.len();
        for entry in state.speakers.iter() {
            entry.ingest.abort();
        }
        state.speakers.clear();

        info!("Stopped recording session {} ({} speakers)", session, speakers);
        Some(StoppedSession {
            started_at: state.started_at,
            speakers,
        })
    }

    pub fn is_recording(&self, session: u64) -> bool {
        self.sessions.contains_key(&session)
    }

    /// Buffers of tracked speakers that have received audio, or `None` if
    /// the session is not recording.
    pub fn buffers(&self, session: u64) -> Option<Vec<Arc<ReplayBuffer>>> {
        let state = self.sessions.get(&session)?;
        Some(
            state
                .speakers
                .iter()
                .filter(|entry| entry.buffer.has_written())
                .map(|entry| Arc::clone(&entry.buffer))
                .collect(),
        )
    }

    pub fn speakers(&self, session: u64) -> Option<Vec<SpeakerStatus>> {
        let state = self.sessions.get(&session)?;
        let mut speakers: Vec<SpeakerStatus> = state
            .speakers
            .iter()
            .map(|entry| SpeakerStatus {
                speaker: *entry.key(),
                retained_ms: entry.buffer.retained_ms(),
                retained_bytes: entry.buffer.retained_bytes(),
            })
            .collect();
        speakers.sort_by_key(|status| status.speaker);
        Some(speakers)
    }
}

/// Feeds one speaker's frames into their buffer until the transport ends.
async fn ingest(
    session: u64,
    buffer: Arc<ReplayBuffer>,
    mut frames: FrameReceiver,
    speakers: Arc<DashMap<u64, SpeakerTrack>>,
) {
    let speaker = buffer.speaker();

    while let Some(frame) = frames.recv().await {
        match frame {
            Ok(frame) => match buffer.write(&frame.payload, frame.arrival_ms) {
                Ok(_) => {}
                Err(e @ DecodeError::UnsupportedFormat { .. }) => {
                    error!("Speaker {}: {}", speaker, e);
                    break;
                }
                Err(e) => debug!("Dropped frame from speaker {}: {}", speaker, e),
            },
            Err(e) => {
                error!("Error while recording voice of speaker {}: {}", speaker, e);
                break;
            }
        }
    }

    drop(frames);
    speakers.remove_if(&speaker, |_, track| Arc::ptr_eq(&track.buffer, &buffer));
    info!("Speaker {} left session {}", speaker, session);
}
