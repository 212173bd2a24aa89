//! Per-speaker replay buffer.
//!
//! Incoming frames are laid end to end on a continuous timeline. When
//! arrivals fall a chunk or more behind the end of the timeline,
//! zero-filled chunks are inserted to cover the gap. Old chunks are evicted from the front once they fall
//! out of the retention window, and `rewind` produces a silence-padded view
//! of any past interval so that several speakers line up on the same start.

use super::audio::{AudioFormat, CHUNK_DURATION_MS};
use super::codec::FrameDecoder;
use super::error::DecodeError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How far the timeline may run ahead of arrival times before early frames
/// stop being credited against later gaps.
const MAX_AHEAD_MS: u64 = 1000;

/// A unit of decoded PCM placed on the timeline.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub payload: Arc<[u8]>,
    pub start_ms: i64,
    pub end_ms: i64,
    /// When the chunk was appended; eviction age is measured from here.
    pub inserted_at: i64,
    pub silent: bool,
}

impl Chunk {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub format: AudioFormat,
    pub retention: Duration,
    /// Ceiling on retained payload bytes, oldest chunks go first.
    pub max_bytes: usize,
}

struct Timeline {
    chunks: VecDeque<Chunk>,
    bytes: usize,
    /// End of the timeline so far; `None` while empty.
    cursor: Option<i64>,
    /// Silence bytes owed from gaps shorter than a chunk. Negative while the
    /// timeline runs ahead of arrival times.
    silence_offset: i64,
}

impl Timeline {
    fn push(&mut self, chunk: Chunk) {
        self.bytes += chunk.payload.len();
        self.chunks.push_back(chunk);
    }

    fn drop_front(&mut self, count: usize) {
        for chunk in self.chunks.drain(..count) {
            self.bytes -= chunk.payload.len();
        }
        if self.chunks.is_empty() {
            self.cursor = None;
            self.silence_offset = 0;
        }
    }
}

pub struct ReplayBuffer {
    speaker: u64,
    config: BufferConfig,
    decoder: Box<dyn FrameDecoder>,
    silence: Arc<[u8]>,
    timeline: Mutex<Timeline>,
    written: watch::Sender<u64>,
}

impl ReplayBuffer {
    pub fn new(speaker: u64, config: BufferConfig, decoder: Box<dyn FrameDecoder>) -> Self {
        let silence: Arc<[u8]> = vec![0u8; config.format.chunk_bytes()].into();
        let (written, _) = watch::channel(0);

        Self {
            speaker,
            config,
            decoder,
            silence,
            timeline: Mutex::new(Timeline {
                chunks: VecDeque::new(),
                bytes: 0,
                cursor: None,
                silence_offset: 0,
            }),
            written,
        }
    }

    pub fn speaker(&self) -> u64 {
        self.speaker
    }

    pub fn format(&self) -> AudioFormat {
        self.config.format
    }

    /// Decodes `frame` and appends it, preceded by silence for any gap since
    /// the previous chunk. Returns the number of chunks appended.
    pub fn write(&self, frame: &[u8], arrival_ms: i64) -> Result<usize, DecodeError> {
        let format = self.config.format;
        let pcm = self.decoder.decode(frame)?;

        if pcm.is_empty() {
            return Err(DecodeError::Empty);
        }
        if !format.is_frame_aligned(pcm.len()) {
            return Err(DecodeError::Misaligned {
                len: pcm.len(),
                frame_bytes: format.frame_bytes(),
            });
        }

        let duration_ms = format.duration_ms_of(pcm.len() as u64) as i64;
        let (appended, trimmed) = self.append(pcm.into(), duration_ms, arrival_ms);

        if trimmed > 0 {
            warn!(
                "Speaker {} exceeded {} bytes, dropped {} oldest chunks",
                self.speaker, self.config.max_bytes, trimmed
            );
        }

        self.written.send_modify(|count| *count += appended as u64);
        Ok(appended)
    }

    fn append(&self, payload: Arc<[u8]>, duration_ms: i64, arrival_ms: i64) -> (usize, usize) {
        let format = self.config.format;
        let chunk_bytes = self.silence.len() as i64;
        let step = CHUNK_DURATION_MS as i64;
        let max_ahead = format.bytes_for_duration_ms(MAX_AHEAD_MS) as i64;
        let mut timeline = self.timeline.lock();
        let mut appended = 0;
        let mut start_ms = arrival_ms - duration_ms;

        if let Some(cursor) = timeline.cursor {
            // Early frames pay back silence owed by late ones.
            let gap_ms = start_ms - cursor;
            let gap_bytes = format.bytes_for_duration_ms(gap_ms.unsigned_abs()) as i64;
            let owed = timeline.silence_offset + gap_bytes * gap_ms.signum();
            let count = owed.max(0) / chunk_bytes;
            timeline.silence_offset = (owed - count * chunk_bytes).max(-max_ahead);

            for i in 0..count {
                let silent_start = cursor + i * step;
                timeline.push(Chunk {
                    payload: Arc::clone(&self.silence),
                    start_ms: silent_start,
                    end_ms: silent_start + step,
                    inserted_at: arrival_ms,
                    silent: true,
                });
            }
            appended += count as usize;
            start_ms = cursor + count * step;
        }

        let end_ms = start_ms + duration_ms;
        timeline.push(Chunk {
            payload,
            start_ms,
            end_ms,
            inserted_at: arrival_ms,
            silent: false,
        });
        appended += 1;
        timeline.cursor = Some(end_ms);

        let mut trimmed = 0;
        let mut bytes = timeline.bytes;
        while bytes > self.config.max_bytes && timeline.chunks.len() - trimmed > 1 {
            bytes -= timeline.chunks[trimmed].payload.len();
            trimmed += 1;
        }
        if trimmed > 0 {
            timeline.drop_front(trimmed);
        }

        (appended, trimmed)
    }

    /// Drops every leading chunk older than the retention window.
    pub fn evict(&self, now_ms: i64) -> usize {
        let retention = self.config.retention.as_millis() as i64;
        let mut timeline = self.timeline.lock();

        let expired = timeline
            .chunks
            .iter()
            .take_while(|chunk| now_ms - chunk.inserted_at > retention)
            .count();

        if expired > 0 {
            timeline.drop_front(expired);
        }
        expired
    }

    /// One-shot, silence-aligned view of `[start_ms, stop_ms]` as it stands now.
    pub fn rewind(&self, start_ms: i64, stop_ms: i64) -> Rewind {
        let timeline = self.timeline.lock();
        let chunks = &timeline.chunks;

        let first = chunks.partition_point(|chunk| chunk.start_ms < start_ms);
        let end = chunks.partition_point(|chunk| chunk.start_ms <= stop_ms).max(first);
        let snapshot: Vec<Chunk> = chunks.range(first..end).cloned().collect();
        let lead_until = chunks.get(first).map(|chunk| chunk.start_ms.min(stop_ms));
        drop(timeline);

        let lead = match lead_until {
            Some(until) if until > start_ms => {
                self.config.format.bytes_for_duration_ms(until.saturating_sub(start_ms) as u64)
                    / self.silence.len() as u64
            }
            _ => 0,
        };

        Rewind {
            lead,
            next_silence_ms: start_ms,
            silence: Arc::clone(&self.silence),
            chunks: snapshot.into_iter(),
        }
    }

    /// Start of the earliest retained chunk.
    pub fn earliest_start(&self) -> Option<i64> {
        self.timeline.lock().chunks.front().map(|chunk| chunk.start_ms)
    }

    /// Earliest retained start, or `now_ms` when nothing is retained.
    pub fn start_time(&self, now_ms: i64) -> i64 {
        self.earliest_start().unwrap_or(now_ms)
    }

    /// Span covered by retained chunks.
    pub fn retained_ms(&self) -> i64 {
        let timeline = self.timeline.lock();
        match (timeline.chunks.front(), timeline.chunks.back()) {
            (Some(first), Some(last)) => last.end_ms - first.start_ms,
            _ => 0,
        }
    }

    pub fn retained_bytes(&self) -> usize {
        self.timeline.lock().bytes
    }

    pub fn len(&self) -> usize {
        self.timeline.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total chunks ever written, updated after every successful write.
    pub fn subscribe_writes(&self) -> watch::Receiver<u64> {
        self.written.subscribe()
    }

    pub fn has_written(&self) -> bool {
        *self.written.borrow() > 0
    }

    /// Runs `evict` every `every` until the buffer is dropped.
    pub fn spawn_evictor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(buffer) = weak.upgrade() else {
                    break;
                };
                let dropped = buffer.evict(super::audio::now_ms());
                if dropped > 0 {
                    debug!("Evicted {} chunks for speaker {}", dropped, buffer.speaker);
                }
            }
        })
    }
}

/// Chunks produced by [`ReplayBuffer::rewind`].
///
/// Nothing is produced until the consumer asks for the next chunk, so a slow
/// consumer simply pauses production. The sequence cannot be restarted.
pub struct Rewind {
    lead: u64,
    next_silence_ms: i64,
    silence: Arc<[u8]>,
    chunks: std::vec::IntoIter<Chunk>,
}

impl Iterator for Rewind {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.lead > 0 {
            self.lead -= 1;
            let start_ms = self.next_silence_ms;
            self.next_silence_ms += CHUNK_DURATION_MS as i64;
            return Some(Chunk {
                payload: Arc::clone(&self.silence),
                start_ms,
                end_ms: self.next_silence_ms,
                inserted_at: start_ms,
                silent: true,
            });
        }
        self.chunks.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.lead as usize + self.chunks.len();
        (remaining, Some(remaining))
    }
}
