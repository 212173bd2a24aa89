//! Turns the buffers of a session into one aligned recording.

use super::audio::now_ms;
use super::encoder::TrackEncoder;
use super::error::ExportError;
use super::mixer::TrackMixer;
use super::registry::SessionRegistry;
use super::storage::FileStorage;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// The mixed WAV.
    Audio,
    /// The mix plus every speaker as separate streams of one OGG file.
    Ogg,
}

/// Interval shared by every track of one export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl ExportWindow {
    /// Starts at the earliest retained audio, but no earlier than
    /// `min(requested, retention)` before `now_ms`.
    pub fn compute(
        start_times: impl IntoIterator<Item = i64>,
        now_ms: i64,
        requested: Duration,
        retention: Duration,
    ) -> Option<Self> {
        let min_start = start_times.into_iter().min()?;
        let length = requested.min(retention).as_millis() as i64;
        let start_ms = min_start.max(now_ms - length).min(now_ms);

        Some(Self {
            start_ms,
            end_ms: now_ms,
        })
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

#[derive(Debug, Clone)]
pub struct TrackArtifact {
    pub speaker: u64,
    pub path: PathBuf,
    pub chunks: usize,
}

pub struct ExportCoordinator {
    registry: Arc<SessionRegistry>,
    storage: FileStorage,
    encoder: Arc<dyn TrackEncoder>,
    mixer: Arc<dyn TrackMixer>,
    mix_timeout: Duration,
}

impl ExportCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        storage: FileStorage,
        encoder: Arc<dyn TrackEncoder>,
        mixer: Arc<dyn TrackMixer>,
        mix_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            storage,
            encoder,
            mixer,
            mix_timeout,
        }
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    pub fn export_window(
        &self,
        session: u64,
        requested: Duration,
    ) -> Result<ExportWindow, ExportError> {
        let buffers = self
            .registry
            .buffers(session)
            .ok_or(ExportError::NoActiveSession(session))?;

        let now = now_ms();
        ExportWindow::compute(
            buffers.iter().map(|buffer| buffer.start_time(now)),
            now,
            requested,
            self.registry.config().retention,
        )
        .ok_or(ExportError::NoActiveSession(session))
    }

    /// Writes one track per speaker covering `window`. Speakers whose track
    /// fails are left out.
    pub async fn export_tracks(
        &self,
        session: u64,
        window: ExportWindow,
        file_name: &str,
    ) -> Result<Vec<TrackArtifact>, ExportError> {
        let buffers = self
            .registry
            .buffers(session)
            .ok_or(ExportError::NoActiveSession(session))?;

        let mut jobs = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            let speaker = buffer.speaker();
            let format = buffer.format();
            let path = self.storage.track_path(file_name, speaker);
            let mut chunks = buffer.rewind(window.start_ms, window.end_ms);
            let encoder = Arc::clone(&self.encoder);
            let target = path.clone();

            let job = tokio::task::spawn_blocking(move || {
                encoder.encode(&mut chunks, format, &target)
            });
            jobs.push((speaker, path, job));
        }

        let mut artifacts = Vec::new();
        for (speaker, path, job) in jobs {
            match job.await {
                Ok(Ok(chunks)) => artifacts.push(TrackArtifact {
                    speaker,
                    path,
                    chunks,
                }),
                Ok(Err(e)) => {
                    error!("Error while saving recording of speaker {}: {}", speaker, e);
                    self.storage.delete_file(&path).await;
                }
                Err(e) => {
                    error!("Track task for speaker {} failed: {}", speaker, e);
                    self.storage.delete_file(&path).await;
                }
            }
        }

        if artifacts.is_empty() {
            return Err(ExportError::NothingToExport(session));
        }
        Ok(artifacts)
    }

    /// Saves the last `minutes` of `session` and returns the final file.
    /// Intermediate files are removed whether or not mixing succeeds.
    pub async fn save_recording(
        &self,
        session: u64,
        file_name: &str,
        kind: ExportKind,
        minutes: u32,
    ) -> Result<PathBuf, ExportError> {
        let requested = Duration::from_secs(minutes as u64 * 60);
        let window = self.export_window(session, requested)?;
        let tracks = self.export_tracks(session, window, file_name).await?;

        info!(
            "Exporting {} tracks of session {} ({:.1}s)",
            tracks.len(),
            session,
            window.duration_ms() as f64 / 1000.0
        );

        let track_paths: Vec<PathBuf> = tracks.into_iter().map(|track| track.path).collect();
        let mixed = self.storage.output_path(file_name, "wav");

        if let Err(e) = self.bounded(self.mixer.mix(&track_paths, &mixed)).await {
            self.storage.delete_files(&track_paths).await;
            self.storage.delete_file(&mixed).await;
            return Err(e);
        }

        match kind {
            ExportKind::Audio => {
                if !self.storage.delete_files(&track_paths).await {
                    warn!("Some tracks of {} could not be deleted", file_name);
                }
                Ok(mixed)
            }
            ExportKind::Ogg => {
                let ogg = self.storage.output_path(file_name, "ogg");
                let mut inputs = vec![mixed];
                inputs.extend(track_paths);

                let result = self.bounded(self.mixer.to_ogg(&inputs, &ogg)).await;
                self.storage.delete_files(&inputs).await;

                match result {
                    Ok(()) => Ok(ogg),
                    Err(e) => {
                        self.storage.delete_file(&ogg).await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn bounded(
        &self,
        step: impl Future<Output = Result<(), ExportError>>,
    ) -> Result<(), ExportError> {
        tokio::time::timeout(self.mix_timeout, step)
            .await
            .map_err(|_| ExportError::MixTimeout(self.mix_timeout.as_secs()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::audio::AudioFormat;
    use crate::voice::buffer::Chunk;
    use crate::voice::encoder::WavTrackEncoder;
    use crate::voice::mixer::NativeMixer;
    use crate::voice::registry::tests::{MockTransport, everyone, registry, speak};
    use async_trait::async_trait;
    use hound::WavReader;
    use std::path::Path;
    use tempfile::TempDir;

    const MINUTE: Duration = Duration::from_secs(60);

    struct Setup {
        _dir: TempDir,
        transport: Arc<MockTransport>,
        registry: Arc<SessionRegistry>,
        storage: FileStorage,
    }

    impl Setup {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let storage = FileStorage::new(dir.path()).unwrap();
            let registry = Arc::new(registry());
            let transport = Arc::new(MockTransport::default());
            registry.start_recording(1, transport.clone(), everyone()).await;
            Self {
                _dir: dir,
                transport,
                registry,
                storage,
            }
        }

        fn coordinator(&self, encoder: Arc<dyn TrackEncoder>, mixer: Arc<dyn TrackMixer>) -> ExportCoordinator {
            ExportCoordinator::new(
                Arc::clone(&self.registry),
                self.storage.clone(),
                encoder,
                mixer,
                Duration::from_secs(30),
            )
        }

        fn files(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(self.storage.base_dir())
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    /// Fails for one speaker, delegates to the WAV encoder otherwise.
    struct FailingEncoder {
        speaker: Option<u64>,
    }

    impl TrackEncoder for FailingEncoder {
        fn encode(
            &self,
            chunks: &mut dyn Iterator<Item = Chunk>,
            format: AudioFormat,
            path: &Path,
        ) -> Result<usize, ExportError> {
            let speaker = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.rsplit('-').next())
                .and_then(|id| id.parse::<u64>().ok());
            if self.speaker.is_none() || speaker == self.speaker {
                return Err(ExportError::Encode {
                    speaker: speaker.unwrap_or_default(),
                    reason: "disk full".to_string(),
                });
            }
            WavTrackEncoder.encode(chunks, format, path)
        }
    }

    struct StuckMixer;

    #[async_trait]
    impl TrackMixer for StuckMixer {
        async fn mix(&self, _tracks: &[PathBuf], _output: &Path) -> Result<(), ExportError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn to_ogg(&self, _inputs: &[PathBuf], _output: &Path) -> Result<(), ExportError> {
            Ok(())
        }
    }

    #[test]
    fn test_window_starts_at_earliest_audio() {
        let window = ExportWindow::compute([5_000, 8_000], 10_000, 10 * MINUTE, 10 * MINUTE);
        assert_eq!(window, Some(ExportWindow { start_ms: 5_000, end_ms: 10_000 }));
    }

    #[test]
    fn test_window_is_capped_by_request_and_retention() {
        let now = 3_600_000;
        let requested = ExportWindow::compute([0], now, MINUTE, 10 * MINUTE).unwrap();
        assert_eq!(requested.duration_ms(), 60_000);

        let retained = ExportWindow::compute([0], now, 30 * MINUTE, 10 * MINUTE).unwrap();
        assert_eq!(retained.duration_ms(), 600_000);
        assert_eq!(retained.end_ms, now);
    }

    #[test]
    fn test_window_never_exceeds_limits() {
        let now = 1_000_000;
        for first in [0, 400_000, 940_000, 999_999, 1_000_000] {
            for minutes in [0, 1, 5, 30] {
                let requested = MINUTE * minutes;
                let window =
                    ExportWindow::compute([first, first + 500], now, requested, 10 * MINUTE)
                        .unwrap();
                assert!(window.duration_ms() >= 0);
                assert!(window.duration_ms() <= requested.min(10 * MINUTE).as_millis() as i64);
                assert!(window.start_ms >= first);
            }
        }
        assert_eq!(ExportWindow::compute([], now, MINUTE, MINUTE), None);
    }

    #[tokio::test]
    async fn test_unknown_session_has_nothing_to_export() {
        let setup = Setup::new().await;
        let coordinator = setup.coordinator(Arc::new(WavTrackEncoder), Arc::new(NativeMixer));

        assert!(matches!(
            coordinator.export_window(42, MINUTE),
            Err(ExportError::NoActiveSession(42))
        ));
        assert!(matches!(
            coordinator.save_recording(42, "clip", ExportKind::Audio, 1).await,
            Err(ExportError::NoActiveSession(42))
        ));
        // Recording, but nobody has said anything yet.
        assert!(matches!(
            coordinator.export_window(1, MINUTE),
            Err(ExportError::NoActiveSession(1))
        ));
    }

    #[tokio::test]
    async fn test_tracks_are_aligned_to_the_window() {
        let setup = Setup::new().await;
        speak(&setup.registry, &setup.transport, 1, 10).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        speak(&setup.registry, &setup.transport, 1, 11).await;

        let coordinator = setup.coordinator(Arc::new(WavTrackEncoder), Arc::new(NativeMixer));
        let window = coordinator.export_window(1, MINUTE).unwrap();
        let first = setup
            .registry
            .buffers(1)
            .unwrap()
            .iter()
            .find(|buffer| buffer.speaker() == 10)
            .and_then(|buffer| buffer.earliest_start())
            .unwrap();
        assert_eq!(window.start_ms, first);

        let mut tracks = coordinator.export_tracks(1, window, "clip").await.unwrap();
        tracks.sort_by_key(|track| track.speaker);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].chunks, 1);
        // The late speaker is padded with silence up to their first frame.
        assert!(tracks[1].chunks >= 3);

        let samples: Vec<i16> = WavReader::open(&tracks[1].path)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        let padding = (tracks[1].chunks - 1) * 640;
        assert!(samples[..padding].iter().all(|s| *s == 0));
        assert!(samples[padding..].iter().all(|s| *s == 9));
    }

    #[tokio::test]
    async fn test_save_recording_mixes_and_cleans_up() {
        let setup = Setup::new().await;
        speak(&setup.registry, &setup.transport, 1, 10).await;
        speak(&setup.registry, &setup.transport, 1, 11).await;

        let coordinator = setup.coordinator(Arc::new(WavTrackEncoder), Arc::new(NativeMixer));
        let path = coordinator
            .save_recording(1, "clip", ExportKind::Audio, 10)
            .await
            .unwrap();

        assert_eq!(path, setup.storage.output_path("clip", "wav"));
        assert_eq!(setup.files(), vec!["clip.wav".to_string()]);
        let reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert!(reader.duration() >= 320);
    }

    #[tokio::test]
    async fn test_failed_speaker_is_left_out() {
        let setup = Setup::new().await;
        speak(&setup.registry, &setup.transport, 1, 10).await;
        speak(&setup.registry, &setup.transport, 1, 11).await;

        let coordinator = setup.coordinator(
            Arc::new(FailingEncoder { speaker: Some(11) }),
            Arc::new(NativeMixer),
        );
        let window = coordinator.export_window(1, MINUTE).unwrap();
        let tracks = coordinator.export_tracks(1, window, "clip").await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].speaker, 10);
        assert_eq!(setup.files(), vec!["clip-10.wav".to_string()]);

        let coordinator =
            setup.coordinator(Arc::new(FailingEncoder { speaker: None }), Arc::new(NativeMixer));
        assert!(matches!(
            coordinator.export_tracks(1, window, "other").await,
            Err(ExportError::NothingToExport(1))
        ));
    }

    #[tokio::test]
    async fn test_mix_failure_removes_intermediate_files() {
        let setup = Setup::new().await;
        speak(&setup.registry, &setup.transport, 1, 10).await;

        // The native mixer cannot produce OGG.
        let coordinator = setup.coordinator(Arc::new(WavTrackEncoder), Arc::new(NativeMixer));
        let result = coordinator.save_recording(1, "clip", ExportKind::Ogg, 10).await;
        assert!(matches!(result, Err(ExportError::Mix(_))));
        assert!(setup.files().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_mixer_times_out() {
        let setup = Setup::new().await;
        speak(&setup.registry, &setup.transport, 1, 10).await;

        let coordinator = ExportCoordinator::new(
            Arc::clone(&setup.registry),
            setup.storage.clone(),
            Arc::new(WavTrackEncoder),
            Arc::new(StuckMixer),
            Duration::from_millis(50),
        );
        let result = coordinator.save_recording(1, "clip", ExportKind::Audio, 10).await;
        assert!(matches!(result, Err(ExportError::MixTimeout(0))));
        assert!(setup.files().is_empty());
    }
}
