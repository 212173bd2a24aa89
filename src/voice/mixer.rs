use super::error::ExportError;
use async_trait::async_trait;
use hound::{WavReader, WavWriter};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

/// Combines single-track files into the final recording.
#[async_trait]
pub trait TrackMixer: Send + Sync {
    /// Mixes `tracks` down to one WAV at `output`.
    async fn mix(&self, tracks: &[PathBuf], output: &Path) -> Result<(), ExportError>;

    /// Packs every input as its own stream of one OGG container.
    async fn to_ogg(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ExportError>;
}

/// Mixes with ffmpeg's `amix` filter.
pub struct FfmpegMixer {
    binary: PathBuf,
}

impl FfmpegMixer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<(), ExportError> {
        info!("Running ffmpeg {:?}", args);

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExportError::Mix(format!("Failed to start ffmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            return Err(ExportError::Mix(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            )));
        }
        Ok(())
    }
}

impl Default for FfmpegMixer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

fn input_args(inputs: &[PathBuf]) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-loglevel".to_string(), "error".to_string()];
    for input in inputs {
        args.push("-i".to_string());
        args.push(input.to_string_lossy().into_owned());
    }
    args
}

pub fn amix_args(tracks: &[PathBuf], output: &Path) -> Vec<String> {
    let mut args = input_args(tracks);
    let labels: String = (0..tracks.len()).map(|i| format!("[{}:a]", i)).collect();
    args.push("-filter_complex".to_string());
    args.push(format!("{}amix=inputs={}[a]", labels, tracks.len()));
    args.push("-map".to_string());
    args.push("[a]".to_string());
    args.push(output.to_string_lossy().into_owned());
    args
}

pub fn ogg_args(inputs: &[PathBuf], output: &Path) -> Vec<String> {
    let mut args = input_args(inputs);
    for i in 0..inputs.len() {
        args.push("-map".to_string());
        args.push(i.to_string());
    }
    args.push(output.to_string_lossy().into_owned());
    args
}

#[async_trait]
impl TrackMixer for FfmpegMixer {
    async fn mix(&self, tracks: &[PathBuf], output: &Path) -> Result<(), ExportError> {
        if tracks.is_empty() {
            return Err(ExportError::Mix("no tracks to mix".to_string()));
        }
        self.run(amix_args(tracks, output)).await
    }

    async fn to_ogg(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ExportError> {
        self.run(ogg_args(inputs, output)).await
    }
}

/// Sums tracks sample by sample with clipping; WAV only.
pub struct NativeMixer;

fn mix_wavs(tracks: &[PathBuf], output: &Path) -> Result<(), ExportError> {
    let mix_error = |path: &Path, e: hound::Error| {
        ExportError::Mix(format!("{}: {}", path.display(), e))
    };

    let mut spec = None;
    let mut mixed: Vec<i32> = Vec::new();

    for track in tracks {
        let mut reader = WavReader::open(track).map_err(|e| mix_error(track.as_path(), e))?;
        let track_spec = reader.spec();

        match spec {
            None => spec = Some(track_spec),
            Some(first) if first != track_spec => {
                return Err(ExportError::Mix(format!(
                    "{} has a different format than the other tracks",
                    track.display()
                )));
            }
            Some(_) => {}
        }

        for (i, sample) in reader.samples::<i16>().enumerate() {
            let sample = sample.map_err(|e| mix_error(track.as_path(), e))? as i32;
            match mixed.get_mut(i) {
                Some(slot) => *slot += sample,
                None => mixed.push(sample),
            }
        }
    }

    let spec = spec.ok_or_else(|| ExportError::Mix("no tracks to mix".to_string()))?;
    let mut writer = WavWriter::create(output, spec).map_err(|e| mix_error(output, e))?;
    for sample in mixed {
        let clipped = sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        writer.write_sample(clipped).map_err(|e| mix_error(output, e))?;
    }
    writer.finalize().map_err(|e| mix_error(output, e))?;
    Ok(())
}

#[async_trait]
impl TrackMixer for NativeMixer {
    async fn mix(&self, tracks: &[PathBuf], output: &Path) -> Result<(), ExportError> {
        let tracks = tracks.to_vec();
        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || mix_wavs(&tracks, &output))
            .await
            .map_err(|e| ExportError::Mix(format!("mix task failed: {}", e)))?
    }

    async fn to_ogg(&self, _inputs: &[PathBuf], _output: &Path) -> Result<(), ExportError> {
        Err(ExportError::Mix(
            "OGG output needs the ffmpeg mixer".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::audio::AudioFormat;
    use crate::voice::encoder::wav_spec;
    use tempfile::TempDir;

    fn write_track(path: &Path, samples: &[i16]) {
        let mut writer = WavWriter::create(path, wav_spec(AudioFormat::new(16000, 1))).unwrap();
        for sample in samples {
            writer.write_sample(*sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_amix_command() {
        let tracks = vec![PathBuf::from("a.wav"), PathBuf::from("b.wav")];
        let args = amix_args(&tracks, Path::new("out.wav"));
        assert_eq!(
            args,
            vec![
                "-y", "-loglevel", "error", "-i", "a.wav", "-i", "b.wav", "-filter_complex",
                "[0:a][1:a]amix=inputs=2[a]", "-map", "[a]", "out.wav",
            ]
        );
    }

    #[test]
    fn test_ogg_command_maps_every_input() {
        let inputs = vec![PathBuf::from("mix.wav"), PathBuf::from("a.wav")];
        let args = ogg_args(&inputs, Path::new("out.ogg"));
        assert!(args.ends_with(&[
            "-map".to_string(),
            "0".to_string(),
            "-map".to_string(),
            "1".to_string(),
            "out.ogg".to_string(),
        ]));
    }

    #[tokio::test]
    async fn test_native_mix_sums_and_clips() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        let out = dir.path().join("out.wav");
        write_track(&a, &[100, i16::MAX, -5]);
        write_track(&b, &[1, 10]);

        NativeMixer.mix(&[a, b], &out).await.unwrap();

        let samples: Vec<i16> = WavReader::open(&out)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(samples, vec![101, i16::MAX, -5]);
    }

    #[tokio::test]
    async fn test_native_mix_rejects_mismatched_formats() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_track(&a, &[1]);
        let mut writer = WavWriter::create(&b, wav_spec(AudioFormat::new(48000, 2))).unwrap();
        writer.write_sample(1i16).unwrap();
        writer.write_sample(1i16).unwrap();
        writer.finalize().unwrap();

        let result = NativeMixer.mix(&[a, b], &dir.path().join("out.wav")).await;
        assert!(matches!(result, Err(ExportError::Mix(_))));
    }

    #[tokio::test]
    async fn test_native_mixer_has_no_ogg() {
        let result = NativeMixer.to_ogg(&[], Path::new("out.ogg")).await;
        assert!(matches!(result, Err(ExportError::Mix(_))));
    }
}
