use crate::voice::audio::SUPPORTED_SAMPLE_RATES;
use crate::voice::{AudioFormat, RegistryConfig};
use anyhow::{Context as _, Result, bail};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerKind {
    Ffmpeg,
    Native,
}

impl FromStr for MixerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(Self::Ffmpeg),
            "native" => Ok(Self::Native),
            other => bail!("Unknown MIXER `{}`, expected `ffmpeg` or `native`", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub token: String,
    pub guild_id: Option<u64>,
    pub record_directory: PathBuf,
    pub max_record_minutes: u32,
    pub max_user_recording_mb: usize,
    pub format: AudioFormat,
    pub eviction_interval: Duration,
    pub mix_timeout: Duration,
    pub mixer: MixerKind,
}

impl RecorderConfig {
    /// Reads the bot configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let token = lookup("DISCORD_TOKEN").context("Set DISCORD_TOKEN environment variable")?;

        let guild_id = lookup("GUILD_ID")
            .map(|id| id.parse::<u64>())
            .transpose()
            .context("Invalid GUILD_ID format")?;

        let config = Self {
            token,
            guild_id,
            record_directory: lookup("RECORD_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("recordings")),
            max_record_minutes: parse_or(&lookup, "MAX_RECORD_MINUTES", 10)?,
            max_user_recording_mb: parse_or(&lookup, "MAX_USER_RECORDING_MB", 120)?,
            format: AudioFormat::new(
                parse_or(&lookup, "SAMPLE_RATE", 16000)?,
                parse_or(&lookup, "CHANNEL_COUNT", 2)?,
            ),
            eviction_interval: Duration::from_secs(parse_or(&lookup, "EVICTION_INTERVAL_SECS", 5)?),
            mix_timeout: Duration::from_secs(parse_or(&lookup, "MIX_TIMEOUT_SECS", 120)?),
            mixer: parse_or(&lookup, "MIXER", MixerKind::Ffmpeg)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.format.sample_rate) {
            bail!(
                "SAMPLE_RATE must be one of {:?}, got {}",
                SUPPORTED_SAMPLE_RATES,
                self.format.sample_rate
            );
        }
        if !(1..=2).contains(&self.format.channels) {
            bail!("CHANNEL_COUNT must be 1 or 2, got {}", self.format.channels);
        }
        if self.max_record_minutes == 0 {
            bail!("MAX_RECORD_MINUTES must be at least 1");
        }
        if self.max_user_recording_mb == 0 {
            bail!("MAX_USER_RECORDING_MB must be at least 1");
        }
        if self.eviction_interval.is_zero() {
            bail!("EVICTION_INTERVAL_SECS must be at least 1");
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.max_record_minutes as u64 * 60)
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            format: self.format,
            retention: self.retention(),
            max_bytes_per_speaker: self.max_user_recording_mb * 1024 * 1024,
            eviction_interval: self.eviction_interval,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {} `{}`: {}", key, raw, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RecorderConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RecorderConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DISCORD_TOKEN", "token")]).unwrap();
        assert_eq!(config.guild_id, None);
        assert_eq!(config.record_directory, PathBuf::from("recordings"));
        assert_eq!(config.format, AudioFormat::new(16000, 2));
        assert_eq!(config.mixer, MixerKind::Ffmpeg);

        let registry = config.registry();
        assert_eq!(registry.retention, Duration::from_secs(600));
        assert_eq!(registry.max_bytes_per_speaker, 120 * 1024 * 1024);
        assert_eq!(registry.eviction_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DISCORD_TOKEN", "token"),
            ("GUILD_ID", "1234"),
            ("SAMPLE_RATE", "48000"),
            ("CHANNEL_COUNT", "1"),
            ("MAX_RECORD_MINUTES", "3"),
            ("MIXER", "Native"),
        ])
        .unwrap();
        assert_eq!(config.guild_id, Some(1234));
        assert_eq!(config.format, AudioFormat::new(48000, 1));
        assert_eq!(config.retention(), Duration::from_secs(180));
        assert_eq!(config.mixer, MixerKind::Native);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(load(&[]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "t"), ("SAMPLE_RATE", "44100")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "t"), ("CHANNEL_COUNT", "6")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "t"), ("MAX_RECORD_MINUTES", "0")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "t"), ("GUILD_ID", "abc")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "t"), ("MIXER", "sox")]).is_err());
    }
}
