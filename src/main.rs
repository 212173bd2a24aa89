use anyhow::Context as _;
use poise::serenity_prelude as serenity;
use serenity::{Client, model::gateway::GatewayIntents};
use songbird::{Config, SerenityInit, driver::DecodeMode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod command;
mod config;
mod voice;

use command::*;
use config::{MixerKind, RecorderConfig};
use voice::{
    ExportCoordinator, FfmpegMixer, FileStorage, NativeMixer, SessionRegistry, TrackMixer,
    WavTrackEncoder, opus_decoder_factory,
};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

pub struct Data {
    pub registry: Arc<SessionRegistry>,
    pub exporter: ExportCoordinator,
    pub config: RecorderConfig,
}

async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match error {
        poise::FrameworkError::Setup { error, .. } => panic!("Failed to start bot: {:?}", error),
        poise::FrameworkError::Command { error, ctx, .. } => {
            error!("Error in command `{}`: {:?}", ctx.command().name, error);
        }
        error => {
            if let Err(e) = poise::builtins::on_error(error).await {
                error!("Error while handling error: {}", e)
            }
        }
    }
}

fn build_data(config: RecorderConfig) -> anyhow::Result<Data> {
    let storage = FileStorage::new(&config.record_directory).with_context(|| {
        format!(
            "Failed to create recording directory {:?}",
            config.record_directory
        )
    })?;

    let registry = Arc::new(SessionRegistry::new(
        config.registry(),
        opus_decoder_factory(),
    ));

    let mixer: Arc<dyn TrackMixer> = match config.mixer {
        MixerKind::Ffmpeg => Arc::new(FfmpegMixer::default()),
        MixerKind::Native => Arc::new(NativeMixer),
    };

    let exporter = ExportCoordinator::new(
        Arc::clone(&registry),
        storage,
        Arc::new(WavTrackEncoder),
        mixer,
        config.mix_timeout,
    );

    Ok(Data {
        registry,
        exporter,
        config,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RecorderConfig::from_env()?;
    let token = config.token.clone();
    let guild_id = config.guild_id;
    info!(
        "Keeping the last {} minutes per speaker at {} Hz, {} channel(s)",
        config.max_record_minutes, config.format.sample_rate, config.format.channels
    );
    let data = build_data(config)?;

    let options = poise::FrameworkOptions {
        commands: vec![
            start_recording(),
            stop_recording(),
            save_recording(),
            recording_status(),
        ],
        prefix_options: poise::PrefixFrameworkOptions {
            prefix: Some("/".into()),
            edit_tracker: Some(Arc::new(poise::EditTracker::for_timespan(
                Duration::from_secs(3600),
            ))),
            ..Default::default()
        },
        on_error: |error| Box::pin(on_error(error)),
        pre_command: |ctx| {
            Box::pin(async move {
                info!("Executing command {}...", ctx.command().qualified_name);
            })
        },
        post_command: |ctx| {
            Box::pin(async move {
                info!("Executed command {}!", ctx.command().qualified_name);
            })
        },
        ..Default::default()
    };

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES;

    let framework = poise::Framework::builder()
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Logged in as {}", ready.user.name);
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                if let Some(guild_id) = guild_id {
                    let guild_id = serenity::model::id::GuildId::new(guild_id);
                    poise::builtins::register_in_guild(ctx, &framework.options().commands, guild_id)
                        .await?;
                    info!("Registered commands for guild {}", guild_id);
                }

                Ok(data)
            })
        })
        .options(options)
        .build();

    // Opus payloads are decoded per speaker by the replay buffers.
    let songbird_config = Config::default().decode_mode(DecodeMode::Decrypt);

    let mut client = Client::builder(token, intents)
        .framework(framework)
        .register_songbird_from_config(songbird_config)
        .await?;

    client.start().await?;
    Ok(())
}
