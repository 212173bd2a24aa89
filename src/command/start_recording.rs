use crate::Context;
use crate::Error;
use crate::voice::{SongbirdTransport, VoiceTransport};
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing::{error, info};

async fn get_voice_channel(
    ctx: Context<'_>,
    guild_id: serenity::model::id::GuildId,
    user_id: serenity::model::id::UserId,
    channel: Option<serenity::model::channel::Channel>,
) -> Result<Option<serenity::model::id::ChannelId>, Error> {
    match channel {
        Some(serenity::model::channel::Channel::Guild(ch)) => {
            if ch.kind == serenity::model::channel::ChannelType::Voice {
                Ok(Some(ch.id))
            } else {
                ctx.say("The specified channel is not a voice channel!")
                    .await?;
                Ok(None)
            }
        }
        Some(_) => {
            ctx.say("Invalid channel type!").await?;
            Ok(None)
        }
        None => {
            let cache = &ctx.serenity_context().cache;
            let channel_id = cache.guild(guild_id).and_then(|guild| {
                guild
                    .voice_states
                    .get(&user_id)
                    .and_then(|vs| vs.channel_id)
            });
            match channel_id {
                Some(id) => Ok(Some(id)),
                None => {
                    ctx.say("You're not in a voice channel. Please join one or specify a channel: `/start-recording channel:#your-voice-channel`").await?;
                    Ok(None)
                }
            }
        }
    }
}

#[poise::command(prefix_command, slash_command, rename = "start-recording", guild_only)]
pub async fn start_recording(
    ctx: Context<'_>,
    #[description = "Voice channel to record (leave empty to auto-detect)"] channel: Option<
        serenity::model::channel::Channel,
    >,
) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command must be used in a guild")?;
    let session = guild_id.get();

    if ctx.data().registry.is_recording(session) {
        ctx.say("A recording is already active on this guild.")
            .await?;
        return Ok(());
    }

    let voice_channel_id = match get_voice_channel(ctx, guild_id, ctx.author().id, channel).await? {
        Some(id) => id,
        None => return Ok(()),
    };

    let manager = songbird::get(ctx.serenity_context())
        .await
        .ok_or("Songbird voice client not initialized")?
        .clone();

    let handler_lock = match manager.join(guild_id, voice_channel_id).await {
        Ok(handler) => handler,
        Err(e) => {
            error!("Failed to join voice channel: {:?}", e);
            ctx.say(format!("Failed to join voice channel: {:?}", e))
                .await?;
            return Ok(());
        }
    };

    info!(
        "Joined voice channel {} in guild {}",
        voice_channel_id, guild_id
    );

    let transport: Arc<dyn VoiceTransport> = {
        let mut handler = handler_lock.lock().await;
        Arc::new(SongbirdTransport::attach(&mut handler))
    };

    let bot_id = ctx.serenity_context().cache.current_user().id.get();
    let started = ctx
        .data()
        .registry
        .start_recording(session, transport, Arc::new(move |speaker: u64| speaker != bot_id))
        .await;

    if !started {
        ctx.say("A recording is already active on this guild.")
            .await?;
        return Ok(());
    }

    ctx.say(format!(
        "🎙️ **Recording started!**\n\
        ⏪ Keeping the last {} minutes of <#{}>",
        ctx.data().config.max_record_minutes,
        voice_channel_id
    ))
    .await?;

    Ok(())
}
