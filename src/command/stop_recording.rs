use crate::Context;
use crate::Error;
use tracing::{error, info};

pub(crate) fn format_duration(duration: chrono::Duration) -> String {
    let total_secs = duration.num_seconds();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[poise::command(prefix_command, slash_command, rename = "stop-recording", guild_only)]
pub async fn stop_recording(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command must be used in a guild")?;

    let stopped = match ctx.data().registry.stop_recording(guild_id.get()) {
        Some(stopped) => stopped,
        None => {
            ctx.say("No recording is active on this guild.").await?;
            return Ok(());
        }
    };

    let manager = songbird::get(ctx.serenity_context())
        .await
        .ok_or("Songbird voice client not initialized")?
        .clone();

    if let Err(e) = manager.remove(guild_id).await {
        error!("Failed to leave voice channel: {:?}", e);
    }

    info!("Left voice channel in guild {}", guild_id);

    ctx.say(format!(
        "🎙️ **Recording stopped!**\n\
        👥 Speakers: {}\n\
        ⏱️ Duration: {}",
        stopped.speakers,
        format_duration(stopped.duration())
    ))
    .await?;
    Ok(())
}
