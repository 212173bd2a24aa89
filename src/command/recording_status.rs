use crate::Context;
use crate::Error;
use poise::serenity_prelude as serenity;

#[poise::command(prefix_command, slash_command, rename = "recording-status", guild_only)]
pub async fn recording_status(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command must be used in a guild")?;

    let speakers = match ctx.data().registry.speakers(guild_id.get()) {
        Some(speakers) => speakers,
        None => {
            ctx.say("No recording is active on this guild.").await?;
            return Ok(());
        }
    };

    if speakers.is_empty() {
        ctx.say("Recording, but nobody has spoken yet.").await?;
        return Ok(());
    }

    let cache = &ctx.serenity_context().cache;
    let http = ctx.serenity_context().http.clone();

    let mut response = format!(
        "**Recording {} speaker(s), up to {} minutes each:**\n",
        speakers.len(),
        ctx.data().config.max_record_minutes
    );
    for status in speakers {
        let user_id = serenity::model::id::UserId::new(status.speaker);

        let display_name = match cache.user(user_id).map(|user| {
            user.global_name.clone().unwrap_or_else(|| user.name.clone())
        }) {
            Some(name) => name,
            None => match http.get_user(user_id).await {
                Ok(user) => user.global_name.unwrap_or(user.name),
                Err(_) => format!("User {}", status.speaker),
            },
        };

        response.push_str(&format!(
            "- **{}** - {:.0}s buffered ({:.1} MB)\n",
            display_name,
            status.retained_ms as f64 / 1000.0,
            status.retained_bytes as f64 / (1024.0 * 1024.0)
        ));
    }

    ctx.say(response).await?;
    Ok(())
}
