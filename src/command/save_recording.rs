use crate::Context;
use crate::Error;
use crate::voice::{ExportError, ExportKind};
use poise::serenity_prelude as serenity;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub enum SaveFormat {
    #[name = "wav"]
    Wav,
    #[name = "ogg (mix and one stream per speaker)"]
    Ogg,
}

impl From<SaveFormat> for ExportKind {
    fn from(format: SaveFormat) -> Self {
        match format {
            SaveFormat::Wav => ExportKind::Audio,
            SaveFormat::Ogg => ExportKind::Ogg,
        }
    }
}

fn export_message(error: &ExportError) -> String {
    match error {
        ExportError::NoActiveSession(_) => "No recording is active on this guild.".to_string(),
        ExportError::NothingToExport(_) => "Nothing has been recorded yet.".to_string(),
        ExportError::MixTimeout(_) => "Mixing the recording took too long, try fewer minutes.".to_string(),
        other => format!("Failed to save recording: {}", other),
    }
}

#[poise::command(prefix_command, slash_command, rename = "save-recording", guild_only)]
pub async fn save_recording(
    ctx: Context<'_>,
    #[description = "How many minutes to save (default 10)"] minutes: Option<u32>,
    #[description = "Output format (default wav)"] format: Option<SaveFormat>,
) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command must be used in a guild")?;
    let session = guild_id.get();

    if !ctx.data().registry.is_recording(session) {
        ctx.say("No recording is active on this guild.").await?;
        return Ok(());
    }

    ctx.defer().await?;

    let max_minutes = ctx.data().config.max_record_minutes;
    let minutes = minutes.unwrap_or(10).clamp(1, max_minutes);
    let format = format.unwrap_or(SaveFormat::Wav);
    let file_name = format!(
        "{}_{}",
        session,
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    );

    let exporter = &ctx.data().exporter;
    let path = match exporter
        .save_recording(session, &file_name, format.into(), minutes)
        .await
    {
        Ok(path) => path,
        Err(e) => {
            error!("Failed to save recording of guild {}: {}", guild_id, e);
            ctx.say(export_message(&e)).await?;
            return Ok(());
        }
    };

    info!("Uploading {:?} for guild {}", path, guild_id);

    let upload = async {
        let attachment = serenity::CreateAttachment::path(&path).await?;
        ctx.send(
            poise::CreateReply::default()
                .content(format!("⏪ **Last {} minutes**", minutes))
                .attachment(attachment),
        )
        .await?;
        Ok::<(), Error>(())
    }
    .await;

    exporter.storage().delete_file(&path).await;
    upload
}
