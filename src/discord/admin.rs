use std::time::Duration;

use poise::serenity_prelude::MessageCollector;

use crate::discord::commands::{Context, Error};
use crate::discord::utils::Icons;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

fn parse_confirmation(answer: &str) -> Option<bool> {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Shut down this Pingu instance
#[poise::command(prefix_command, owners_only, hide_in_help, category = "Admin")]
pub async fn shutdown(ctx: Context<'_>) -> Result<(), Error> {
    ctx.say(format!("{} Shutdown this Pingu instance (y/N)?", Icons::Sleep)).await?;

    let answer = MessageCollector::new(ctx.serenity_context())
        .author_id(ctx.author().id)
        .channel_id(ctx.channel_id())
        .timeout(CONFIRM_TIMEOUT)
        .filter(|message| parse_confirmation(&message.content).is_some())
        .next()
        .await;

    let confirmed = answer.and_then(|message| parse_confirmation(&message.content)).unwrap_or(false);
    if !confirmed {
        ctx.say(format!("{} Shutdown cancelled.", Icons::Info)).await?;
        return Ok(());
    }

    tracing::warn!("Shutdown requested by {}", ctx.author().name);
    ctx.say(format!("{} Shutting down...", Icons::Sleep)).await?;
    ctx.framework().shard_manager().shutdown_all().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_accepts_short_and_long_answers() {
        assert_eq!(parse_confirmation("Y"), Some(true));
        assert_eq!(parse_confirmation(" yes "), Some(true));
        assert_eq!(parse_confirmation("n"), Some(false));
        assert_eq!(parse_confirmation("maybe"), None);
    }
}
