use chrono::{NaiveDate, Utc};
use poise::serenity_prelude as serenity;
use poise::serenity_prelude::{CreateEmbedFooter, CreateMessage, GuildId, Mentionable, MessageCollector, ReactionType, UserId};
use tokio::time::sleep;

use crate::database::database::ClownRecord;
use crate::discord::commands::{Context, Error};
use crate::discord::error::PinguError;
use crate::discord::poll::{format_percentage, PollOutcome, VoteTally, APPROVE_EMOJI, REJECT_EMOJI};
use crate::discord::state::VoicePhase;
use crate::discord::utils::{base_embed, bot_permissions_in, display_member, format_remaining, user_voice_channel, Icons};
use crate::discord::voice::{missing_voice_permissions, play_honk, songbird_manager};

const MAX_REASON_LEN: usize = 1000;

/// Fail-fast checks run before a nomination poll is opened.
pub fn check_nomination(record: Option<&ClownRecord>, nominator: UserId, nominee: UserId, nominee_is_bot: bool, today: NaiveDate, cooldown: chrono::Duration) -> Result<(), PinguError> {
    if let Some(record) = record {
        if record.is_clown(nominator) && record.designation_active(today, cooldown) {
            let ends = record.designation_ends(cooldown);
            return Err(PinguError::bad_argument(format!("Clowns can't nominate anyone until their week is over ({}).", ends.format("%Y-%m-%d"))));
        }
    }
    if nominee_is_bot {
        return Err(PinguError::bad_argument("Bots can't be clowns."));
    }
    if record.is_some_and(|record| record.is_clown(nominee)) {
        return Err(PinguError::bad_argument("That user is already the clown."));
    }
    Ok(())
}

fn truncate_reason(reason: &str) -> String {
    let reason = reason.trim();
    if reason.chars().count() <= MAX_REASON_LEN {
        return reason.to_string();
    }
    let mut truncated: String = reason.chars().take(MAX_REASON_LEN - 3).collect();
    truncated.push_str("...");
    truncated
}

async fn clown_name(ctx: Context<'_>, guild_id: GuildId, user_id: UserId) -> String {
    match guild_id.member(ctx, user_id).await {
        Ok(member) => display_member(&member),
        Err(_) => user_id.mention().to_string(),
    }
}

/// Stuff related to clown of the week
#[poise::command(prefix_command, guild_only, guild_cooldown = 3, category = "Clown", subcommands("nominate", "status", "honk", "reset", "disconnect", "debug"))]
pub async fn clown(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| PinguError::bad_argument("This command only works in servers."))?;
    let data = ctx.data();
    let current = data.clowns.get(guild_id).await.and_then(|record| Some((record.clown_id?, record)));

    let Some((clown_id, record)) = current else {
        ctx.say(format!("{} The clown is no one.", Icons::Info)).await?;
        return Ok(());
    };

    let name = clown_name(ctx, guild_id, clown_id).await;
    let cooldown = data.config.clown.renomination_cooldown();
    let status = if record.designation_active(Utc::now().date_naive(), cooldown) {
        format!("until {}", record.designation_ends(cooldown).format("%Y-%m-%d"))
    } else {
        "but their week is over".to_string()
    };
    ctx.say(format!("{} The clown is `{}` since {}, {}.", Icons::Info, name, record.nomination_date.format("%Y-%m-%d"), status)).await?;
    Ok(())
}

/// Nominate someone to be the clown of the week
#[poise::command(prefix_command, guild_only, aliases("nom"), category = "Clown")]
pub async fn nominate(ctx: Context<'_>, #[description = "Member to nominate"] candidate: serenity::Member) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| PinguError::bad_argument("This command only works in servers."))?;
    let data = ctx.data();
    let settings = &data.config.clown;

    let guard = data.polls.try_open(guild_id, candidate.user.id)?;

    let record = data.clowns.get(guild_id).await;
    check_nomination(record.as_ref(), ctx.author().id, candidate.user.id, candidate.user.bot, Utc::now().date_naive(), settings.renomination_cooldown())?;

    let name = display_member(&candidate);
    let prompt = ctx
        .say(format!("{} Why should `{}` be the clown? You have {} seconds to answer.", Icons::Info, name, settings.reason_timeout_secs))
        .await?
        .into_message()
        .await?;
    guard.set_prompt(prompt.id);

    let prefix = data.config.prefix.clone();
    let reply = MessageCollector::new(ctx.serenity_context())
        .author_id(ctx.author().id)
        .channel_id(ctx.channel_id())
        .timeout(settings.reason_timeout())
        .filter(move |message| !message.content.trim().is_empty() && !message.content.starts_with(&prefix))
        .next()
        .await;

    let Some(reply) = reply else {
        ctx.say(format!("{} No reason given in time, nomination cancelled.", Icons::Fail)).await?;
        return Ok(());
    };
    let reason = truncate_reason(&reply.content);

    let open_until = Utc::now() + chrono::Duration::seconds(settings.poll_duration_secs as i64);
    let embed = base_embed()
        .title("Clown nomination")
        .description(format!("{} nominated {} to be the clown of the week.", ctx.author().mention(), candidate.mention()))
        .field("Reason", reason.clone(), false)
        .footer(CreateEmbedFooter::new(format!("React with {} or {}. Voting closes in {} seconds.", APPROVE_EMOJI, REJECT_EMOJI, settings.poll_duration_secs)));
    let poll_message = ctx.channel_id().send_message(ctx, CreateMessage::new().embed(embed)).await?;
    poll_message.react(ctx, ReactionType::Unicode(APPROVE_EMOJI.to_string())).await?;
    poll_message.react(ctx, ReactionType::Unicode(REJECT_EMOJI.to_string())).await?;
    guard.set_poll(poll_message.id, reason, open_until);

    sleep(settings.poll_duration()).await;

    let tally = match ctx.channel_id().message(ctx, poll_message.id).await {
        Ok(message) => VoteTally::from_reactions(&message.reactions),
        Err(e) => {
            tracing::warn!("Poll message {} disappeared: {}", poll_message.id, e);
            VoteTally::default()
        }
    };

    match tally.evaluate(settings.approval_threshold) {
        PollOutcome::Approved { approval, approve, reject } => {
            let updated = data.database.begin_transaction().await?.nominate_clown(guild_id, candidate.user.id, Utc::now().date_naive())?;
            data.clowns.refresh(updated).await;
            tracing::info!("{} is now the clown of {} ({} for, {} against)", candidate.user.name, guild_id, approve, reject);
            ctx.say(format!("{} The people have spoken with {} approval. `{}` is now the clown!", Icons::Success, format_percentage(approval), name)).await?;
        }
        PollOutcome::Rejected { approval, .. } => {
            ctx.say(format!(
                "{} Nomination failed with {} approval ({} needed).",
                Icons::Fail,
                format_percentage(approval),
                format_percentage(settings.approval_threshold)
            ))
            .await?;
        }
        PollOutcome::NoVotes => {
            ctx.say(format!("{} Nobody voted, nomination discarded.", Icons::Fail)).await?;
        }
        PollOutcome::Manipulated => {
            tracing::warn!("Seed reactions missing on poll {} in {}", poll_message.id, guild_id);
            ctx.say(format!("{} The poll was tampered with, nomination discarded.", Icons::Fail)).await?;
        }
    }
    drop(guard);
    Ok(())
}

/// Show the nomination in progress
#[poise::command(prefix_command, guild_only, category = "Clown")]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| PinguError::bad_argument("This command only works in servers."))?;
    let Some(poll) = ctx.data().polls.get(guild_id) else {
        ctx.say(format!("{} No nomination is in progress.", Icons::Info)).await?;
        return Ok(());
    };

    let response = match poll.open_until {
        Some(open_until) => format!("{} Voting on {} closes in {}.", Icons::Info, poll.nominee.mention(), format_remaining(open_until - Utc::now())),
        None => format!("{} {} was nominated, waiting for a reason.", Icons::Info, poll.nominee.mention()),
    };
    ctx.say(response).await?;
    Ok(())
}

/// Honk in your voice channel
#[poise::command(prefix_command, guild_only, guild_cooldown = 10, category = "Clown")]
pub async fn honk(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| PinguError::bad_argument("This command only works in servers."))?;
    let data = ctx.data();

    let has_clown = data.clowns.get(guild_id).await.is_some_and(|record| record.clown_id.is_some());
    if !has_clown {
        return Err(PinguError::MissingClown.into());
    }

    let channel_id = user_voice_channel(ctx.cache(), guild_id, ctx.author().id).ok_or_else(|| PinguError::bad_argument("You need to be in a voice channel."))?;
    let permissions = bot_permissions_in(ctx.cache(), guild_id, channel_id).unwrap_or_else(serenity::Permissions::empty);
    let missing = missing_voice_permissions(permissions);
    if !missing.is_empty() {
        return Err(PinguError::MissingVoicePermissions(missing).into());
    }

    if !data.voice.begin(guild_id, channel_id).await {
        return Err(PinguError::bad_argument("I'm already honking.").into());
    }
    if let Err(e) = play_honk(ctx.serenity_context(), data, guild_id, channel_id).await {
        data.voice.reset(guild_id).await;
        return Err(e.into());
    }

    ctx.say(format!("{} Honk!", Icons::Audio)).await?;
    Ok(())
}

/// Clear the current clown
#[poise::command(prefix_command, guild_only, owners_only, hide_in_help, category = "Clown")]
pub async fn reset(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| PinguError::bad_argument("This command only works in servers."))?;
    let data = ctx.data();
    let updated = data.database.begin_transaction().await?.reset_clown(guild_id)?.ok_or(PinguError::MissingClown)?;
    data.clowns.refresh(updated).await;
    ctx.say(format!("{} Clown has been reset.", Icons::Success)).await?;
    Ok(())
}

/// Leave the voice channel
#[poise::command(prefix_command, guild_only, owners_only, hide_in_help, category = "Clown")]
pub async fn disconnect(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| PinguError::bad_argument("This command only works in servers."))?;
    let manager = songbird_manager(ctx.serenity_context()).await?;
    if ctx.data().voice.disconnect(guild_id, manager.as_ref()).await {
        ctx.say(format!("{} Disconnected.", Icons::Success)).await?;
    } else {
        ctx.say(format!("{} I wasn't honking, left voice anyway.", Icons::Info)).await?;
    }
    Ok(())
}

/// Dump the clown and voice state of this server
#[poise::command(prefix_command, guild_only, owners_only, hide_in_help, category = "Clown")]
pub async fn debug(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| PinguError::bad_argument("This command only works in servers."))?;
    let data = ctx.data();
    let phase = data.voice.phase(guild_id).await;
    let channel = data.voice.channel(guild_id).await.map(|channel| channel.mention().to_string()).unwrap_or_else(|| "none".to_string());
    let record = data.clowns.get(guild_id).await;

    let mut lines = vec![format!("voice phase: `{}`", phase), format!("voice channel: {}", channel)];
    match record {
        Some(record) => {
            lines.push(format!("clown: {:?}", record.clown_id.map(|id| id.get())));
            lines.push(format!("previous clown: {:?}", record.previous_clown_id.map(|id| id.get())));
            lines.push(format!("nominated on: {}", record.nomination_date));
            lines.push(format!("last honk: {}", record.join_time.map(|time| time.to_rfc3339()).unwrap_or_else(|| "never".to_string())));
        }
        None => lines.push("no clown record".to_string()),
    }
    if phase != VoicePhase::Idle {
        tracing::debug!("Voice session in {} is {}", guild_id, phase);
    }
    lines.push(format!("poll open: {}", data.polls.is_open(guild_id)));

    ctx.say(format!("```\n{}\n```", lines.join("\n"))).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, day).unwrap()
    }

    fn week() -> chrono::Duration {
        chrono::Duration::days(7)
    }

    fn record_with_clown(clown: u64, nominated: u32) -> ClownRecord {
        ClownRecord::nominate(None, GuildId::new(1), UserId::new(clown), date(nominated))
    }

    #[test]
    fn first_nomination_in_a_guild_is_allowed() {
        assert!(check_nomination(None, UserId::new(1), UserId::new(2), false, date(1), week()).is_ok());
    }

    #[test]
    fn bots_cannot_be_nominated() {
        let error = check_nomination(None, UserId::new(1), UserId::new(2), true, date(1), week()).unwrap_err();
        assert_eq!(error.to_string(), "Bots can't be clowns.");
    }

    #[test]
    fn current_clown_cannot_be_nominated_again() {
        let record = record_with_clown(2, 1);
        let error = check_nomination(Some(&record), UserId::new(1), UserId::new(2), false, date(3), week()).unwrap_err();
        assert!(matches!(error, PinguError::BadArgument(_)));
    }

    #[test]
    fn clown_cannot_nominate_during_their_week() {
        let record = record_with_clown(2, 1);
        for candidate in [3, 4] {
            let result = check_nomination(Some(&record), UserId::new(2), UserId::new(candidate), false, date(7), week());
            assert!(matches!(result, Err(PinguError::BadArgument(_))));
        }
        assert!(check_nomination(Some(&record), UserId::new(2), UserId::new(3), false, date(8), week()).is_ok());
    }

    #[test]
    fn long_reasons_are_truncated() {
        let reason = "a".repeat(1500);
        let truncated = truncate_reason(&reason);
        assert_eq!(truncated.chars().count(), MAX_REASON_LEN);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_reason("  honk  "), "honk");
    }
}
