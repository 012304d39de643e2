use std::collections::HashSet;

use chrono::Utc;
use poise::serenity_prelude::{ActivityData, ClientBuilder, Context as SerenityContext, FullEvent, GatewayIntents, OnlineStatus, UserId};
use poise::{FrameworkError, PrefixFrameworkOptions};
use songbird::SerenityInit;

use crate::config::Config;
use crate::database::database::Database;
use crate::discord::alarm::{self, Alarm};
use crate::discord::commands::{all_commands, Data, Error};
use crate::discord::error::PinguError;
use crate::discord::reminders::{run_reminder_loop, ReminderQueue};
use crate::discord::state::{ClownCache, PollRegistry};
use crate::discord::utils::Icons;
use crate::discord::links;
use crate::discord::voice::{self, VoiceTracker};

pub struct PinguBot {
    config: Config,
    database: Database,
}

/// Reply text for errors caused by the invoker, `None` for errors that need a trace.
pub fn user_message(error: &Error) -> Option<String> {
    match error.downcast_ref::<PinguError>() {
        Some(error) if error.is_user_facing() => Some(format!("{} {}", Icons::Fail, error)),
        _ => None,
    }
}

pub fn cooldown_message(remaining: std::time::Duration) -> String {
    format!("Stop! You violated the law. Wait {:.2} seconds.", remaining.as_secs_f64())
}

async fn on_error(error: FrameworkError<'_, Data, Error>) {
    match error {
        FrameworkError::Setup { error, .. } => tracing::error!("Failed to start the bot: {:?}", error),
        FrameworkError::Command { error, ctx, .. } => {
            let reply = match user_message(&error) {
                Some(reply) => reply,
                None => {
                    tracing::error!("Error in command `{}`: {:?}", ctx.command().qualified_name, error);
                    format!("{} Something went wrong while running that command.", Icons::Fail)
                }
            };
            if let Err(e) = ctx.say(reply).await {
                tracing::warn!("Unable to report command error: {}", e);
            }
        }
        FrameworkError::CooldownHit { remaining_cooldown, ctx, .. } => {
            if let Err(e) = ctx.say(cooldown_message(remaining_cooldown)).await {
                tracing::warn!("Unable to report cooldown: {}", e);
            }
        }
        FrameworkError::ArgumentParse { error, input, ctx, .. } => {
            let reply = match input {
                Some(input) => format!("{} Couldn't understand `{}`: {}", Icons::Fail, input, error),
                None => format!("{} Missing an argument, see `{}help {}`.", Icons::Fail, ctx.prefix(), ctx.command().qualified_name),
            };
            if let Err(e) = ctx.say(reply).await {
                tracing::warn!("Unable to report argument error: {}", e);
            }
        }
        FrameworkError::NotAnOwner { ctx, .. } => tracing::debug!("{} tried to run owner command `{}`", ctx.author().name, ctx.command().qualified_name),
        FrameworkError::UnknownCommand { .. } => {}
        FrameworkError::EventHandler { error, event, .. } => tracing::error!("Error while handling {}: {:?}", event.snake_case_name(), error),
        error => {
            if let Err(e) = poise::builtins::on_error(error).await {
                tracing::error!("Error while handling error: {}", e);
            }
        }
    }
}

async fn event_handler(ctx: &SerenityContext, event: &FullEvent, _framework: poise::FrameworkContext<'_, Data, Error>, data: &Data) -> Result<(), Error> {
    match event {
        FullEvent::Message { new_message } => links::on_message(ctx, new_message).await?,
        FullEvent::MessageDelete { channel_id, deleted_message_id, guild_id } => alarm::on_message_delete(ctx, data, *channel_id, *deleted_message_id, *guild_id).await?,
        FullEvent::VoiceStateUpdate { old, new } => voice::on_voice_state_update(ctx, data, old.as_ref(), new).await?,
        FullEvent::InteractionCreate { interaction } => links::on_interaction(ctx, interaction).await?,
        _ => {}
    }
    Ok(())
}

impl PinguBot {
    pub fn new(config: Config, database: Database) -> Self {
        PinguBot { config, database }
    }

    pub async fn run_bot(self) -> anyhow::Result<()> {
        let PinguBot { config, database } = self;
        let token = config.discord_token.clone();
        let alarm_schedule = config.alarm_schedule()?;

        let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;
        let owners: HashSet<UserId> = config.owners.iter().map(|id| UserId::new(*id)).collect();

        let framework = poise::Framework::builder()
            .options(poise::FrameworkOptions {
                commands: all_commands(),
                prefix_options: PrefixFrameworkOptions { prefix: Some(config.prefix.clone()), case_insensitive_commands: true, ..Default::default() },
                owners,
                on_error: |error| Box::pin(on_error(error)),
                pre_command: |ctx| Box::pin(async move { tracing::info!("{} invoked `{}`", ctx.author().name, ctx.command().qualified_name) }),
                post_command: |ctx| Box::pin(async move { tracing::debug!("Finished `{}`", ctx.command().qualified_name) }),
                event_handler: |ctx, event, framework, data| Box::pin(event_handler(ctx, event, framework, data)),
                ..Default::default()
            })
            .setup(move |ctx, ready, _framework| {
                Box::pin(async move {
                    tracing::info!("Logged in as {} ({} guilds)", ready.user.name, ready.guilds.len());
                    ctx.set_presence(Some(ActivityData::watching("clowns")), OnlineStatus::Online);

                    let clowns = ClownCache::from_records(database.begin_transaction().await?.load_all_clowns()?);
                    tracing::info!("Loaded {} clown record(s)", clowns.len().await);

                    let reminders = ReminderQueue::default();
                    tokio::spawn(run_reminder_loop(ctx.http.clone(), database.clone(), reminders.clone(), config.reminders.scan_interval()));

                    Ok(Data {
                        config,
                        database,
                        clowns,
                        polls: PollRegistry::default(),
                        alarm: Alarm::default(),
                        alarm_schedule,
                        voice: VoiceTracker::default(),
                        reminders,
                        started_at: Utc::now(),
                    })
                })
            })
            .build();

        let mut client = ClientBuilder::new(token, intents).framework(framework).register_songbird().await?;
        client.start().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_facing_errors_become_replies() {
        let error: Error = PinguError::bad_argument("Given ID(s) were not a numerical value.").into();
        assert_eq!(user_message(&error).as_deref(), Some(":x: Given ID(s) were not a numerical value."));

        let error: Error = PinguError::MissingClown.into();
        assert_eq!(user_message(&error).as_deref(), Some(":x: No clown was set."));
    }

    #[test]
    fn internal_errors_are_not_shown() {
        let error: Error = PinguError::from(diesel::result::Error::NotFound).into();
        assert!(user_message(&error).is_none());

        let error: Error = "socket closed".into();
        assert!(user_message(&error).is_none());
    }

    #[test]
    fn cooldown_message_has_two_decimals() {
        assert_eq!(cooldown_message(std::time::Duration::from_millis(2500)), "Stop! You violated the law. Wait 2.50 seconds.");
    }
}
