use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use poise::serenity_prelude::{CreateEmbed, CreateMessage, Http, Mentionable};
use serenity::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::database::database::{Database, NewReminder, Reminder};
use crate::discord::commands::{Context, Error};
use crate::discord::error::PinguError;
use crate::discord::utils::{base_embed, requested_by_footer, Icons};

/// Splits `<offset> to <text>` into the offset and the reminder text.
pub fn parse_reminder(input: &str, max_text_len: usize) -> Result<(Duration, String), PinguError> {
    let (when, text) = input.split_once(" to ").ok_or_else(|| PinguError::bad_argument("Missing `to` keyword, e.g. `remindme 2h 30m to stretch`."))?;
    let text = text.trim();
    if text.is_empty() {
        return Err(PinguError::bad_argument("Missing text to remind you about."));
    }
    if text.chars().count() > max_text_len {
        return Err(PinguError::bad_argument(format!("Reminder text must be at most {} characters.", max_text_len)));
    }

    let offset = humantime::parse_duration(when.trim()).map_err(|_| PinguError::bad_argument("Unable to parse given time. Check if there are typos."))?;
    if offset.is_zero() {
        return Err(PinguError::bad_argument("The time offset must be in the future."));
    }
    Ok((offset, text.to_string()))
}

fn humanize(offset: Duration) -> String {
    humantime::format_duration(Duration::from_secs(offset.as_secs())).to_string()
}

/// Where due reminders go. Claiming removes the row, so a reminder deleted by its owner,
/// or already delivered, is never sent.
#[async_trait]
pub trait ReminderOutbox: Send + Sync + 'static {
    /// Deletes the row; false when it no longer exists.
    async fn claim(&self, reminder_id: i32) -> Result<bool, PinguError>;
    async fn send(&self, reminder: &Reminder) -> Result<(), PinguError>;
}

pub struct DiscordReminderOutbox {
    pub http: Arc<Http>,
    pub database: Database,
}

#[async_trait]
impl ReminderOutbox for DiscordReminderOutbox {
    async fn claim(&self, reminder_id: i32) -> Result<bool, PinguError> {
        let deleted = self.database.begin_transaction().await?.delete_reminder(reminder_id)?;
        Ok(deleted > 0)
    }

    async fn send(&self, reminder: &Reminder) -> Result<(), PinguError> {
        let http = self.http.as_ref();
        match (http.get_user(reminder.user()).await, reminder.channel().to_channel(http).await) {
            (Ok(user), Ok(_channel)) => {
                let embed = base_embed().title("Don't forget to:").description(&reminder.reminder_text);
                let message = CreateMessage::new().content(user.mention().to_string()).embed(embed);
                reminder.channel().send_message(http, message).await?;
            }
            _ => tracing::info!("Dropping reminder {}, user or channel is gone", reminder.reminder_id),
        }
        Ok(())
    }
}

/// Reminders that already have a delivery task waiting on them.
#[derive(Clone, Default)]
pub struct ReminderQueue {
    queued: Arc<Mutex<HashSet<i32>>>,
}

impl ReminderQueue {
    /// Spawns a delivery task unless the reminder is already queued.
    pub async fn queue(&self, reminder: Reminder, outbox: Arc<dyn ReminderOutbox>) -> bool {
        if !self.queued.lock().await.insert(reminder.reminder_id) {
            return false;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            let reminder_id = reminder.reminder_id;
            if let Err(e) = deliver(&reminder, outbox.as_ref()).await {
                tracing::error!("Failed to deliver reminder {}: {}", reminder_id, e);
            }
            queue.queued.lock().await.remove(&reminder_id);
        });
        true
    }
}

async fn deliver(reminder: &Reminder, outbox: &dyn ReminderOutbox) -> Result<(), PinguError> {
    let wait = (reminder.reminder_time - Utc::now()).to_std().unwrap_or_default();
    sleep(wait).await;

    if !outbox.claim(reminder.reminder_id).await? {
        tracing::info!("Reminder {} was deleted before it was due", reminder.reminder_id);
        return Ok(());
    }
    outbox.send(reminder).await
}

/// Periodically queues reminders that are due before the next scan.
pub async fn run_reminder_loop(http: Arc<Http>, database: Database, queue: ReminderQueue, scan_interval: Duration) {
    let outbox: Arc<dyn ReminderOutbox> = Arc::new(DiscordReminderOutbox { http, database: database.clone() });
    let mut interval = tokio::time::interval(scan_interval);
    loop {
        interval.tick().await;
        let horizon = Utc::now() + chrono::Duration::from_std(scan_interval).unwrap_or_else(|_| chrono::Duration::minutes(30));
        let due = match database.begin_transaction().await.and_then(|mut tx| tx.load_reminders_due_before(horizon)) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("Unable to load due reminders: {}", e);
                continue;
            }
        };
        for reminder in due {
            queue.queue(reminder, outbox.clone()).await;
        }
    }
}

/// Remind yourself about something, e.g. `remindme 2h 30m to stretch`
#[poise::command(prefix_command, aliases("remind", "reminder"), member_cooldown = 3, category = "Auto", subcommands("list", "clear", "delete"))]
pub async fn remindme(ctx: Context<'_>, #[rest] #[description = "<offset> to <text>"] when: Option<String>) -> Result<(), Error> {
    let data = ctx.data();
    let when = when.ok_or_else(|| PinguError::bad_argument("Missing time offset."))?;
    let (offset, text) = parse_reminder(&when, data.config.reminders.max_text_len)?;

    let remind_at = Utc::now() + chrono::Duration::from_std(offset).map_err(|_| PinguError::bad_argument("That is too far in the future."))?;
    let reminder = data.database.begin_transaction().await?.save_reminder(&NewReminder::new(text, remind_at, ctx.author().id, ctx.channel_id()))?;
    tracing::info!("Saved reminder {} for {}", reminder.reminder_id, ctx.author().name);

    if offset <= data.config.reminders.scan_interval() {
        let outbox = Arc::new(DiscordReminderOutbox { http: ctx.serenity_context().http.clone(), database: data.database.clone() });
        data.reminders.queue(reminder, outbox).await;
    }

    let embed = base_embed().description(format!("{} {}, you will be reminded about this in {}.", Icons::Info, ctx.author().mention(), humanize(offset)));
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Show your upcoming reminders
#[poise::command(prefix_command, category = "Auto")]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let data = ctx.data();
    let reminders = data.database.begin_transaction().await?.load_reminders_for_user(ctx.author().id, data.config.reminders.list_limit)?;
    if reminders.is_empty() {
        ctx.say(format!("{} You have no reminders.", Icons::Info)).await?;
        return Ok(());
    }

    let now = Utc::now();
    let mut embed: CreateEmbed = base_embed().title("Reminders").footer(requested_by_footer(ctx.author()));
    for reminder in &reminders {
        let remaining = (reminder.reminder_time - now).to_std().unwrap_or_default();
        embed = embed.field(format!("{} | in {}", reminder.reminder_id, humanize(remaining)), reminder.reminder_text.clone(), false);
    }
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Delete all of your reminders
#[poise::command(prefix_command, category = "Auto")]
pub async fn clear(ctx: Context<'_>) -> Result<(), Error> {
    let deleted = ctx.data().database.begin_transaction().await?.delete_reminders_for_user(ctx.author().id)?;
    ctx.say(format!("{} Deleted {} reminder(s).", Icons::Success, deleted)).await?;
    Ok(())
}

/// Delete one of your reminders by id
#[poise::command(prefix_command, category = "Auto")]
pub async fn delete(ctx: Context<'_>, #[description = "Reminder id"] reminder_id: String) -> Result<(), Error> {
    let reminder_id = reminder_id.trim().parse::<i32>().map_err(|_| PinguError::bad_argument("Reminder id must be a number."))?;
    let deleted = ctx.data().database.begin_transaction().await?.delete_user_reminder(ctx.author().id, reminder_id)?;
    if deleted == 0 {
        return Err(PinguError::bad_argument("You have no reminder with that id.").into());
    }
    ctx.say(format!("{} Reminder deleted.", Icons::Success)).await?;
    Ok(())
}
