use std::sync::Arc;

use chrono::{DateTime, Days, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serenity::all::{Cache, ChannelId, ChannelType, Context as SerenityContext, GuildId, Http, Mentionable, MessageId, Permissions};
use serenity::async_trait;
use serenity::model::guild::audit_log::{Action, MessageAction};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::discord::commands::{Context, Data, Error};
use crate::discord::error::PinguError;
use crate::discord::utils::{bot_permissions_in, Icons};

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmSchedule {
    pub timezone: Tz,
    /// Sorted daily times in `timezone`.
    pub times: Vec<NaiveTime>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmTarget {
    pub guild_id: Option<GuildId>,
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub next_fire_time: Option<DateTime<Tz>>,
    pub sent_message: Option<MessageId>,
}

/// Smallest instant strictly after `now` at which one of the daily `times` occurs in `timezone`.
///
/// Times falling into a DST gap are skipped for that day; ambiguous times resolve to the earliest instant.
pub fn next_fire_time(now: DateTime<Utc>, timezone: &Tz, times: &[NaiveTime]) -> Option<DateTime<Tz>> {
    let today = now.with_timezone(timezone).date_naive();
    (0..=2u64)
        .filter_map(|offset| today.checked_add_days(Days::new(offset)))
        .flat_map(|date| times.iter().map(move |time| date.and_time(*time)))
        .filter_map(|local| match timezone.from_local_datetime(&local) {
            LocalResult::Single(instant) => Some(instant),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => None,
        })
        .filter(|instant| instant.with_timezone(&Utc) > now)
        .min()
}

/// Where alarm messages end up.
#[async_trait]
pub trait AlarmSink: Send + Sync + 'static {
    async fn deliver(&self, target: &AlarmTarget, content: &str) -> Result<MessageId, PinguError>;
}

pub struct DiscordAlarmSink {
    pub http: Arc<Http>,
    pub cache: Arc<Cache>,
}

#[async_trait]
impl AlarmSink for DiscordAlarmSink {
    async fn deliver(&self, target: &AlarmTarget, content: &str) -> Result<MessageId, PinguError> {
        // The channel may have disappeared or been locked since the alarm was armed.
        if let Some(guild_id) = target.guild_id {
            let permissions = bot_permissions_in(&self.cache, guild_id, target.channel_id);
            if !permissions.is_some_and(|p| p.contains(Permissions::SEND_MESSAGES | Permissions::VIEW_CHANNEL)) {
                return Err(PinguError::MissingData(format!("Channel #{} is no longer writable", target.channel_name)));
            }
        }
        let message = target.channel_id.say(&self.http, content).await?;
        Ok(message.id)
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Default)]
struct AlarmState {
    target: Option<AlarmTarget>,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

/// The single process-wide alarm. Re-arming replaces the running loop.
#[derive(Clone)]
pub struct Alarm {
    state: Arc<Mutex<AlarmState>>,
    clock: Clock,
}

impl Default for Alarm {
    fn default() -> Self {
        Alarm::with_clock(Arc::new(Utc::now))
    }
}

impl Alarm {
    pub fn with_clock(clock: Clock) -> Self {
        Alarm { state: Arc::new(Mutex::new(AlarmState::default())), clock }
    }

    pub async fn arm(&self, target: AlarmTarget, schedule: Arc<AlarmSchedule>, sink: Arc<dyn AlarmSink>) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        state.target = Some(target);

        let generation = state.generation;
        let alarm = self.clone();
        state.task = Some(tokio::spawn(async move { alarm.run(generation, schedule, sink).await }));
    }

    /// Stops the loop. Returns whether an alarm was armed.
    pub async fn cancel(&self) -> bool {
        let mut state = self.state.lock().await;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        state.target.take().is_some()
    }

    pub async fn target(&self) -> Option<AlarmTarget> {
        self.state.lock().await.target.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn is_sent_message(&self, channel_id: ChannelId, message_id: MessageId) -> bool {
        let state = self.state.lock().await;
        state.target.as_ref().is_some_and(|target| target.channel_id == channel_id && target.sent_message == Some(message_id))
    }

    pub async fn replace_sent_message(&self, message_id: MessageId) {
        if let Some(target) = self.state.lock().await.target.as_mut() {
            target.sent_message = Some(message_id);
        }
    }

    async fn run(&self, generation: u64, schedule: Arc<AlarmSchedule>, sink: Arc<dyn AlarmSink>) {
        let mut last_fire: Option<DateTime<Utc>> = None;
        loop {
            let now = (self.clock)();
            // The wall clock can lag the timer that woke us; never schedule the same slot twice.
            let after = last_fire.map_or(now, |last| now.max(last));
            let Some(fire_at) = next_fire_time(after, &schedule.timezone, &schedule.times) else {
                tracing::error!("No upcoming alarm time could be computed, stopping alarm");
                self.clear(generation).await;
                return;
            };

            let target = {
                let mut state = self.state.lock().await;
                if state.generation != generation {
                    return;
                }
                match state.target.as_mut() {
                    Some(target) => {
                        target.next_fire_time = Some(fire_at);
                        target.clone()
                    }
                    None => return,
                }
            };

            let wait = (fire_at.with_timezone(&Utc) - now).to_std().unwrap_or_default();
            tracing::info!("Next alarm for #{} at {}", target.channel_name, fire_at);
            sleep(wait).await;

            last_fire = Some(fire_at.with_timezone(&Utc));
            match sink.deliver(&target, &schedule.message).await {
                Ok(message_id) => {
                    let mut state = self.state.lock().await;
                    if state.generation != generation {
                        return;
                    }
                    if let Some(target) = state.target.as_mut() {
                        target.sent_message = Some(message_id);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to send alarm to #{}, stopping alarm: {}", target.channel_name, e);
                    self.clear(generation).await;
                    return;
                }
            }
        }
    }

    async fn clear(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation == generation {
            state.target = None;
            state.task = None;
        }
    }
}

fn parse_id(raw: &str) -> Result<u64, PinguError> {
    match raw.trim().parse::<u64>() {
        Ok(id) if id != 0 => Ok(id),
        _ => Err(PinguError::bad_argument("Given ID(s) were not a numerical value.")),
    }
}

/// Explicit `(guild, channel)` from command arguments; `None` means the invoking channel.
pub fn parse_location(guild_id: Option<&str>, channel_id: Option<&str>) -> Result<Option<(GuildId, ChannelId)>, PinguError> {
    match (guild_id, channel_id) {
        (None, _) => Ok(None),
        (Some(_), None) => Err(PinguError::bad_argument("Missing channel ID to send in server.")),
        (Some(guild_id), Some(channel_id)) => {
            let guild_id = parse_id(guild_id)?;
            let channel_id = parse_id(channel_id)?;
            Ok(Some((GuildId::new(guild_id), ChannelId::new(channel_id))))
        }
    }
}

fn resolve_target(cache: &Cache, guild_id: GuildId, channel_id: ChannelId) -> Result<AlarmTarget, PinguError> {
    let channel_name = {
        let guild = cache.guild(guild_id).ok_or_else(|| PinguError::bad_argument("Unable to find that server."))?;
        let channel = guild.channels.get(&channel_id).ok_or_else(|| PinguError::bad_argument("Unable to find that channel."))?;
        if channel.kind != ChannelType::Text && channel.kind != ChannelType::News {
            return Err(PinguError::bad_argument("That channel is not a text channel."));
        }
        channel.name.clone()
    };

    let permissions = bot_permissions_in(cache, guild_id, channel_id).unwrap_or_else(Permissions::empty);
    if !permissions.contains(Permissions::SEND_MESSAGES | Permissions::VIEW_CHANNEL) {
        return Err(PinguError::bad_argument(format!("I'm not allowed to send messages in #{}.", channel_name)));
    }

    Ok(AlarmTarget { guild_id: Some(guild_id), channel_id, channel_name, next_fire_time: None, sent_message: None })
}

fn describe_target(target: &AlarmTarget, fire_at: Option<DateTime<Tz>>) -> String {
    match fire_at {
        Some(fire_at) => format!("{} in {} at {}", target.channel_id.mention(), target.channel_name, fire_at.format("%Y-%m-%d %H:%M %Z")),
        None => format!("{} in {}", target.channel_id.mention(), target.channel_name),
    }
}

/// Start sending the daily alarm to a channel
#[poise::command(prefix_command, rename = "1234", owners_only, hide_in_help, category = "Alert")]
pub async fn set_alarm(ctx: Context<'_>, guild_id: Option<String>, channel_id: Option<String>) -> Result<(), Error> {
    let data = ctx.data();
    let target = match parse_location(guild_id.as_deref(), channel_id.as_deref())? {
        Some((guild_id, channel_id)) => resolve_target(ctx.cache(), guild_id, channel_id)?,
        None => match ctx.guild_id() {
            Some(guild_id) => resolve_target(ctx.cache(), guild_id, ctx.channel_id())?,
            None => AlarmTarget { guild_id: None, channel_id: ctx.channel_id(), channel_name: ctx.author().name.clone(), next_fire_time: None, sent_message: None },
        },
    };

    let fire_at = next_fire_time(Utc::now(), &data.alarm_schedule.timezone, &data.alarm_schedule.times);
    let description = describe_target(&target, fire_at);

    let sink = Arc::new(DiscordAlarmSink { http: ctx.serenity_context().http.clone(), cache: ctx.serenity_context().cache.clone() });
    data.alarm.arm(target, data.alarm_schedule.clone(), sink).await;

    tracing::info!("Alarm armed by {}: {}", ctx.author().name, description);
    ctx.say(format!("{} Alarm set for {}", Icons::Success, description)).await?;
    Ok(())
}

/// Stop the daily alarm
#[poise::command(prefix_command, owners_only, hide_in_help, category = "Alert")]
pub async fn no1234(ctx: Context<'_>) -> Result<(), Error> {
    if !ctx.data().alarm.cancel().await {
        return Err(PinguError::bad_argument("No alarm is running.").into());
    }
    ctx.say(format!("{} Alarm stopped.", Icons::Success)).await?;
    Ok(())
}

/// Show where and when the daily alarm fires next
#[poise::command(prefix_command, owners_only, hide_in_help, category = "Alert")]
pub async fn when1234(ctx: Context<'_>) -> Result<(), Error> {
    let target = ctx.data().alarm.target().await.ok_or_else(|| PinguError::bad_argument("No alarm is running."))?;
    ctx.say(format!("{} Next alarm: {}", Icons::Info, describe_target(&target, target.next_fire_time))).await?;
    Ok(())
}

/// Complains when someone deletes the last alarm message.
pub async fn on_message_delete(ctx: &SerenityContext, data: &Data, channel_id: ChannelId, message_id: MessageId, guild_id: Option<GuildId>) -> Result<(), Error> {
    if !data.alarm.is_sent_message(channel_id, message_id).await {
        return Ok(());
    }

    let mut culprit = None;
    if let Some(guild_id) = guild_id {
        let can_read_audit_log = bot_permissions_in(&ctx.cache, guild_id, channel_id).is_some_and(|p| p.contains(Permissions::VIEW_AUDIT_LOG));
        if can_read_audit_log {
            let bot_id = ctx.cache.current_user().id;
            match guild_id.audit_logs(&ctx.http, Some(Action::Message(MessageAction::Delete)), None, None, Some(20)).await {
                Ok(logs) => {
                    culprit = logs.entries.iter().find(|entry| entry.target_id.is_some_and(|id| id.get() == bot_id.get())).map(|entry| entry.user_id);
                }
                Err(e) => tracing::warn!("Unable to read audit log in {}: {}", guild_id, e),
            }
        }
    }

    let complaint = match culprit {
        Some(user_id) => format!("{} stop deleting my message :confused:", user_id.mention()),
        None => "Someone keeps deleting my message :neutral_face:".to_string(),
    };
    let message = channel_id.say(&ctx.http, complaint).await?;
    data.alarm.replace_sent_message(message.id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::NaiveDate;
    use chrono_tz::America::New_York;

    use super::*;

    fn hm(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    fn eastern(y: i32, m: u32, d: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        New_York.from_local_datetime(&NaiveDate::from_ymd_opt(y, m, d).unwrap().and_time(hm(hour, minute))).single().unwrap().with_timezone(&Utc)
    }

    fn default_times() -> Vec<NaiveTime> {
        vec![hm(0, 34), hm(12, 34)]
    }

    #[test]
    fn evening_fires_after_midnight() {
        let fire = next_fire_time(eastern(2024, 3, 5, 18, 0), &New_York, &default_times()).unwrap();
        assert_eq!(fire.naive_local(), NaiveDate::from_ymd_opt(2024, 3, 6).unwrap().and_time(hm(0, 34)));
    }

    #[test]
    fn exact_fire_time_moves_to_the_next_one() {
        let now = eastern(2024, 3, 5, 12, 34);
        let fire = next_fire_time(now, &New_York, &default_times()).unwrap();
        assert!(fire.with_timezone(&Utc) > now);
        assert_eq!(fire.naive_local(), NaiveDate::from_ymd_opt(2024, 3, 6).unwrap().and_time(hm(0, 34)));
    }

    #[test]
    fn morning_fires_at_noon() {
        let fire = next_fire_time(eastern(2024, 3, 5, 9, 15), &New_York, &default_times()).unwrap();
        assert_eq!(fire.naive_local(), NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_time(hm(12, 34)));
    }

    #[test]
    fn nonexistent_local_time_is_skipped() {
        // 02:30 does not exist on 2024-03-10 in New York
        let now = eastern(2024, 3, 10, 1, 0);
        let fire = next_fire_time(now, &New_York, &[hm(2, 30)]).unwrap();
        assert_eq!(fire.naive_local(), NaiveDate::from_ymd_opt(2024, 3, 11).unwrap().and_time(hm(2, 30)));
    }

    #[test]
    fn ambiguous_local_time_takes_the_earliest_instant() {
        // 01:30 happens twice on 2024-11-03 in New York
        let now = eastern(2024, 11, 3, 0, 0);
        let fire = next_fire_time(now, &New_York, &[hm(1, 30)]).unwrap();
        assert_eq!(fire.with_timezone(&Utc), Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap());
    }

    #[test]
    fn location_arguments_are_validated() {
        assert!(parse_location(None, None).unwrap().is_none());
        assert_eq!(parse_location(Some("12"), Some("34")).unwrap(), Some((GuildId::new(12), ChannelId::new(34))));

        let missing = parse_location(Some("12"), None).unwrap_err();
        assert_eq!(missing.to_string(), "Missing channel ID to send in server.");

        let not_numeric = parse_location(Some("abc"), Some("34")).unwrap_err();
        assert_eq!(not_numeric.to_string(), "Given ID(s) were not a numerical value.");
        assert!(parse_location(Some("12"), Some("0")).is_err());
    }

    #[derive(Default)]
    struct CountingSink {
        deliveries: AtomicUsize,
    }

    #[async_trait]
    impl AlarmSink for CountingSink {
        async fn deliver(&self, _target: &AlarmTarget, _content: &str) -> Result<MessageId, PinguError> {
            let count = self.deliveries.fetch_add(1, Ordering::SeqCst);
            Ok(MessageId::new(100 + count as u64))
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlarmSink for FailingSink {
        async fn deliver(&self, target: &AlarmTarget, _content: &str) -> Result<MessageId, PinguError> {
            Err(PinguError::MissingData(format!("#{} is gone", target.channel_name)))
        }
    }

    /// Clock that starts at `start` and follows tokio's (paused) time.
    fn paused_clock(start: DateTime<Utc>) -> Clock {
        let origin = tokio::time::Instant::now();
        Arc::new(move || start + chrono::Duration::from_std(origin.elapsed()).unwrap())
    }

    fn schedule() -> Arc<AlarmSchedule> {
        Arc::new(AlarmSchedule { timezone: New_York, times: default_times(), message: "12:34".to_string() })
    }

    fn target() -> AlarmTarget {
        AlarmTarget { guild_id: None, channel_id: ChannelId::new(7), channel_name: "general".to_string(), next_fire_time: None, sent_message: None }
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_keeps_a_single_loop() {
        let alarm = Alarm::with_clock(paused_clock(eastern(2024, 3, 5, 12, 0)));
        let sink = Arc::new(CountingSink::default());

        alarm.arm(target(), schedule(), sink.clone()).await;
        alarm.arm(target(), schedule(), sink.clone()).await;
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;

        assert_eq!(sink.deliveries.load(Ordering::SeqCst), 1);
        assert!(alarm.is_running().await);
        let armed = alarm.target().await.unwrap();
        assert_eq!(armed.sent_message, Some(MessageId::new(100)));
        assert_eq!(armed.next_fire_time.unwrap().naive_local(), NaiveDate::from_ymd_opt(2024, 3, 6).unwrap().and_time(hm(0, 34)));
        assert!(alarm.is_sent_message(ChannelId::new(7), MessageId::new(100)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_delivery() {
        let alarm = Alarm::with_clock(paused_clock(eastern(2024, 3, 5, 12, 0)));
        let sink = Arc::new(CountingSink::default());

        assert!(!alarm.cancel().await);
        alarm.arm(target(), schedule(), sink.clone()).await;
        assert!(alarm.cancel().await);
        assert!(!alarm.is_running().await);
        assert!(alarm.target().await.is_none());

        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(sink.deliveries.load(Ordering::SeqCst), 0);

        // 13:00 now; the next slot is 00:34 tomorrow, the one after that is 12:34
        alarm.arm(target(), schedule(), sink.clone()).await;
        tokio::time::sleep(Duration::from_secs(12 * 60 * 60)).await;
        assert_eq!(sink.deliveries.load(Ordering::SeqCst), 1);
        assert!(alarm.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_wall_clock_does_not_repeat_a_slot() {
        // wall clock stuck at 12:00 while the timer keeps firing
        let frozen = eastern(2024, 3, 5, 12, 0);
        let alarm = Alarm::with_clock(Arc::new(move || frozen));
        let sink = Arc::new(CountingSink::default());

        alarm.arm(target(), schedule(), sink.clone()).await;
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;

        assert_eq!(sink.deliveries.load(Ordering::SeqCst), 1);
        let armed = alarm.target().await.unwrap();
        assert_eq!(armed.next_fire_time.unwrap().naive_local(), NaiveDate::from_ymd_opt(2024, 3, 6).unwrap().and_time(hm(0, 34)));
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_clears_the_target() {
        let alarm = Alarm::with_clock(paused_clock(eastern(2024, 3, 5, 12, 0)));
        alarm.arm(target(), schedule(), Arc::new(FailingSink)).await;

        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert!(alarm.target().await.is_none());
        assert!(!alarm.is_running().await);
    }
}
