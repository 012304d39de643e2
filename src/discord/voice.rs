use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, Context as SerenityContext, GuildId, Permissions, VoiceState};
use serenity::async_trait;
use songbird::tracks::TrackHandle;
use songbird::{Event, EventContext, EventHandler as SongbirdEventHandler, Songbird, TrackEvent};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::database::database::ClownRecord;
use crate::discord::commands::{Data, Error};
use crate::discord::error::PinguError;
use crate::discord::state::VoicePhase;
use crate::discord::utils::{bot_permissions_in, voice_occupancy};

/// Leaves a guild's voice channel.
#[async_trait]
pub trait VoiceLeaver: Send + Sync + 'static {
    async fn leave(&self, guild_id: GuildId);
}

#[async_trait]
impl VoiceLeaver for Songbird {
    async fn leave(&self, guild_id: GuildId) {
        if self.get(guild_id).is_none() {
            return;
        }
        if let Err(e) = self.remove(guild_id).await {
            tracing::warn!("Failed to leave voice in {}: {}", guild_id, e);
        }
    }
}

#[derive(Default)]
struct VoiceSession {
    phase: VoicePhase,
    channel_id: Option<ChannelId>,
    track: Option<TrackHandle>,
    idle_task: Option<JoinHandle<()>>,
    epoch: u64,
    /// The clip played to the end; only the idle disconnect remains.
    finished: bool,
}

/// Per-guild honk playback state.
#[derive(Clone, Default)]
pub struct VoiceTracker {
    sessions: Arc<Mutex<HashMap<GuildId, VoiceSession>>>,
}

impl VoiceTracker {
    pub async fn phase(&self, guild_id: GuildId) -> VoicePhase {
        self.sessions.lock().await.get(&guild_id).map(|session| session.phase).unwrap_or_default()
    }

    pub async fn channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.sessions.lock().await.get(&guild_id).and_then(|session| session.channel_id)
    }

    /// `Idle -> Connecting`. Returns false when the guild already has a session.
    pub async fn begin(&self, guild_id: GuildId, channel_id: ChannelId) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(&guild_id).is_some_and(|session| session.phase != VoicePhase::Idle) {
            return false;
        }
        sessions.insert(guild_id, VoiceSession { phase: VoicePhase::Connecting, channel_id: Some(channel_id), ..Default::default() });
        true
    }

    pub async fn playing(&self, guild_id: GuildId, track: TrackHandle) {
        self.set_playing(guild_id, Some(track)).await;
    }

    async fn set_playing(&self, guild_id: GuildId, track: Option<TrackHandle>) {
        if let Some(session) = self.sessions.lock().await.get_mut(&guild_id) {
            session.phase = VoicePhase::Playing;
            session.track = track;
        }
    }

    /// Pauses a playing honk. Returns whether the guild has an active (playing or paused) honk.
    pub async fn pause(&self, guild_id: GuildId) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&guild_id) else {
            return false;
        };
        if session.finished {
            return false;
        }
        match session.phase {
            VoicePhase::Playing => {
                if let Some(track) = &session.track {
                    if let Err(e) = track.pause() {
                        tracing::warn!("Failed to pause honk in {}: {}", guild_id, e);
                    }
                }
                session.phase = VoicePhase::Paused;
                true
            }
            VoicePhase::Paused => true,
            _ => false,
        }
    }

    /// Resumes a paused honk and cancels any pending idle disconnect.
    pub async fn resume(&self, guild_id: GuildId) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&guild_id) else {
            return false;
        };
        if session.finished || session.phase != VoicePhase::Paused {
            return false;
        }
        if let Some(task) = session.idle_task.take() {
            task.abort();
        }
        session.epoch += 1;
        if let Some(track) = &session.track {
            if let Err(e) = track.play() {
                tracing::warn!("Failed to resume honk in {}: {}", guild_id, e);
            }
        }
        session.phase = VoicePhase::Playing;
        true
    }

    /// Leaves the channel after `after` unless the session is resumed or replaced first.
    pub async fn schedule_disconnect(&self, guild_id: GuildId, leaver: Arc<dyn VoiceLeaver>, after: Duration) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&guild_id) else {
            return false;
        };
        if let Some(task) = session.idle_task.take() {
            task.abort();
        }
        session.epoch += 1;
        let epoch = session.epoch;
        let tracker = self.clone();
        session.idle_task = Some(tokio::spawn(async move {
            sleep(after).await;
            tracker.expire(guild_id, epoch, leaver).await;
        }));
        true
    }

    /// Marks the clip as played out and schedules the idle disconnect. Later pauses and
    /// resumes leave that disconnect alone.
    pub async fn finish(&self, guild_id: GuildId, leaver: Arc<dyn VoiceLeaver>, after: Duration) -> bool {
        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&guild_id) else {
                return false;
            };
            session.finished = true;
            session.track = None;
        }
        self.schedule_disconnect(guild_id, leaver, after).await
    }

    async fn expire(&self, guild_id: GuildId, epoch: u64, leaver: Arc<dyn VoiceLeaver>) {
        {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&guild_id) {
                Some(session) if session.epoch == epoch => {
                    session.phase = VoicePhase::Disconnecting;
                    session.idle_task = None;
                }
                _ => return,
            }
        }

        tracing::info!("Leaving voice in {} after idling", guild_id);
        leaver.leave(guild_id).await;

        let mut sessions = self.sessions.lock().await;
        if sessions.get(&guild_id).is_some_and(|session| session.epoch == epoch) {
            sessions.remove(&guild_id);
        }
    }

    /// Stops playback and leaves immediately. Returns whether a session existed.
    pub async fn disconnect(&self, guild_id: GuildId, leaver: &dyn VoiceLeaver) -> bool {
        let existed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&guild_id) {
                Some(session) => {
                    if let Some(task) = session.idle_task.take() {
                        task.abort();
                    }
                    session.epoch += 1;
                    session.phase = VoicePhase::Disconnecting;
                    if let Some(track) = session.track.take() {
                        if let Err(e) = track.stop() {
                            tracing::warn!("Failed to stop honk in {}: {}", guild_id, e);
                        }
                    }
                    true
                }
                None => false,
            }
        };

        leaver.leave(guild_id).await;
        self.reset(guild_id).await;
        existed
    }

    /// Drops the session, returning the guild to `Idle`.
    pub async fn reset(&self, guild_id: GuildId) {
        if let Some(session) = self.sessions.lock().await.remove(&guild_id) {
            if let Some(task) = session.idle_task {
                task.abort();
            }
        }
    }
}

struct HonkEndNotifier {
    guild_id: GuildId,
    tracker: VoiceTracker,
    leaver: Arc<dyn VoiceLeaver>,
    idle: Duration,
}

#[async_trait]
impl SongbirdEventHandler for HonkEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        tracing::debug!("Honk finished in {}", self.guild_id);
        self.tracker.finish(self.guild_id, self.leaver.clone(), self.idle).await;
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub channel_id: Option<ChannelId>,
    pub deafened: bool,
}

impl Presence {
    pub fn from_state(state: &VoiceState) -> Self {
        Presence { channel_id: state.channel_id, deafened: state.self_deaf || state.deaf }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Joined(ChannelId),
    Left(ChannelId),
    Moved { from: ChannelId, to: ChannelId },
    Deafened,
    Undeafened,
    Unchanged,
}

pub fn classify(old: Option<Presence>, new: Presence) -> Transition {
    let old_channel = old.and_then(|presence| presence.channel_id);
    match (old_channel, new.channel_id) {
        (None, Some(to)) => Transition::Joined(to),
        (Some(from), None) => Transition::Left(from),
        (Some(from), Some(to)) if from != to => Transition::Moved { from, to },
        (Some(_), Some(_)) => {
            let was_deafened = old.is_some_and(|presence| presence.deafened);
            match (was_deafened, new.deafened) {
                (false, true) => Transition::Deafened,
                (true, false) => Transition::Undeafened,
                _ => Transition::Unchanged,
            }
        }
        (None, None) => Transition::Unchanged,
    }
}

#[derive(Debug, Clone)]
pub struct JoinFacts {
    pub designation_active: bool,
    pub last_trigger: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub spam_window: chrono::Duration,
    pub occupancy: usize,
    pub min_occupancy: usize,
    pub permissions: Permissions,
    pub phase: VoicePhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DesignationExpired,
    RecentlyTriggered,
    NotEnoughOccupants { occupancy: usize, required: usize },
    MissingPermissions(Vec<&'static str>),
    Busy(VoicePhase),
}

pub fn missing_voice_permissions(permissions: Permissions) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if !permissions.contains(Permissions::CONNECT) {
        missing.push("Connect");
    }
    if !permissions.contains(Permissions::SPEAK) {
        missing.push("Speak");
    }
    missing
}

/// Whether the clown joining a channel should start a honk.
pub fn evaluate_join(facts: &JoinFacts) -> Result<(), SkipReason> {
    if !facts.designation_active {
        return Err(SkipReason::DesignationExpired);
    }
    if facts.last_trigger.is_some_and(|last| facts.now - last < facts.spam_window) {
        return Err(SkipReason::RecentlyTriggered);
    }
    if facts.occupancy < facts.min_occupancy {
        return Err(SkipReason::NotEnoughOccupants { occupancy: facts.occupancy, required: facts.min_occupancy });
    }
    let missing = missing_voice_permissions(facts.permissions);
    if !missing.is_empty() {
        return Err(SkipReason::MissingPermissions(missing));
    }
    if facts.phase != VoicePhase::Idle {
        return Err(SkipReason::Busy(facts.phase));
    }
    Ok(())
}

pub async fn songbird_manager(ctx: &SerenityContext) -> Result<Arc<Songbird>, PinguError> {
    songbird::get(ctx).await.ok_or_else(|| PinguError::MissingData("Voice client was not initialised.".to_string()))
}

/// Joins `channel_id` and starts the honk clip. The caller must have moved the guild to `Connecting`.
pub async fn play_honk(ctx: &SerenityContext, data: &Data, guild_id: GuildId, channel_id: ChannelId) -> Result<(), PinguError> {
    let manager = songbird_manager(ctx).await?;
    let call = manager.join(guild_id, channel_id).await?;

    let source = songbird::input::File::new(data.config.clown.honk_path.clone());
    let track = call.lock().await.play_input(source.into());

    let leaver: Arc<dyn VoiceLeaver> = manager.clone();
    let notifier = HonkEndNotifier { guild_id, tracker: data.voice.clone(), leaver, idle: data.config.clown.idle_disconnect() };
    if let Err(e) = track.add_event(Event::Track(TrackEvent::End), notifier) {
        tracing::warn!("Unable to watch honk track in {}: {}", guild_id, e);
    }

    data.voice.playing(guild_id, track).await;
    tracing::info!("Honking in {} / {}", guild_id, channel_id);
    Ok(())
}

async fn start_honk(ctx: &SerenityContext, data: &Data, guild_id: GuildId, channel_id: ChannelId, now: DateTime<Utc>) -> Result<(), PinguError> {
    if let Some(updated) = data.database.begin_transaction().await?.record_voice_join(guild_id, now)? {
        data.clowns.refresh(updated).await;
    }
    play_honk(ctx, data, guild_id, channel_id).await
}

async fn trigger_honk(ctx: &SerenityContext, data: &Data, guild_id: GuildId, channel_id: ChannelId, record: &ClownRecord) -> Result<(), Error> {
    let settings = &data.config.clown;
    let now = Utc::now();
    let facts = JoinFacts {
        designation_active: record.designation_active(now.date_naive(), settings.renomination_cooldown()),
        last_trigger: record.join_time,
        now,
        spam_window: settings.spam_join_window(),
        occupancy: voice_occupancy(&ctx.cache, guild_id, channel_id),
        min_occupancy: settings.min_voice_occupancy,
        permissions: bot_permissions_in(&ctx.cache, guild_id, channel_id).unwrap_or_else(Permissions::empty),
        phase: data.voice.phase(guild_id).await,
    };

    if let Err(reason) = evaluate_join(&facts) {
        match reason {
            SkipReason::MissingPermissions(missing) => tracing::warn!("Not honking in {}: {}", guild_id, PinguError::MissingVoicePermissions(missing)),
            reason => tracing::info!("Not honking in {}: {:?}", guild_id, reason),
        }
        return Ok(());
    }

    if !data.voice.begin(guild_id, channel_id).await {
        return Ok(());
    }

    if let Err(e) = start_honk(ctx, data, guild_id, channel_id, now).await {
        data.voice.reset(guild_id).await;
        return Err(e.into());
    }
    Ok(())
}

pub async fn on_voice_state_update(ctx: &SerenityContext, data: &Data, old: Option<&VoiceState>, new: &VoiceState) -> Result<(), Error> {
    let Some(guild_id) = new.guild_id else {
        return Ok(());
    };
    let Some(record) = data.clowns.get(guild_id).await else {
        return Ok(());
    };
    if !record.is_clown(new.user_id) {
        return Ok(());
    }

    let transition = classify(old.map(Presence::from_state), Presence::from_state(new));
    let honk_channel = data.voice.channel(guild_id).await;
    let idle = data.config.clown.idle_disconnect();

    match transition {
        Transition::Joined(channel_id) | Transition::Moved { to: channel_id, .. } if honk_channel == Some(channel_id) => {
            data.voice.resume(guild_id).await;
        }
        Transition::Joined(channel_id) => trigger_honk(ctx, data, guild_id, channel_id, &record).await?,
        Transition::Left(_) | Transition::Moved { .. } => {
            if data.voice.pause(guild_id).await {
                let leaver: Arc<dyn VoiceLeaver> = songbird_manager(ctx).await?;
                data.voice.schedule_disconnect(guild_id, leaver, idle).await;
            }
        }
        Transition::Deafened => {
            data.voice.pause(guild_id).await;
        }
        Transition::Undeafened if new.channel_id == honk_channel => {
            data.voice.resume(guild_id).await;
        }
        Transition::Undeafened | Transition::Unchanged => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn facts() -> JoinFacts {
        JoinFacts {
            designation_active: true,
            last_trigger: None,
            now: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            spam_window: chrono::Duration::minutes(15),
            occupancy: 3,
            min_occupancy: 3,
            permissions: Permissions::CONNECT | Permissions::SPEAK,
            phase: VoicePhase::Idle,
        }
    }

    #[test]
    fn all_conditions_met_triggers() {
        assert_eq!(evaluate_join(&facts()), Ok(()));
    }

    #[test]
    fn two_occupants_are_not_enough() {
        let facts = JoinFacts { occupancy: 2, ..facts() };
        assert_eq!(evaluate_join(&facts), Err(SkipReason::NotEnoughOccupants { occupancy: 2, required: 3 }));
    }

    #[test]
    fn recent_trigger_is_treated_as_spam() {
        let base = facts();
        let recent = JoinFacts { last_trigger: Some(base.now - chrono::Duration::minutes(10)), ..base.clone() };
        assert_eq!(evaluate_join(&recent), Err(SkipReason::RecentlyTriggered));

        let stale = JoinFacts { last_trigger: Some(base.now - chrono::Duration::minutes(20)), ..base };
        assert_eq!(evaluate_join(&stale), Ok(()));
    }

    #[test]
    fn expired_designation_never_triggers() {
        let facts = JoinFacts { designation_active: false, ..facts() };
        assert_eq!(evaluate_join(&facts), Err(SkipReason::DesignationExpired));
    }

    #[test]
    fn missing_permissions_are_listed() {
        let facts = JoinFacts { permissions: Permissions::CONNECT, ..facts() };
        assert_eq!(evaluate_join(&facts), Err(SkipReason::MissingPermissions(vec!["Speak"])));
        assert_eq!(missing_voice_permissions(Permissions::empty()), vec!["Connect", "Speak"]);
    }

    #[test]
    fn busy_guild_is_skipped() {
        let facts = JoinFacts { phase: VoicePhase::Playing, ..facts() };
        assert_eq!(evaluate_join(&facts), Err(SkipReason::Busy(VoicePhase::Playing)));
    }

    #[test]
    fn voice_transitions_are_classified() {
        let a = ChannelId::new(1);
        let b = ChannelId::new(2);
        let in_a = Presence { channel_id: Some(a), deafened: false };
        let in_b = Presence { channel_id: Some(b), deafened: false };
        let nowhere = Presence { channel_id: None, deafened: false };

        assert_eq!(classify(None, in_a), Transition::Joined(a));
        assert_eq!(classify(Some(nowhere), in_a), Transition::Joined(a));
        assert_eq!(classify(Some(in_a), nowhere), Transition::Left(a));
        assert_eq!(classify(Some(in_a), in_b), Transition::Moved { from: a, to: b });
        assert_eq!(classify(Some(in_a), Presence { deafened: true, ..in_a }), Transition::Deafened);
        assert_eq!(classify(Some(Presence { deafened: true, ..in_a }), in_a), Transition::Undeafened);
        assert_eq!(classify(Some(in_a), in_a), Transition::Unchanged);
    }

    #[derive(Default)]
    struct CountingLeaver {
        leaves: AtomicUsize,
    }

    #[async_trait]
    impl VoiceLeaver for CountingLeaver {
        async fn leave(&self, _guild_id: GuildId) {
            self.leaves.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn only_idle_guilds_can_begin() {
        let tracker = VoiceTracker::default();
        let guild = GuildId::new(1);
        assert!(tracker.begin(guild, ChannelId::new(9)).await);
        assert!(!tracker.begin(guild, ChannelId::new(9)).await);
        assert_eq!(tracker.phase(guild).await, VoicePhase::Connecting);
        assert_eq!(tracker.channel(guild).await, Some(ChannelId::new(9)));

        tracker.reset(guild).await;
        assert_eq!(tracker.phase(guild).await, VoicePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn returning_clown_cancels_idle_disconnect() {
        let tracker = VoiceTracker::default();
        let leaver = Arc::new(CountingLeaver::default());
        let guild = GuildId::new(1);

        tracker.begin(guild, ChannelId::new(9)).await;
        tracker.set_playing(guild, None).await;
        assert!(tracker.pause(guild).await);
        assert_eq!(tracker.phase(guild).await, VoicePhase::Paused);
        assert!(tracker.schedule_disconnect(guild, leaver.clone(), Duration::from_secs(30)).await);

        sleep(Duration::from_secs(10)).await;
        assert!(tracker.resume(guild).await);
        sleep(Duration::from_secs(60)).await;

        assert_eq!(leaver.leaves.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.phase(guild).await, VoicePhase::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_clown_gets_disconnected_after_idle_period() {
        let tracker = VoiceTracker::default();
        let leaver = Arc::new(CountingLeaver::default());
        let guild = GuildId::new(1);

        tracker.begin(guild, ChannelId::new(9)).await;
        tracker.set_playing(guild, None).await;
        tracker.pause(guild).await;
        tracker.schedule_disconnect(guild, leaver.clone(), Duration::from_secs(30)).await;

        sleep(Duration::from_secs(31)).await;
        assert_eq!(leaver.leaves.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.phase(guild).await, VoicePhase::Idle);
        assert!(tracker.begin(guild, ChannelId::new(9)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_honk_still_leaves_after_deafen_toggle() {
        let tracker = VoiceTracker::default();
        let leaver = Arc::new(CountingLeaver::default());
        let guild = GuildId::new(1);

        tracker.begin(guild, ChannelId::new(9)).await;
        tracker.set_playing(guild, None).await;
        assert!(tracker.finish(guild, leaver.clone(), Duration::from_secs(30)).await);

        // deafen, undeafen
        assert!(!tracker.pause(guild).await);
        assert!(!tracker.resume(guild).await);

        sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(leaver.leaves.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.phase(guild).await, VoicePhase::Idle);
        assert!(tracker.begin(guild, ChannelId::new(9)).await);
    }

    #[tokio::test]
    async fn manual_disconnect_leaves_immediately() {
        let tracker = VoiceTracker::default();
        let leaver = CountingLeaver::default();
        let guild = GuildId::new(1);

        assert!(!tracker.disconnect(guild, &leaver).await);
        tracker.begin(guild, ChannelId::new(9)).await;
        tracker.set_playing(guild, None).await;
        assert!(tracker.disconnect(guild, &leaver).await);
        assert_eq!(leaver.leaves.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.phase(guild).await, VoicePhase::Idle);
    }
}
