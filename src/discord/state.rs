use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use serenity::all::{GuildId, MessageId, UserId};
use tokio::sync::RwLock;

use crate::database::database::ClownRecord;
use crate::discord::error::PinguError;

/// Playback phase of the honk in one guild.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum VoicePhase {
    #[default]
    Idle,
    Connecting,
    Playing,
    Paused,
    Disconnecting,
}

impl fmt::Display for VoicePhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let phase = match self {
            VoicePhase::Idle => "idle",
            VoicePhase::Connecting => "connecting",
            VoicePhase::Playing => "playing",
            VoicePhase::Paused => "paused",
            VoicePhase::Disconnecting => "disconnecting",
        };
        write!(f, "{}", phase)
    }
}

/// In-memory mirror of the `clowns` table, refreshed after every write.
#[derive(Clone, Default, Debug)]
pub struct ClownCache {
    records: Arc<RwLock<HashMap<GuildId, ClownRecord>>>,
}

impl ClownCache {
    pub fn from_records(records: Vec<ClownRecord>) -> Self {
        let records = records.into_iter().map(|record| (record.guild_id, record)).collect();
        ClownCache { records: Arc::new(RwLock::new(records)) }
    }

    pub async fn get(&self, guild_id: GuildId) -> Option<ClownRecord> {
        self.records.read().await.get(&guild_id).cloned()
    }

    pub async fn refresh(&self, record: ClownRecord) {
        self.records.write().await.insert(record.guild_id, record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollState {
    pub nominee: UserId,
    pub prompt_message: Option<MessageId>,
    pub poll_message: Option<MessageId>,
    pub reason: Option<String>,
    pub open_until: Option<DateTime<Utc>>,
}

/// At most one open nomination per guild.
///
/// The map is guarded by a std mutex that is never held across an await point, so opening a
/// poll is a single check-and-insert.
#[derive(Clone, Default, Debug)]
pub struct PollRegistry {
    polls: Arc<std::sync::Mutex<HashMap<GuildId, PollState>>>,
}

impl PollRegistry {
    pub fn try_open(&self, guild_id: GuildId, nominee: UserId) -> Result<PollGuard, PinguError> {
        let mut polls = self.polls.lock().unwrap_or_else(PoisonError::into_inner);
        if polls.contains_key(&guild_id) {
            return Err(PinguError::bad_argument("A nomination is already in progress."));
        }
        polls.insert(guild_id, PollState { nominee, prompt_message: None, poll_message: None, reason: None, open_until: None });
        Ok(PollGuard { registry: self.clone(), guild_id })
    }

    pub fn get(&self, guild_id: GuildId) -> Option<PollState> {
        self.polls.lock().unwrap_or_else(PoisonError::into_inner).get(&guild_id).cloned()
    }

    pub fn is_open(&self, guild_id: GuildId) -> bool {
        self.polls.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&guild_id)
    }

    fn update(&self, guild_id: GuildId, f: impl FnOnce(&mut PollState)) {
        if let Some(state) = self.polls.lock().unwrap_or_else(PoisonError::into_inner).get_mut(&guild_id) {
            f(state);
        }
    }

    fn close(&self, guild_id: GuildId) {
        self.polls.lock().unwrap_or_else(PoisonError::into_inner).remove(&guild_id);
    }
}

/// Keeps a guild's poll open; dropping it closes the poll on every exit path.
#[derive(Debug)]
pub struct PollGuard {
    registry: PollRegistry,
    guild_id: GuildId,
}

impl PollGuard {
    pub fn set_prompt(&self, message_id: MessageId) {
        self.registry.update(self.guild_id, |state| state.prompt_message = Some(message_id));
    }

    pub fn set_poll(&self, message_id: MessageId, reason: String, open_until: DateTime<Utc>) {
        self.registry.update(self.guild_id, |state| {
            state.poll_message = Some(message_id);
            state.reason = Some(reason);
            state.open_until = Some(open_until);
        });
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.registry.close(self.guild_id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn only_one_poll_per_guild() {
        let registry = PollRegistry::default();
        let guild = GuildId::new(1);

        let guard = registry.try_open(guild, UserId::new(5)).unwrap();
        assert!(registry.is_open(guild));
        assert!(matches!(registry.try_open(guild, UserId::new(6)), Err(PinguError::BadArgument(_))));

        // other guilds are unaffected
        let other = registry.try_open(GuildId::new(2), UserId::new(6)).unwrap();
        drop(other);

        drop(guard);
        assert!(!registry.is_open(guild));
        assert!(registry.try_open(guild, UserId::new(6)).is_ok());
    }

    #[test]
    fn guard_updates_are_visible_through_the_registry() {
        let registry = PollRegistry::default();
        let guild = GuildId::new(1);
        let guard = registry.try_open(guild, UserId::new(5)).unwrap();
        guard.set_prompt(MessageId::new(40));
        let until = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        guard.set_poll(MessageId::new(41), "honks too much".to_string(), until);

        let state = registry.get(guild).unwrap();
        assert_eq!(state.nominee, UserId::new(5));
        assert_eq!(state.prompt_message, Some(MessageId::new(40)));
        assert_eq!(state.poll_message, Some(MessageId::new(41)));
        assert_eq!(state.reason.as_deref(), Some("honks too much"));
        assert_eq!(state.open_until, Some(until));
    }

    #[test]
    fn guard_closes_poll_when_unwinding() {
        let registry = PollRegistry::default();
        let guild = GuildId::new(1);
        let cloned = registry.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_open(guild, UserId::new(5)).unwrap();
            panic!("nomination task died");
        });
        assert!(result.is_err());
        assert!(!registry.is_open(guild));
    }

    #[test]
    fn voice_phase_renders_lowercase() {
        assert_eq!(VoicePhase::default().to_string(), "idle");
        assert_eq!(format!("voice phase: `{}`", VoicePhase::Disconnecting), "voice phase: `disconnecting`");
    }

    #[tokio::test]
    async fn cache_refresh_replaces_guild_record() {
        let guild = GuildId::new(3);
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let cache = ClownCache::from_records(vec![ClownRecord::nominate(None, guild, UserId::new(1), day)]);
        assert_eq!(cache.len().await, 1);

        let existing = cache.get(guild).await;
        cache.refresh(ClownRecord::nominate(existing.as_ref(), guild, UserId::new(2), day)).await;

        let record = cache.get(guild).await.unwrap();
        assert!(record.is_clown(UserId::new(2)));
        assert_eq!(record.previous_clown_id, Some(UserId::new(1)));
        assert!(cache.get(GuildId::new(4)).await.is_none());
    }
}
