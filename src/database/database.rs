use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::{table, PgConnection, RunQueryDsl};
use serenity::all::{ChannelId, GuildId, UserId};
use tokio::sync::Mutex;

use crate::discord::error::PinguError;

table! {
    clowns (guild_id) {
        guild_id -> BigInt,
        clown_id -> Nullable<BigInt>,
        previous_clown_id -> Nullable<BigInt>,
        nomination_date -> Date,
        join_time -> Nullable<Timestamptz>,
    }
}

table! {
    reminders (reminder_id) {
        reminder_id -> Integer,
        reminder_text -> Text,
        reminder_time -> Timestamptz,
        user_id -> BigInt,
        channel_id -> BigInt,
    }
}

/// The clown of one guild. Mirrored in memory by [`crate::discord::state::ClownCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClownRecord {
    pub guild_id: GuildId,
    pub clown_id: Option<UserId>,
    pub previous_clown_id: Option<UserId>,
    pub nomination_date: NaiveDate,
    pub join_time: Option<DateTime<Utc>>,
}

impl ClownRecord {
    /// Record produced by a successful nomination: the current holder moves to `previous_clown_id`.
    pub fn nominate(existing: Option<&ClownRecord>, guild_id: GuildId, nominee: UserId, today: NaiveDate) -> ClownRecord {
        ClownRecord {
            guild_id,
            clown_id: Some(nominee),
            previous_clown_id: existing.and_then(|record| record.clown_id),
            nomination_date: today,
            join_time: None,
        }
    }

    pub fn is_clown(&self, user_id: UserId) -> bool {
        self.clown_id == Some(user_id)
    }

    /// The designation lasts `cooldown` from the nomination date.
    pub fn designation_active(&self, today: NaiveDate, cooldown: chrono::Duration) -> bool {
        self.clown_id.is_some() && today < self.nomination_date + cooldown
    }

    pub fn designation_ends(&self, cooldown: chrono::Duration) -> NaiveDate {
        self.nomination_date + cooldown
    }
}

#[derive(Queryable, Insertable, Selectable, AsChangeset, Debug, Clone)]
#[diesel(table_name = clowns)]
#[diesel(treat_none_as_null = true)]
struct InnerClownRecord {
    guild_id: i64,
    clown_id: Option<i64>,
    previous_clown_id: Option<i64>,
    nomination_date: NaiveDate,
    join_time: Option<DateTime<Utc>>,
}

impl From<InnerClownRecord> for ClownRecord {
    fn from(inner: InnerClownRecord) -> Self {
        ClownRecord {
            guild_id: GuildId::new(inner.guild_id as u64),
            clown_id: inner.clown_id.map(|id| UserId::new(id as u64)),
            previous_clown_id: inner.previous_clown_id.map(|id| UserId::new(id as u64)),
            nomination_date: inner.nomination_date,
            join_time: inner.join_time,
        }
    }
}

impl From<&ClownRecord> for InnerClownRecord {
    fn from(record: &ClownRecord) -> Self {
        InnerClownRecord {
            guild_id: record.guild_id.get() as i64,
            clown_id: record.clown_id.map(|id| id.get() as i64),
            previous_clown_id: record.previous_clown_id.map(|id| id.get() as i64),
            nomination_date: record.nomination_date,
            join_time: record.join_time,
        }
    }
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = reminders)]
pub struct Reminder {
    pub reminder_id: i32,
    pub reminder_text: String,
    pub reminder_time: DateTime<Utc>,
    pub user_id: i64,
    pub channel_id: i64,
}

impl Reminder {
    pub fn user(&self) -> UserId {
        UserId::new(self.user_id as u64)
    }

    pub fn channel(&self) -> ChannelId {
        ChannelId::new(self.channel_id as u64)
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = reminders)]
pub struct NewReminder {
    pub reminder_text: String,
    pub reminder_time: DateTime<Utc>,
    pub user_id: i64,
    pub channel_id: i64,
}

impl NewReminder {
    pub fn new(text: String, remind_at: DateTime<Utc>, user_id: UserId, channel_id: ChannelId) -> Self {
        NewReminder { reminder_text: text, reminder_time: remind_at, user_id: user_id.get() as i64, channel_id: channel_id.get() as i64 }
    }
}

pub struct Database {
    pool: Arc<Mutex<Pool<ConnectionManager<PgConnection>>>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish()
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Database { pool: self.pool.clone() }
    }
}

impl Database {
    pub fn new(database_url: &str) -> Result<Self, PinguError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder().build(manager)?;

        let mut conn = pool.get()?;

        diesel::sql_query(
            "CREATE TABLE IF NOT EXISTS clowns (
            guild_id BIGINT PRIMARY KEY,
            clown_id BIGINT,
            previous_clown_id BIGINT,
            nomination_date DATE NOT NULL,
            join_time TIMESTAMPTZ
        )",
        )
        .execute(&mut conn)?;

        diesel::sql_query(
            "CREATE TABLE IF NOT EXISTS reminders (
            reminder_id SERIAL PRIMARY KEY,
            reminder_text TEXT NOT NULL,
            reminder_time TIMESTAMPTZ NOT NULL,
            user_id BIGINT NOT NULL,
            channel_id BIGINT NOT NULL
        )",
        )
        .execute(&mut conn)?;

        Ok(Database { pool: Arc::new(Mutex::new(pool)) })
    }

    pub async fn begin_transaction(&self) -> Result<DatabaseTransaction, PinguError> {
        let pool_guard = self.pool.lock().await;
        let conn = pool_guard.get()?;
        Ok(DatabaseTransaction { conn })
    }
}

pub struct DatabaseTransaction {
    conn: PooledConnection<ConnectionManager<PgConnection>>,
}

impl DatabaseTransaction {
    pub fn load_all_clowns(&mut self) -> Result<Vec<ClownRecord>, PinguError> {
        let records = clowns::table.load::<InnerClownRecord>(&mut self.conn)?;
        Ok(records.into_iter().map(ClownRecord::from).collect())
    }

    pub fn load_clown(&mut self, guild_id: GuildId) -> Result<Option<ClownRecord>, PinguError> {
        let record = clowns::table.find(guild_id.get() as i64).first::<InnerClownRecord>(&mut self.conn).optional()?;
        Ok(record.map(ClownRecord::from))
    }

    pub fn nominate_clown(&mut self, guild_id: GuildId, nominee: UserId, today: NaiveDate) -> Result<ClownRecord, PinguError> {
        let existing = self.load_clown(guild_id)?;
        let record = ClownRecord::nominate(existing.as_ref(), guild_id, nominee, today);
        let inner = InnerClownRecord::from(&record);

        diesel::insert_into(clowns::table).values(&inner).on_conflict(clowns::guild_id).do_update().set(&inner).execute(&mut self.conn)?;

        Ok(record)
    }

    pub fn record_voice_join(&mut self, guild_id: GuildId, at: DateTime<Utc>) -> Result<Option<ClownRecord>, PinguError> {
        let record = diesel::update(clowns::table.find(guild_id.get() as i64))
            .set(clowns::join_time.eq(Some(at)))
            .get_result::<InnerClownRecord>(&mut self.conn)
            .optional()?;
        Ok(record.map(ClownRecord::from))
    }

    pub fn reset_clown(&mut self, guild_id: GuildId) -> Result<Option<ClownRecord>, PinguError> {
        let record = diesel::update(clowns::table.find(guild_id.get() as i64))
            .set((clowns::previous_clown_id.eq(clowns::clown_id), clowns::clown_id.eq(None::<i64>), clowns::join_time.eq(None::<DateTime<Utc>>)))
            .get_result::<InnerClownRecord>(&mut self.conn)
            .optional()?;
        Ok(record.map(ClownRecord::from))
    }

    pub fn save_reminder(&mut self, reminder: &NewReminder) -> Result<Reminder, PinguError> {
        let saved = diesel::insert_into(reminders::table).values(reminder).get_result::<Reminder>(&mut self.conn)?;
        Ok(saved)
    }

    pub fn load_reminders_for_user(&mut self, user_id: UserId, limit: i64) -> Result<Vec<Reminder>, PinguError> {
        let found = reminders::table
            .filter(reminders::user_id.eq(user_id.get() as i64))
            .order(reminders::reminder_time.asc())
            .limit(limit)
            .load::<Reminder>(&mut self.conn)?;
        Ok(found)
    }

    pub fn load_reminders_due_before(&mut self, before: DateTime<Utc>) -> Result<Vec<Reminder>, PinguError> {
        let found = reminders::table.filter(reminders::reminder_time.le(before)).order(reminders::reminder_time.asc()).load::<Reminder>(&mut self.conn)?;
        Ok(found)
    }

    pub fn delete_reminder(&mut self, reminder_id: i32) -> Result<usize, PinguError> {
        let deleted = diesel::delete(reminders::table.find(reminder_id)).execute(&mut self.conn)?;
        Ok(deleted)
    }

    pub fn delete_user_reminder(&mut self, user_id: UserId, reminder_id: i32) -> Result<usize, PinguError> {
        let deleted = diesel::delete(reminders::table.filter(reminders::reminder_id.eq(reminder_id)).filter(reminders::user_id.eq(user_id.get() as i64))).execute(&mut self.conn)?;
        Ok(deleted)
    }

    pub fn delete_reminders_for_user(&mut self, user_id: UserId) -> Result<usize, PinguError> {
        let deleted = diesel::delete(reminders::table.filter(reminders::user_id.eq(user_id.get() as i64))).execute(&mut self.conn)?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn nomination_moves_current_holder_to_previous() {
        let guild = GuildId::new(10);
        let first = ClownRecord::nominate(None, guild, UserId::new(1), date(2024, 3, 1));
        assert_eq!(first.clown_id, Some(UserId::new(1)));
        assert_eq!(first.previous_clown_id, None);

        let second = ClownRecord::nominate(Some(&first), guild, UserId::new(2), date(2024, 3, 9));
        assert_eq!(second.clown_id, Some(UserId::new(2)));
        assert_eq!(second.previous_clown_id, Some(UserId::new(1)));
        assert_ne!(second.clown_id, second.previous_clown_id);
        assert_eq!(second.join_time, None);
    }

    #[test]
    fn designation_expires_after_cooldown() {
        let record = ClownRecord::nominate(None, GuildId::new(10), UserId::new(1), date(2024, 3, 1));
        let week = chrono::Duration::days(7);
        assert!(record.designation_active(date(2024, 3, 1), week));
        assert!(record.designation_active(date(2024, 3, 7), week));
        assert!(!record.designation_active(date(2024, 3, 8), week));
        assert_eq!(record.designation_ends(week), date(2024, 3, 8));
    }

    #[test]
    fn record_survives_row_conversion() {
        let record = ClownRecord {
            guild_id: GuildId::new(123),
            clown_id: Some(UserId::new(456)),
            previous_clown_id: None,
            nomination_date: date(2024, 1, 2),
            join_time: Some(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
        };
        let inner = InnerClownRecord::from(&record);
        assert_eq!(inner.guild_id, 123);
        assert_eq!(ClownRecord::from(inner), record);
    }
}
