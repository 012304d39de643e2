use std::env;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;

use crate::discord::alarm::AlarmSchedule;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub discord_token: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub database_url: String,
    /// Discord user ids allowed to run owner-only commands, on top of the application owner.
    #[serde(default)]
    pub owners: Vec<u64>,
    #[serde(default)]
    pub clown: ClownSettings,
    #[serde(default)]
    pub alarm: AlarmSettings,
    #[serde(default)]
    pub reminders: ReminderSettings,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ClownSettings {
    pub renomination_cooldown_days: i64,
    pub reason_timeout_secs: u64,
    pub poll_duration_secs: u64,
    pub approval_threshold: f64,
    pub min_voice_occupancy: usize,
    pub spam_join_window_mins: i64,
    pub idle_disconnect_secs: u64,
    pub honk_path: String,
}

impl Default for ClownSettings {
    fn default() -> Self {
        ClownSettings {
            renomination_cooldown_days: 7,
            reason_timeout_secs: 60,
            poll_duration_secs: 60,
            approval_threshold: 0.6,
            min_voice_occupancy: 3,
            spam_join_window_mins: 15,
            idle_disconnect_secs: 30,
            honk_path: "soundfx/honk.mp3".to_string(),
        }
    }
}

impl ClownSettings {
    pub fn renomination_cooldown(&self) -> chrono::Duration {
        chrono::Duration::days(self.renomination_cooldown_days)
    }

    pub fn reason_timeout(&self) -> Duration {
        Duration::from_secs(self.reason_timeout_secs)
    }

    pub fn poll_duration(&self) -> Duration {
        Duration::from_secs(self.poll_duration_secs)
    }

    pub fn spam_join_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.spam_join_window_mins)
    }

    pub fn idle_disconnect(&self) -> Duration {
        Duration::from_secs(self.idle_disconnect_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AlarmSettings {
    pub timezone: String,
    /// Daily fire times, formatted as `HH:MM`.
    pub times: Vec<String>,
    pub message: String,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        AlarmSettings { timezone: "America/New_York".to_string(), times: vec!["00:34".to_string(), "12:34".to_string()], message: "12:34".to_string() }
    }
}

impl AlarmSettings {
    pub fn schedule(&self) -> anyhow::Result<AlarmSchedule> {
        let timezone: Tz = self.timezone.parse().map_err(|e| anyhow!("Invalid alarm timezone '{}': {}", self.timezone, e))?;
        let mut times = Vec::with_capacity(self.times.len());
        for time in &self.times {
            let parsed = NaiveTime::parse_from_str(time, "%H:%M").with_context(|| format!("Invalid alarm time '{}'", time))?;
            times.push(parsed);
        }
        if times.is_empty() {
            return Err(anyhow!("At least one alarm time is required"));
        }
        times.sort();
        times.dedup();
        Ok(AlarmSchedule { timezone, times, message: self.message.clone() })
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ReminderSettings {
    pub scan_interval_mins: u64,
    pub max_text_len: usize,
    pub list_limit: i64,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        ReminderSettings { scan_interval_mins: 30, max_text_len: 1000, list_limit: 10 }
    }
}

impl ReminderSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_mins * 60)
    }
}

fn default_prefix() -> String {
    "%".to_string()
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Config> {
        let mut file = File::open(path).with_context(|| format!("Unable to open config file {}", path))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).with_context(|| format!("Unable to read config file {}", path))?;

        let mut config = Config::from_yaml(&contents)?;
        if let Ok(token) = env::var("PINGU_TOKEN") {
            config.discord_token = token;
        }
        if let Ok(database_url) = env::var("DATABASE_URL") {
            config.database_url = database_url;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Config> {
        let config: Config = serde_yaml::from_str(contents).context("Error parsing config file")?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.discord_token.trim().is_empty() {
            return Err(anyhow!("No discord token configured (set discord_token or PINGU_TOKEN)"));
        }
        if self.database_url.trim().is_empty() {
            return Err(anyhow!("No database url configured (set database_url or DATABASE_URL)"));
        }
        if !(0.0..=1.0).contains(&self.clown.approval_threshold) {
            return Err(anyhow!("clown.approval_threshold must be between 0 and 1"));
        }
        self.alarm.schedule()?;
        Ok(())
    }

    pub fn alarm_schedule(&self) -> anyhow::Result<Arc<AlarmSchedule>> {
        Ok(Arc::new(self.alarm.schedule()?))
    }
}
