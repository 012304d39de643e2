use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::database::database::Database;
use crate::discord::alarm::{self, Alarm, AlarmSchedule};
use crate::discord::reminders::{self, ReminderQueue};
use crate::discord::state::{ClownCache, PollRegistry};
use crate::discord::voice::VoiceTracker;
use crate::discord::{admin, clown, help, misc};

/// Everything shared between commands and event handlers.
pub struct Data {
    pub config: Config,
    pub database: Database,
    pub clowns: ClownCache,
    pub polls: PollRegistry,
    pub alarm: Alarm,
    pub alarm_schedule: Arc<AlarmSchedule>,
    pub voice: VoiceTracker,
    pub reminders: ReminderQueue,
    pub started_at: DateTime<Utc>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

/// Every command the bot registers, grouped the same way the help pages are.
pub fn all_commands() -> Vec<poise::Command<Data, Error>> {
    let mut commands = vec![
        alarm::set_alarm(),
        alarm::no1234(),
        alarm::when1234(),
        clown::clown(),
        reminders::remindme(),
        help::help(),
        misc::status(),
        misc::yoink(),
        misc::invite(),
        admin::shutdown(),
    ];
    qualify(&mut commands, None);
    commands
}

fn qualify(commands: &mut [poise::Command<Data, Error>], parent: Option<&str>) {
    for command in commands {
        if let Some(parent) = parent {
            command.qualified_name = format!("{} {}", parent, command.name);
        }
        let name = command.qualified_name.clone();
        qualify(&mut command.subcommands, Some(&name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_are_unique() {
        let commands = all_commands();
        let mut names: Vec<&str> = commands.iter().map(|command| command.name.as_str()).collect();
        names.sort();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
        assert!(names.contains(&"1234"));
    }

    #[test]
    fn subcommands_carry_their_parent_name() {
        let commands = all_commands();
        let clown = commands.iter().find(|command| command.name == "clown").unwrap();
        let names: Vec<&str> = clown.subcommands.iter().map(|command| command.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["clown nominate", "clown status", "clown honk", "clown reset", "clown disconnect", "clown debug"]);
        assert!(clown.subcommands.iter().filter(|command| command.owners_only).count() == 3);
    }
}
