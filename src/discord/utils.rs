use std::fmt;

use chrono::Duration;
use serenity::all::{Cache, ChannelId, Colour, CreateEmbed, CreateEmbedFooter, GuildId, Member, Permissions, User, UserId};

pub const EMBED_COLOUR: Colour = Colour::new(0x8AB5FC);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Icons {
    Fail,
    Info,
    Success,
    Audio,
    Sleep,
}

impl fmt::Display for Icons {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let icon = match self {
            Icons::Fail => ":x:",
            Icons::Info => ":information_source:",
            Icons::Success => ":white_check_mark:",
            Icons::Audio => ":speaker:",
            Icons::Sleep => ":zzz:",
        };
        write!(f, "{}", icon)
    }
}

/// `nick (username)` when the member has a nickname, otherwise just the username.
pub fn display_member(member: &Member) -> String {
    display_name(member.nick.as_deref(), &member.user.name)
}

pub fn display_name(nick: Option<&str>, username: &str) -> String {
    match nick {
        Some(nick) => format!("{} ({})", nick, username),
        None => username.to_string(),
    }
}

pub fn requested_by_footer(user: &User) -> CreateEmbedFooter {
    CreateEmbedFooter::new(format!("Requested by: {}", user.name)).icon_url(user.face())
}

pub fn base_embed() -> CreateEmbed {
    CreateEmbed::new().colour(EMBED_COLOUR)
}

/// Permissions the bot has in a cached guild channel.
pub fn bot_permissions_in(cache: &Cache, guild_id: GuildId, channel_id: ChannelId) -> Option<Permissions> {
    let bot_id = cache.current_user().id;
    let guild = cache.guild(guild_id)?;
    let channel = guild.channels.get(&channel_id)?;
    let member = guild.members.get(&bot_id)?;
    Some(guild.user_permissions_in(channel, member))
}

/// Number of users connected to a voice channel according to the cached voice states.
pub fn voice_occupancy(cache: &Cache, guild_id: GuildId, channel_id: ChannelId) -> usize {
    match cache.guild(guild_id) {
        Some(guild) => guild.voice_states.values().filter(|state| state.channel_id == Some(channel_id)).count(),
        None => 0,
    }
}

pub fn user_voice_channel(cache: &Cache, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = cache.guild(guild_id)?;
    let channel_id = guild.voice_states.get(&user_id)?.channel_id;
    channel_id
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} Bytes", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("**{days}** days, **{hours}** hours,\n**{minutes}** minutes, **{seconds}** seconds")
}

/// Compact remaining time, e.g. `2m 5s`.
pub fn format_remaining(remaining: Duration) -> String {
    let total = remaining.num_seconds().max(0) as u64;
    humantime::format_duration(std::time::Duration::from_secs(total)).to_string()
}
