use std::time::Duration;

use chrono::Utc;
use poise::serenity_prelude as serenity;
use poise::serenity_prelude::{Mentionable, UserId};
use poise::Command;
use sysinfo::System;

use crate::discord::commands::{Context, Data, Error};
use crate::discord::utils::{base_embed, display_member, format_bytes, format_uptime, requested_by_footer, Icons};

/// Invite permissions: view channels, send messages, embed links, add reactions, connect, speak, manage messages.
const INVITE_PERMISSIONS: u64 = 3525696;

pub fn invite_url(client_id: UserId) -> String {
    format!("https://discord.com/api/oauth2/authorize?client_id={}&permissions={}&scope=bot", client_id, INVITE_PERMISSIONS)
}

fn latency_indicator(latency: Duration) -> &'static str {
    match latency.as_millis() {
        0..=99 => ":green_circle:",
        100..=199 => ":yellow_circle:",
        _ => ":red_circle:",
    }
}

fn count_commands(commands: &[Command<Data, Error>]) -> usize {
    commands.iter().map(|command| 1 + count_commands(&command.subcommands)).sum()
}

/// Show some info and stats about Pingu
#[poise::command(prefix_command, aliases("about", "stats"), member_cooldown = 3, category = "Misc")]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let data = ctx.data();
    let latency = ctx.ping().await;

    let (guilds, channels, users) = {
        let cache = ctx.cache();
        let guild_ids = cache.guilds();
        let channels: usize = guild_ids.iter().filter_map(|guild_id| cache.guild(*guild_id).map(|guild| guild.channels.len())).sum();
        (guild_ids.len(), channels, cache.user_count())
    };
    let commands = count_commands(&ctx.framework().options().commands);

    let mut system = System::new_all();
    system.refresh_all();
    let process_memory = sysinfo::get_current_pid().ok().and_then(|pid| system.process(pid)).map(|process| process.memory()).unwrap_or(0);
    let os = System::long_os_version().unwrap_or_else(|| "Unknown".to_string());
    let cores = system.physical_core_count().unwrap_or(0);
    let threads = system.cpus().len();

    let owner = data.config.owners.first().map(|id| UserId::new(*id).mention().to_string()).unwrap_or_else(|| "Unknown".to_string());
    let uptime = Utc::now() - data.started_at;

    let about = format!(
        "{} **Latency:** {}ms\n**Version:** {}\n**Owner:** {}",
        latency_indicator(latency),
        latency.as_millis(),
        env!("CARGO_PKG_VERSION"),
        owner
    );
    let system_info = format!("**OS:** {}\n**Cores:** {} ({} threads)\n**RAM:** {}", os, cores, threads, format_bytes(system.total_memory()));
    let stats = format!("**Servers:** {}\n**Channels:** {}\n**Users:** {}\n**Commands:** {}\n**Memory:** {}", guilds, channels, users, commands, format_bytes(process_memory));

    let embed = base_embed()
        .title("Pingu")
        .field("About", about, false)
        .field("System", system_info, true)
        .field("Stats", stats, true)
        .field("Uptime", format_uptime(uptime), false)
        .footer(requested_by_footer(ctx.author()));
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Get someone's avatar
#[poise::command(prefix_command, aliases("avatar", "pfp"), member_cooldown = 1, category = "Misc")]
pub async fn yoink(ctx: Context<'_>, #[description = "Member to yoink from"] member: Option<serenity::Member>) -> Result<(), Error> {
    let (name, avatar) = match member {
        Some(member) => (display_member(&member), member.face()),
        None => (ctx.author().name.clone(), ctx.author().face()),
    };
    let embed = base_embed().title(format!("{}'s avatar", name)).image(avatar.clone()).url(avatar);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Get the invite link for Pingu
#[poise::command(prefix_command, category = "Misc")]
pub async fn invite(ctx: Context<'_>) -> Result<(), Error> {
    let client_id = ctx.cache().current_user().id;
    ctx.say(format!("{} Invite me with <{}>", Icons::Info, invite_url(client_id))).await?;
    Ok(())
}
