use poise::Command;

use crate::discord::commands::{Context, Data, Error};
use crate::discord::error::PinguError;
use crate::discord::utils::{base_embed, requested_by_footer};

const CATEGORIES: [(&str, &str); 3] = [("Clown", "Stuff related to clown of the week"), ("Auto", "All things automated™"), ("Misc", "Commands not in a specific category")];

#[derive(Debug, Clone, PartialEq)]
pub struct HelpPage {
    pub title: String,
    pub description: Option<String>,
    pub fields: Vec<(String, String)>,
}

fn visible(commands: &[Command<Data, Error>]) -> impl Iterator<Item = &Command<Data, Error>> {
    commands.iter().filter(|command| !command.hide_in_help)
}

/// `%clown nominate <candidate>`
pub fn signature(command: &Command<Data, Error>, prefix: &str) -> String {
    let mut signature = format!("{}{}", prefix, command.qualified_name);
    for parameter in &command.parameters {
        if parameter.required {
            signature.push_str(&format!(" <{}>", parameter.name));
        } else {
            signature.push_str(&format!(" [{}]", parameter.name));
        }
    }
    signature
}

pub fn overview(commands: &[Command<Data, Error>], prefix: &str) -> HelpPage {
    let mut fields = Vec::new();
    for (category, description) in CATEGORIES {
        let names: Vec<String> = visible(commands).filter(|command| command.category.as_deref() == Some(category)).map(|command| format!("`{}`", command.name)).collect();
        if names.is_empty() {
            continue;
        }
        fields.push((category.to_string(), format!("*{}*\nCommands: {}", description, names.join(", "))));
    }
    HelpPage { title: "Pingu Commands".to_string(), description: Some(format!("Type `{}help <command>` for more info on a command.", prefix)), fields }
}

pub fn command_page(command: &Command<Data, Error>, prefix: &str) -> HelpPage {
    let description = match (command.description.as_deref(), command.help_text.as_deref()) {
        (Some(description), Some(help_text)) => Some(format!("{}\n\n{}", description, help_text)),
        (Some(description), None) => Some(description.to_string()),
        (None, help_text) => help_text.map(str::to_string),
    };

    let mut fields = vec![("Usage".to_string(), format!("`{}`", signature(command, prefix)))];
    if !command.aliases.is_empty() {
        let aliases: Vec<String> = command.aliases.iter().map(|alias| format!("`{}`", alias)).collect();
        fields.push(("Aliases".to_string(), aliases.join(", ")));
    }
    for subcommand in visible(&command.subcommands) {
        fields.push((signature(subcommand, prefix), subcommand.description.clone().unwrap_or_else(|| "...".to_string())));
    }

    HelpPage { title: command.qualified_name.to_string(), description, fields }
}

/// Resolves `clown nominate` style queries, matching names and aliases case-insensitively.
pub fn find_command<'a>(commands: &'a [Command<Data, Error>], query: &str) -> Option<&'a Command<Data, Error>> {
    let mut found: Option<&Command<Data, Error>> = None;
    for word in query.split_whitespace() {
        let candidates = match found {
            Some(parent) => &parent.subcommands,
            None => commands,
        };
        let next = candidates.iter().find(|command| command.name.eq_ignore_ascii_case(word) || command.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(word)))?;
        found = Some(next);
    }
    found.filter(|command| !command.hide_in_help)
}

/// Show this message
#[poise::command(prefix_command, category = "Help", hide_in_help)]
pub async fn help(ctx: Context<'_>, #[rest] #[description = "Command to explain"] command: Option<String>) -> Result<(), Error> {
    let commands = &ctx.framework().options().commands;
    let prefix = &ctx.data().config.prefix;

    let page = match command.as_deref().map(str::trim).filter(|query| !query.is_empty()) {
        Some(query) => {
            let command = find_command(commands, query).ok_or_else(|| PinguError::bad_argument(format!("No command called \"{}\" found.", query)))?;
            command_page(command, prefix)
        }
        None => overview(commands, prefix),
    };

    let mut embed = base_embed().title(page.title).footer(requested_by_footer(ctx.author()));
    if let Some(description) = page.description {
        embed = embed.description(description);
    }
    for (name, value) in page.fields {
        embed = embed.field(name, value, false);
    }
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}
