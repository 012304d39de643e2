use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serenity::all::{
    ButtonStyle, ComponentInteraction, ComponentInteractionCollector, Context as SerenityContext, CreateActionRow, CreateAllowedMentions, CreateButton, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage, EditInteractionResponse, EditMessage, Interaction, Message, ReactionType,
};
use tokio::time::sleep;

use crate::discord::commands::Error;

pub const DELETE_BUTTON_ID: &str = "unfurl:delete";
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(7);

lazy_static! {
    static ref TIKTOK_REGEX: Regex = Regex::new(r"https?://(www\.)?tiktok\.com/(t/([a-zA-Z0-9]+)|@(.*?)/video/(\d+))(.*?)/?").unwrap();
    static ref TWITTER_REGEX: Regex = Regex::new(r"https?://(www\.)?(twitter|x)\.com/([a-zA-Z0-9_]+)/status/(\d+)").unwrap();
    static ref REDDIT_REGEX: Regex =
        Regex::new(r"https?://(www\.|old\.)?reddit\.com/(((r|u|user)/([a-zA-Z0-9_]+)(/s/|/comments/)?([a-zA-Z0-9_]+)(/[a-zA-Z0-9_]+)?(/[a-zA-Z0-9_]+)?)|([a-zA-Z0-9]+))/?").unwrap();
    static ref REDDIT_LISTING_REGEX: Regex = Regex::new(r"https?://(www\.|old\.)?reddit\.com/(r|u|user)/([a-zA-Z0-9_]+)/?$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unfurl {
    pub label: &'static str,
    pub url: String,
}

impl Unfurl {
    pub fn markdown(&self) -> String {
        format!("[[{}]]({})", self.label, self.url)
    }
}

/// Embed-friendly mirror for the first supported link in `content`.
pub fn unfurl(content: &str) -> Option<Unfurl> {
    if let Some(link) = TIKTOK_REGEX.find(content) {
        return Some(Unfurl { label: "View on Tiktok", url: link.as_str().replacen("tiktok.com/", "vxtiktok.com/", 1) });
    }

    if let Some(link) = TWITTER_REGEX.find(content) {
        let link = link.as_str();
        let url = if link.contains("://x.com/") || link.contains(".x.com/") { link.replacen("x.com/", "fxtwitter.com/", 1) } else { link.replacen("twitter.com/", "fxtwitter.com/", 1) };
        return Some(Unfurl { label: "View on Twitter/X", url });
    }

    if let Some(link) = REDDIT_REGEX.find(content) {
        // plain subreddit or profile links already embed fine
        if REDDIT_LISTING_REGEX.is_match(content) {
            return None;
        }
        let link = link.as_str();
        let url = if link.contains("old.reddit.com/") { link.replacen("old.reddit.com/", "vxreddit.com/", 1) } else { link.replacen("reddit.com/", "vxreddit.com/", 1) };
        return Some(Unfurl { label: "View on Reddit", url });
    }

    None
}

fn delete_button_row() -> CreateActionRow {
    CreateActionRow::Buttons(vec![CreateButton::new(DELETE_BUTTON_ID).style(ButtonStyle::Primary).emoji(ReactionType::Unicode("🗑️".to_string()))])
}

fn confirm_ids(message: &Message) -> (String, String) {
    (format!("unfurl:yes:{}", message.id), format!("unfurl:no:{}", message.id))
}

pub async fn on_message(ctx: &SerenityContext, message: &Message) -> Result<(), Error> {
    if message.guild_id.is_none() || message.author.bot {
        return Ok(());
    }
    let Some(unfurl) = unfurl(&message.content) else {
        return Ok(());
    };

    sleep(Duration::from_secs(1)).await;
    let mut original = message.clone();
    if let Err(e) = original.edit(ctx, EditMessage::new().suppress_embeds(true)).await {
        tracing::warn!("Unable to suppress embeds on {}: {}", message.id, e);
    }

    let reply = CreateMessage::new().content(unfurl.markdown()).allowed_mentions(CreateAllowedMentions::new()).components(vec![delete_button_row()]);
    message.channel_id.send_message(ctx, reply).await?;
    Ok(())
}

pub async fn on_interaction(ctx: &SerenityContext, interaction: &Interaction) -> Result<(), Error> {
    let Interaction::Component(component) = interaction else {
        return Ok(());
    };
    if component.data.custom_id != DELETE_BUTTON_ID {
        return Ok(());
    }
    confirm_delete(ctx, component).await
}

async fn confirm_delete(ctx: &SerenityContext, component: &ComponentInteraction) -> Result<(), Error> {
    let (yes_id, no_id) = confirm_ids(&component.message);
    let buttons = CreateActionRow::Buttons(vec![CreateButton::new(&yes_id).label("Yes").style(ButtonStyle::Danger), CreateButton::new(&no_id).label("No").style(ButtonStyle::Secondary)]);
    let prompt = CreateInteractionResponseMessage::new().content("Delete this message?").ephemeral(true).components(vec![buttons]);
    component.create_response(ctx, CreateInteractionResponse::Message(prompt)).await?;

    let filter_yes = yes_id.clone();
    let answer = ComponentInteractionCollector::new(ctx)
        .author_id(component.user.id)
        .channel_id(component.channel_id)
        .timeout(CONFIRM_TIMEOUT)
        .filter(move |press| press.data.custom_id == filter_yes || press.data.custom_id == no_id)
        .next()
        .await;

    let Some(answer) = answer else {
        component.edit_response(ctx, EditInteractionResponse::new().content("Confirmation timed out.").components(vec![])).await?;
        return Ok(());
    };

    let outcome = if answer.data.custom_id == yes_id {
        match component.message.delete(ctx).await {
            Ok(()) => "Message successfully deleted.",
            Err(e) => {
                tracing::info!("Unfurl {} could not be deleted: {}", component.message.id, e);
                "Message no longer exists."
            }
        }
    } else {
        "Message was not deleted."
    };

    answer.create_response(ctx, CreateInteractionResponse::UpdateMessage(CreateInteractionResponseMessage::new().content(outcome).components(vec![]))).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiktok_links_use_vxtiktok() {
        let unfurl = unfurl("lol https://www.tiktok.com/@someone/video/7301234567890 look").unwrap();
        assert_eq!(unfurl.label, "View on Tiktok");
        assert_eq!(unfurl.url, "https://www.vxtiktok.com/@someone/video/7301234567890");

        let short = super::unfurl("https://tiktok.com/t/ZT8abc123/").unwrap();
        assert!(short.url.starts_with("https://vxtiktok.com/t/ZT8abc123"));
    }

    #[test]
    fn twitter_and_x_links_use_fxtwitter() {
        assert_eq!(unfurl("https://x.com/jack/status/20").unwrap().url, "https://fxtwitter.com/jack/status/20");
        assert_eq!(unfurl("see https://twitter.com/jack/status/20?s=1").unwrap().url, "https://fxtwitter.com/jack/status/20");
        assert_eq!(unfurl("https://x.com/jack/status/20").unwrap().markdown(), "[[View on Twitter/X]](https://fxtwitter.com/jack/status/20)");
    }

    #[test]
    fn reddit_posts_use_vxreddit() {
        let post = unfurl("https://old.reddit.com/r/rust/comments/abc123/cool_post").unwrap();
        assert_eq!(post.url, "https://vxreddit.com/r/rust/comments/abc123/cool_post");

        let share = unfurl("https://www.reddit.com/r/rust/s/Xy12Ab").unwrap();
        assert_eq!(share.url, "https://www.vxreddit.com/r/rust/s/Xy12Ab");
    }

    #[test]
    fn subreddit_listings_are_left_alone() {
        assert_eq!(unfurl("https://www.reddit.com/r/rust/"), None);
        assert_eq!(unfurl("https://reddit.com/user/spez"), None);
    }

    #[test]
    fn unrelated_messages_are_ignored() {
        assert_eq!(unfurl("honk honk https://example.com/x.com/status/1"), None);
        assert_eq!(unfurl("no links here"), None);
    }
}
