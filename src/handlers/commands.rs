use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ParseMode, ReplyParameters, User};

use crate::state::AppState;

const SERVICE_ONLINE: &str = "✅ API service available";
const SERVICE_OFFLINE: &str = "❌ API service offline";

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn mention_html(user: &User) -> String {
    format!(
        "<a href=\"tg://user?id={}\">{}</a>",
        user.id.0,
        escape_html(&user.full_name())
    )
}

/// One greeting per human member; bots joining the chat are skipped.
fn welcome_texts(members: &[User], welcome_message: &str) -> Vec<String> {
    members
        .iter()
        .filter(|member| !member.is_bot)
        .map(|member| {
            format!(
                "Welcome {}!\n\n{}",
                mention_html(member),
                escape_html(welcome_message)
            )
        })
        .collect()
}

pub async fn start_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    bot.send_message(message.chat.id, state.config.start_message.clone())
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub async fn help_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    bot.send_message(message.chat.id, state.config.help_message.clone())
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

/// Reports whether the image service answers its health endpoint.
pub async fn info_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let status = if state.generator.is_online().await {
        SERVICE_ONLINE
    } else {
        SERVICE_OFFLINE
    };
    bot.send_message(
        message.chat.id,
        format!("{}\n\n{}", state.config.info_message, status),
    )
    .reply_parameters(ReplyParameters::new(message.id))
    .await?;
    Ok(())
}

pub async fn welcome_new_members(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(members) = message.new_chat_members() else {
        return Ok(());
    };
    for text in welcome_texts(members, &state.config.welcome_message) {
        bot.send_message(message.chat.id, text)
            .parse_mode(ParseMode::Html)
            .await?;
    }
    Ok(())
}
