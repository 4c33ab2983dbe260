use std::future::IntoFuture;
use std::time::Duration;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InlineKeyboardMarkup, InputFile, MessageId};
use teloxide::RequestError;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::llm::ImageRef;
use crate::llm::media::{download_image, image_file_name, truncate_for_log};

const CHAT_ACTION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);
const TELEGRAM_RETRY_ATTEMPTS: usize = 3;
const TELEGRAM_RETRY_BASE_DELAY: Duration = Duration::from_millis(1500);
const PHOTO_CAPTION_LIMIT: usize = 1000;

pub struct ChatActionHeartbeat {
    task_handle: Option<JoinHandle<()>>,
}

impl Drop for ChatActionHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Keeps "uploading photo..." visible while a long generation runs.
pub fn start_chat_action_heartbeat(
    bot: Bot,
    chat_id: ChatId,
    action: ChatAction,
) -> ChatActionHeartbeat {
    let task_handle = tokio::spawn(async move {
        loop {
            if let Err(err) = bot.send_chat_action(chat_id, action.clone()).await {
                warn!("send_chat_action failed: {err}");
            }
            tokio::time::sleep(CHAT_ACTION_HEARTBEAT_INTERVAL).await;
        }
    });

    ChatActionHeartbeat {
        task_handle: Some(task_handle),
    }
}

fn telegram_retryable_error(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

/// Telegram refuses edits that leave the message unchanged; those are harmless.
fn is_message_not_modified(err: &RequestError) -> bool {
    err.to_string().contains("message is not modified")
}

async fn with_telegram_retry<T, F, Fut>(operation: &str, mut request: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: IntoFuture<Output = Result<T, RequestError>>,
{
    let mut delay = TELEGRAM_RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match request().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !telegram_retryable_error(&err) || attempt >= TELEGRAM_RETRY_ATTEMPTS {
                    return Err(err);
                }
                warn!("{operation} attempt {attempt} failed: {err}");
                if let RequestError::RetryAfter(wait) = err {
                    tokio::time::sleep(wait.duration()).await;
                } else {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

pub async fn send_message_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Result<Message> {
    let message = with_telegram_retry("send_message", || {
        let mut request = bot.send_message(chat_id, text.to_string());
        if let Some(keyboard) = keyboard.clone() {
            request = request.reply_markup(keyboard);
        }
        request
    })
    .await?;
    Ok(message)
}

pub async fn edit_message_text_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Result<()> {
    let result = with_telegram_retry("edit_message_text", || {
        let mut request = bot.edit_message_text(chat_id, message_id, text.to_string());
        if let Some(keyboard) = keyboard.clone() {
            request = request.reply_markup(keyboard);
        }
        request
    })
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(err) if is_message_not_modified(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Uploads a generated image. URL references are fetched first so the
/// upload does not depend on Telegram reaching the generation host.
pub async fn send_photo_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    image: &ImageRef,
    caption: &str,
) -> Result<Message> {
    let bytes = match image {
        ImageRef::Bytes(bytes) => bytes.clone(),
        ImageRef::Url(url) => download_image(url).await?,
    };
    let file_name = image_file_name(&bytes);
    let caption = truncate_for_log(caption, PHOTO_CAPTION_LIMIT);

    let message = with_telegram_retry("send_photo", || {
        let input = InputFile::memory(bytes.clone()).file_name(file_name.clone());
        bot.send_photo(chat_id, input).caption(caption.clone())
    })
    .await?;
    Ok(message)
}
