use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, MessageId};
use tracing::{error, info, warn};

use crate::llm::EnhancedPrompt;
use crate::state::AppState;
use crate::utils::telegram::{
    edit_message_text_with_retry, send_message_with_retry, send_photo_with_retry,
    start_chat_action_heartbeat,
};
use crate::villa::catalog::{callback_data, Step, VillaOption};
use crate::villa::error::VillaError;
use crate::villa::flow::{Completion, GenerationTicket, Notice, Reply};

const BUSY_TEXT: &str = "Your villa is still being generated, hang tight.";
const NOT_OWNER_TEXT: &str =
    "This questionnaire belongs to someone else. Send /villa to start your own.";
const EXPIRED_TEXT: &str = "This questionnaire has expired. Send /villa to start again.";
const NO_SESSION_TEXT: &str = "Nothing to cancel. Send /villa to design a villa.";
const CANCELLED_TEXT: &str = "Questionnaire cancelled. Send /villa whenever you want to start over.";

pub fn build_options_keyboard(step: Step, options: &[VillaOption]) -> InlineKeyboardMarkup {
    let rows = options
        .iter()
        .map(|option| {
            vec![InlineKeyboardButton::callback(
                option.label.clone(),
                callback_data(step, &option.value),
            )]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

fn notice_text(notice: Notice) -> &'static str {
    match notice {
        Notice::OutOfOrder => "That button belongs to another step. Please answer this one:",
        Notice::InvalidOption => "That option is not available. Please pick one of these:",
    }
}

pub fn step_text(step: Step, question: &str, notice: Option<Notice>) -> String {
    let heading = format!(
        "Step {}/{}: {}",
        step.position(),
        Step::ALL.len(),
        question
    );
    match notice {
        Some(notice) => format!("{}\n\n{}", notice_text(notice), heading),
        None => heading,
    }
}

fn failure_text(error: &VillaError) -> String {
    match error {
        VillaError::GenerationTimeout(limit) => format!(
            "The image service did not answer within {} seconds. Let's try again.",
            limit.as_secs()
        ),
        _ => "Sorry, I couldn't generate your villa this time. Let's try again.".to_string(),
    }
}

/// Answers the button press. Telegram may refuse late answers ("query is
/// too old"); that must not stop the flow the press already advanced.
async fn answer_callback(bot: &Bot, query: &CallbackQuery, text: Option<&str>, alert: bool) {
    let mut request = bot.answer_callback_query(query.id.clone());
    if let Some(text) = text {
        request = request.text(text).show_alert(alert);
    }
    if let Err(err) = request.await {
        warn!("answer_callback_query failed: {err}");
    }
}

fn user_id_of(user: &teloxide::types::User) -> i64 {
    i64::try_from(user.id.0).unwrap_or_default()
}

pub async fn villa_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user) = message.from.as_ref() else {
        return Ok(());
    };
    let reply = state.flow.begin(message.chat.id.0, user_id_of(user));
    if let Reply::Options {
        step,
        question,
        options,
        notice,
    } = reply
    {
        send_message_with_retry(
            &bot,
            message.chat.id,
            &step_text(step, &question, notice),
            Some(build_options_keyboard(step, &options)),
        )
        .await?;
    }
    Ok(())
}

pub async fn cancel_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let text = if state.flow.cancel(message.chat.id.0) {
        CANCELLED_TEXT
    } else {
        NO_SESSION_TEXT
    };
    send_message_with_retry(&bot, message.chat.id, text, None).await?;
    Ok(())
}

pub async fn villa_callback(bot: Bot, state: AppState, query: CallbackQuery) -> Result<()> {
    let Some(data) = query.data.as_deref() else {
        answer_callback(&bot, &query, None, false).await;
        return Ok(());
    };
    let Some(message) = query.message.as_ref() else {
        answer_callback(&bot, &query, None, false).await;
        return Ok(());
    };
    let chat_id = message.chat().id;
    let message_id = message.id();

    let Some(reply) = state
        .flow
        .handle_callback_data(chat_id.0, user_id_of(&query.from), data)
    else {
        answer_callback(&bot, &query, None, false).await;
        return Ok(());
    };

    match reply {
        Reply::Options {
            step,
            question,
            options,
            notice,
        } => {
            answer_callback(&bot, &query, None, false).await;
            edit_message_text_with_retry(
                &bot,
                chat_id,
                message_id,
                &step_text(step, &question, notice),
                Some(build_options_keyboard(step, &options)),
            )
            .await?;
        }
        Reply::Generate(ticket) => {
            answer_callback(&bot, &query, None, false).await;
            run_generation(&bot, &state, chat_id, message_id, ticket).await?;
        }
        Reply::Busy => answer_callback(&bot, &query, Some(BUSY_TEXT), false).await,
        Reply::NotOwner => answer_callback(&bot, &query, Some(NOT_OWNER_TEXT), true).await,
        Reply::Expired => {
            answer_callback(&bot, &query, None, false).await;
            edit_message_text_with_retry(&bot, chat_id, message_id, EXPIRED_TEXT, None).await?;
        }
    }
    Ok(())
}

async fn run_generation(
    bot: &Bot,
    state: &AppState,
    chat_id: ChatId,
    message_id: MessageId,
    ticket: GenerationTicket,
) -> Result<()> {
    let heartbeat = start_chat_action_heartbeat(bot.clone(), chat_id, ChatAction::UploadPhoto);

    let enhanced = match &state.enhancer {
        Some(enhancer) => enhancer.enhance(&ticket.prompt).await,
        None => EnhancedPrompt::unchanged(&ticket.prompt),
    };
    if !state.flow.is_current(&ticket) {
        info!(
            chat_id = chat_id.0,
            epoch = ticket.epoch,
            "Questionnaire restarted before generation began"
        );
        return Ok(());
    }
    let progress = format!("Generating {}...\n\n{}", enhanced.title, enhanced.prompt);
    if let Err(err) = edit_message_text_with_retry(bot, chat_id, message_id, &progress, None).await
    {
        warn!(chat_id = chat_id.0, "Failed to show generation progress: {err}");
    }

    let result = state
        .flow
        .generate(state.generator.as_ref(), &ticket, &enhanced.prompt)
        .await;
    let completion = state.flow.complete(&ticket, result);
    drop(heartbeat);

    match completion {
        Completion::Delivered(image) => {
            if let Err(err) = send_photo_with_retry(bot, chat_id, &image, &enhanced.title).await {
                error!(chat_id = chat_id.0, "Failed to deliver villa image: {err}");
                send_message_with_retry(
                    bot,
                    chat_id,
                    "Your villa was generated but I couldn't upload it. Send /villa to try again.",
                    None,
                )
                .await?;
                return Ok(());
            }
            info!(chat_id = chat_id.0, epoch = ticket.epoch, "Villa image delivered");
            edit_message_text_with_retry(
                bot,
                chat_id,
                message_id,
                &format!("Here's {}!", enhanced.title),
                None,
            )
            .await?;
        }
        Completion::Failed { error, retry } => {
            edit_message_text_with_retry(bot, chat_id, message_id, &failure_text(&error), None)
                .await?;
            if let Reply::Options {
                step,
                question,
                options,
                notice,
            } = retry
            {
                send_message_with_retry(
                    bot,
                    chat_id,
                    &step_text(step, &question, notice),
                    Some(build_options_keyboard(step, &options)),
                )
                .await?;
            }
        }
        Completion::Discarded => {
            info!(
                chat_id = chat_id.0,
                epoch = ticket.epoch,
                "Villa result dropped, questionnaire was restarted"
            );
        }
    }
    Ok(())
}
