use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info};

mod config;
mod handlers;
mod llm;
mod state;
mod utils;
mod villa;

use config::init_config;
use handlers::{commands, villa as villa_handlers};
use llm::{HttpImageGenerator, ImageGenerator, PromptEnhancer};
use state::AppState;
use utils::logging::init_logging;
use villa::catalog::{Catalog, CALLBACK_PREFIX};
use villa::flow::VillaFlow;
use villa::machine::Conversation;
use villa::session::SessionStore;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    Info,
    Villa,
    Cancel,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let config = init_config()?;
    let _guards = init_logging(&config.log_level);

    let catalog = match Catalog::from_path(Path::new(&config.villa_catalog_path)) {
        Ok(catalog) => Arc::new(catalog),
        Err(err) => {
            error!(
                "Failed to load villa catalog {}: {}",
                config.villa_catalog_path, err
            );
            return Err(err.into());
        }
    };

    let conversation = Conversation::new(SessionStore::new(), catalog)
        .with_idle_timeout(config.session_idle_timeout());
    let flow = VillaFlow::new(
        conversation,
        config.generation_params(),
        config.generation_timeout(),
    );
    let generator: Arc<dyn ImageGenerator> = Arc::new(HttpImageGenerator::from_config(config));
    let enhancer = PromptEnhancer::from_config(config);
    if enhancer.is_none() {
        info!("PERPLEXITY_API_KEY not set, prompts are sent as composed");
    }

    let state = AppState::new(config, flow, generator, enhancer);
    let _sweeper = state.spawn_session_sweeper(config.session_sweep_interval());

    let bot = Bot::new(config.bot_token.clone());
    info!(
        "Starting Dream Villa Bot, generation service at {}",
        config.generation_api_url
    );

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(
            dptree::filter(|msg: Message| msg.new_chat_members().is_some())
                .endpoint(handle_new_members),
        )
        .endpoint(ignore_message);

    let callback_handler = Update::filter_callback_query().endpoint(handle_callback_query);

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start => commands::start_handler(bot, state, message).await?,
        Command::Help => commands::help_handler(bot, state, message).await?,
        Command::Info => {
            tokio::spawn(async move {
                if let Err(err) = commands::info_handler(bot, state, message).await {
                    error!("info handler failed: {err}");
                }
            });
        }
        Command::Villa => {
            tokio::spawn(async move {
                if let Err(err) = villa_handlers::villa_handler(bot, state, message).await {
                    error!("villa handler failed: {err}");
                }
            });
        }
        Command::Cancel => villa_handlers::cancel_handler(bot, state, message).await?,
    }
    Ok(())
}

async fn handle_callback_query(bot: Bot, state: AppState, query: CallbackQuery) -> HandlerResult {
    let is_villa = query
        .data
        .as_deref()
        .map(|data| data.starts_with(CALLBACK_PREFIX))
        .unwrap_or(false);
    if !is_villa {
        bot.answer_callback_query(query.id.clone()).await?;
        return Ok(());
    }

    tokio::spawn(async move {
        if let Err(err) = villa_handlers::villa_callback(bot, state, query).await {
            error!("villa callback failed: {err}");
        }
    });
    Ok(())
}

async fn handle_new_members(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    commands::welcome_new_members(bot, state, message).await?;
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
