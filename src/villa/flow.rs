use std::str::FromStr;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::llm::generation::{GenerationError, GenerationParams, ImageGenerator, ImageRef};
use crate::villa::catalog::{parse_callback_data, Step, VillaOption};
use crate::villa::error::VillaError;
use crate::villa::machine::Conversation;
use crate::villa::session::{SessionKey, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// A button from an earlier step was pressed.
    OutOfOrder,
    InvalidOption,
}

/// What the dispatcher should show after an event.
#[derive(Debug, Clone)]
pub enum Reply {
    Options {
        step: Step,
        question: String,
        options: Vec<VillaOption>,
        notice: Option<Notice>,
    },
    Generate(GenerationTicket),
    /// The session already has a generation in flight.
    Busy,
    Expired,
    NotOwner,
}

#[derive(Debug, Clone)]
pub struct GenerationTicket {
    pub key: SessionKey,
    pub user_id: i64,
    pub epoch: u64,
    pub prompt: String,
    pub params: GenerationParams,
}

#[derive(Debug)]
pub enum Completion {
    Delivered(ImageRef),
    Failed { error: VillaError, retry: Reply },
    /// The session was restarted or cancelled while generating.
    Discarded,
}

pub struct VillaFlow {
    conversation: Conversation,
    params: GenerationParams,
    generation_timeout: Duration,
}

impl VillaFlow {
    pub fn new(
        conversation: Conversation,
        params: GenerationParams,
        generation_timeout: Duration,
    ) -> Self {
        VillaFlow {
            conversation,
            params,
            generation_timeout,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn begin(&self, key: SessionKey, user_id: i64) -> Reply {
        self.conversation.start(key, user_id);
        info!(chat_id = key, user_id, "Villa questionnaire started");
        self.options_reply(Step::Budget, None)
    }

    pub fn cancel(&self, key: SessionKey) -> bool {
        let cancelled = self.conversation.cancel(key);
        if cancelled {
            info!(chat_id = key, "Villa questionnaire cancelled");
        }
        cancelled
    }

    /// Parses `villa:<step>|<value>` callback data. `None` when the data is
    /// not a villa callback at all.
    pub fn handle_callback_data(&self, key: SessionKey, user_id: i64, data: &str) -> Option<Reply> {
        let (step_key, value) = parse_callback_data(data)?;
        match Step::from_str(step_key) {
            Ok(step) => Some(self.handle_callback(key, user_id, step, value)),
            Err(err) => {
                warn!(chat_id = key, "Ignoring villa callback '{}': {}", data, err);
                None
            }
        }
    }

    pub fn handle_callback(&self, key: SessionKey, user_id: i64, step: Step, value: &str) -> Reply {
        if let Some(session) = self.conversation.session(key) {
            if session.user_id != user_id {
                return Reply::NotOwner;
            }
        }
        if self.conversation.is_ready(key) {
            return Reply::Busy;
        }

        match self.conversation.select(key, step, value) {
            Ok(SessionState::Ready) => self.request_generation(key),
            Ok(state) => match state.awaiting() {
                Some(next) => self.options_reply(next, None),
                None => Reply::Busy,
            },
            Err(VillaError::OutOfOrder { expected, got }) => {
                info!(
                    chat_id = key,
                    expected = %expected,
                    got = %got,
                    "Ignoring out-of-order villa callback"
                );
                match expected.awaiting() {
                    Some(current) => self.options_reply(current, Some(Notice::OutOfOrder)),
                    None => Reply::Busy,
                }
            }
            Err(VillaError::InvalidOption { step, value }) => {
                warn!(chat_id = key, "Rejected unknown {} option '{}'", step, value);
                self.options_reply(step, Some(Notice::InvalidOption))
            }
            Err(VillaError::NoActiveSession) => Reply::Expired,
            Err(err) => {
                error!(chat_id = key, "Villa selection failed: {}", err);
                self.conversation.reset(key);
                self.options_reply(Step::Budget, None)
            }
        }
    }

    fn request_generation(&self, key: SessionKey) -> Reply {
        let Some(session) = self.conversation.session(key) else {
            return Reply::Expired;
        };

        match self.conversation.catalog().template().compose(&session) {
            Ok(prompt) => {
                info!(chat_id = key, epoch = session.epoch, "Villa prompt composed: {}", prompt);
                Reply::Generate(GenerationTicket {
                    key,
                    user_id: session.user_id,
                    epoch: session.epoch,
                    prompt,
                    params: self.params.clone(),
                })
            }
            Err(err) => {
                error!(chat_id = key, "Villa prompt composition failed: {}", err);
                self.conversation.reset(key);
                self.options_reply(Step::Budget, None)
            }
        }
    }

    /// Whether the ticket still belongs to the chat's live session.
    pub fn is_current(&self, ticket: &GenerationTicket) -> bool {
        self.conversation.is_current(ticket.key, ticket.epoch)
    }

    /// Calls the generator with a bounded wait.
    pub async fn generate(
        &self,
        generator: &dyn ImageGenerator,
        ticket: &GenerationTicket,
        prompt: &str,
    ) -> Result<ImageRef, VillaError> {
        match tokio::time::timeout(
            self.generation_timeout,
            generator.generate(prompt, &ticket.params),
        )
        .await
        {
            Ok(Ok(image)) => Ok(image),
            Ok(Err(GenerationError::TimedOut)) => {
                Err(VillaError::GenerationTimeout(self.generation_timeout))
            }
            Ok(Err(err)) => Err(VillaError::Generation(err)),
            Err(_) => Err(VillaError::GenerationTimeout(self.generation_timeout)),
        }
    }

    /// Applies a generation result to the session that requested it.
    pub fn complete(
        &self,
        ticket: &GenerationTicket,
        result: Result<ImageRef, VillaError>,
    ) -> Completion {
        match result {
            Ok(image) => {
                if self.conversation.finish(ticket.key, ticket.epoch) {
                    Completion::Delivered(image)
                } else {
                    info!(chat_id = ticket.key, epoch = ticket.epoch, "Discarding villa image for a superseded session");
                    Completion::Discarded
                }
            }
            Err(error) => {
                if self.conversation.reset_if_current(ticket.key, ticket.epoch) {
                    warn!(chat_id = ticket.key, "Villa generation failed: {}", error);
                    Completion::Failed {
                        error,
                        retry: self.options_reply(Step::Budget, None),
                    }
                } else {
                    info!(
                        chat_id = ticket.key,
                        epoch = ticket.epoch,
                        "Ignoring villa generation failure for a superseded session: {}",
                        error
                    );
                    Completion::Discarded
                }
            }
        }
    }

    fn options_reply(&self, step: Step, notice: Option<Notice>) -> Reply {
        let catalog = self.conversation.catalog();
        Reply::Options {
            step,
            question: catalog.question(step).to_string(),
            options: catalog.options_for(step).to_vec(),
            notice,
        }
    }
}
