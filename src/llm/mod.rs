pub mod enhance;
pub mod generation;
pub mod media;

pub use enhance::{EnhancedPrompt, PromptEnhancer};
pub use generation::{GenerationParams, HttpImageGenerator, ImageGenerator, ImageRef};
