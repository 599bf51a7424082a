//! Request pipeline: prompt assembly, media resolution, backend dispatch
//! and response classification for the two generative backends.

pub mod backend;
pub mod google;
pub mod media;
pub mod openai;
pub mod outcome;
pub mod prompt;
pub mod tokens;

pub use backend::{Backend, GenConfig};
pub use google::GoogleDispatcher;
pub use media::{FileHandle, MediaError, MediaResolver, PlatformFiles};
pub use openai::OpenAiDispatcher;
pub use outcome::{Outcome, Usage};
pub use prompt::{MediaPart, Prompt, PromptOptions, Role, Turn};
