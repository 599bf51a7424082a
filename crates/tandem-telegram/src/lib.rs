//! Telegram adapter: event handling, admission control, generation
//! orchestration and the command surface.

pub mod adapter;
pub mod admission;
pub mod commands;
pub mod context;
pub mod files;
pub mod handler;
pub mod orchestrate;
pub mod send;
pub mod typing;

pub use adapter::TelegramAdapter;
pub use context::AppContext;
