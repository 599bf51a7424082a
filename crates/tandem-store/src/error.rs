use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Message not found: chat {chat_id}, message {message_id}")]
    MessageNotFound { chat_id: i64, message_id: i64 },
}
