use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyPoolError {
    #[error("No active API keys available")]
    OutOfKeys,

    #[error("No active billing-enabled API keys available")]
    OutOfBillingKeys,

    #[error("Failed to read key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
