use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpqueError {
    #[error("no tokio runtime available to host worker pool {0}")]
    NoRuntime(String),
}
