//! Common error types

use crate::reactor::ReactorError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Transport(#[from] TransportError),

    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
