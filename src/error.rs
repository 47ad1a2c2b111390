// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error types for the public API.

use crate::config::ConfigError;
use crate::server::ServerError;
use std::convert::Infallible;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SoundmanError {
    #[error("Failed to connect to the audio server: {0}")]
    Connection(String),
    #[error("Audio server connection is not ready")]
    NotReady,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{what} failed: {source}")]
    OperationFailed {
        what: &'static str,
        #[source]
        source: ServerError,
    },
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("Worker thread error: {0}")]
    Thread(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SoundmanError {
    pub(crate) fn failed(what: &'static str, source: ServerError) -> Self {
        Self::OperationFailed { what, source }
    }
}

impl From<Infallible> for SoundmanError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

pub type Result<T> = std::result::Result<T, SoundmanError>;
