//! Error types for the sequencer core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A MIDI client, port, endpoint or sound engine could not be created.
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    #[error("failed to load sequence: {0}")]
    Load(String),

    #[error("failed to write sequence file: {0}")]
    FileWrite(String),

    /// The operation does not apply to the current state.
    #[error("invalid state: {0}")]
    StateViolation(&'static str),

    /// A message could not be delivered to a destination.
    #[error("MIDI send failed: {0}")]
    Send(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<midly::Error> for Error {
    fn from(e: midly::Error) -> Self {
        Error::Load(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<midir::InitError> for Error {
    fn from(e: midir::InitError) -> Self {
        Error::ResourceCreation(e.to_string())
    }
}

impl From<midir::ConnectError<midir::MidiOutput>> for Error {
    fn from(e: midir::ConnectError<midir::MidiOutput>) -> Self {
        Error::ResourceCreation(e.to_string())
    }
}

impl From<midir::ConnectError<midir::MidiInput>> for Error {
    fn from(e: midir::ConnectError<midir::MidiInput>) -> Self {
        Error::ResourceCreation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
