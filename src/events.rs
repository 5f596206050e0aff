//! Events published by a live session for whoever renders it.

use crate::session::{SessionError, SessionState};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Caption text, as the server transcribes either side
    Transcript { speaker: Speaker, text: String },
    /// The model finished its answer
    TurnComplete,
    Notice(SessionNotice),
}

/// Something the user should be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    PermissionDenied(String),
    DeviceUnavailable(String),
    ConnectFailed(String),
    ConnectionLost(Option<String>),
}

impl From<&SessionError> for SessionNotice {
    fn from(e: &SessionError) -> Self {
        match e {
            SessionError::Permission(m) => Self::PermissionDenied(m.clone()),
            SessionError::Device(m) => Self::DeviceUnavailable(m.clone()),
            SessionError::Transport(m) => Self::ConnectFailed(m.clone()),
        }
    }
}

impl fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied(_) => {
                write!(f, "Microphone access was denied. Allow it and try again.")
            }
            Self::DeviceUnavailable(m) => write!(f, "No usable audio device ({m})."),
            Self::ConnectFailed(m) => write!(f, "Could not start the conversation: {m}"),
            Self::ConnectionLost(Some(reason)) => {
                write!(f, "Connection lost ({reason}), try again.")
            }
            Self::ConnectionLost(None) => write!(f, "Connection lost, try again."),
        }
    }
}
