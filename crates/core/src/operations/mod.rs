//! The three federation engines and the error type federates see.
//!
//! Each engine owns its own state and knows nothing about transport: it validates,
//! mutates and reports what happened. The coordinator sequences calls into the engines and
//! turns their outcomes into messages.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::federation::{object_model::DeclarationError, roster::FederateHandle, roster::RosterError};

pub mod ownership;
pub mod sync_point;
pub mod time;

use self::{ownership::OwnershipError, sync_point::SyncPointError, time::TimeError};

/// Coarse classification of an [`RtiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The request is not legal in the current state.
    ProtocolViolation,
    NotFound,
    /// Another federate won a registration race.
    RaceLost,
    /// The RTI or a peer could not be reached in time.
    PeerUnavailable,
    /// The request itself is malformed.
    Invalid,
}

/// Every error a federate can receive in reply to a request.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtiError {
    #[error(transparent)]
    SyncPoint(#[from] SyncPointError),
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error(transparent)]
    Declaration(#[from] DeclarationError),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("sync point `{label}` was registered by federate {winner}")]
    SyncPointRaceLost {
        label: String,
        winner: FederateHandle,
    },
    #[error("sync point label must not be blank")]
    InvalidSyncLabel,
    #[error("federates {0:?} in the sync scope are not joined")]
    InvalidSyncScope(BTreeSet<FederateHandle>),
    #[error("federation execution `{0}` already exists")]
    FederationExecutionAlreadyExists(String),
    #[error("federation execution `{0}` does not exist")]
    FederationExecutionDoesNotExist(String),
    #[error("federates are still joined to `{0}`")]
    FederatesCurrentlyJoined(String),
    #[error("already joined to a federation execution")]
    FederateAlreadyExecutionMember,
    #[error("not joined to a federation execution")]
    FederateNotExecutionMember,
    #[error("request timed out")]
    Timeout,
    #[error("connection to the RTI was lost")]
    ConnectionLost,
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl RtiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SyncPoint(err) => match err {
                SyncPointError::LabelNotKnown(_) => ErrorKind::NotFound,
                SyncPointError::AlreadyRegistered(_)
                | SyncPointError::NotAnnounced(_)
                | SyncPointError::AlreadyAnnounced(_)
                | SyncPointError::FederateNotInScope { .. } => ErrorKind::ProtocolViolation,
            },
            Self::Time(err) => match err {
                TimeError::FederateNotKnown(_) => ErrorKind::NotFound,
                TimeError::InvalidTime { .. } | TimeError::InvalidLookahead(_) => {
                    ErrorKind::Invalid
                }
                _ => ErrorKind::ProtocolViolation,
            },
            Self::Ownership(err) => match err {
                OwnershipError::ObjectNotKnown(_) => ErrorKind::NotFound,
                OwnershipError::AttributeNotDefined(_) => ErrorKind::Invalid,
                _ => ErrorKind::ProtocolViolation,
            },
            Self::Declaration(_) => ErrorKind::Invalid,
            Self::Roster(RosterError::NameInUse(_)) => ErrorKind::Invalid,
            Self::Roster(RosterError::NotJoined(_)) => ErrorKind::NotFound,
            Self::SyncPointRaceLost { .. } => ErrorKind::RaceLost,
            Self::InvalidSyncLabel
            | Self::InvalidSyncScope(_)
            | Self::FederationExecutionAlreadyExists(_) => ErrorKind::Invalid,
            Self::FederationExecutionDoesNotExist(_) => ErrorKind::NotFound,
            Self::FederatesCurrentlyJoined(_)
            | Self::FederateAlreadyExecutionMember
            | Self::FederateNotExecutionMember
            | Self::UnexpectedReply(_) => ErrorKind::ProtocolViolation,
            Self::Timeout | Self::ConnectionLost => ErrorKind::PeerUnavailable,
        }
    }
}
