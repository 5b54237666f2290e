//! Messages exchanged between federates and the RTI.
//!
//! A federate talks to the RTI through [`ClientFrame`]s. Every frame carries a
//! [`CorrelationId`] and is answered by exactly one [`RtiMessage::Reply`] with the same id.
//! Everything the RTI tells a federate on its own initiative is a [`Notice`].

use std::{collections::BTreeSet, fmt::Display};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{
    federation::{
        object_model::{AttributeHandle, ObjectClassHandle, ObjectHandle},
        roster::{FederateHandle, FederateInfo},
    },
    operations::{
        ownership::Owner,
        sync_point::SyncScope,
        time::{AdvanceKind, LogicalTime, TimeSwitch},
        RtiError,
    },
};

/// Matches a reply to the request that caused it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct CorrelationId(Ulid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames a federate sends to the RTI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    CreateFederation {
        correlation: CorrelationId,
        name: String,
    },
    DestroyFederation {
        correlation: CorrelationId,
        name: String,
    },
    Join {
        correlation: CorrelationId,
        federation: String,
        federate_name: String,
        federate_type: String,
    },
    /// Anything a joined federate asks of its federation.
    Request {
        correlation: CorrelationId,
        request: FederateRequest,
    },
}

impl ClientFrame {
    pub fn correlation(&self) -> CorrelationId {
        match self {
            Self::CreateFederation { correlation, .. }
            | Self::DestroyFederation { correlation, .. }
            | Self::Join { correlation, .. }
            | Self::Request { correlation, .. } => *correlation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FederateRequest {
    Resign,

    // declarations and objects
    PublishObjectClass {
        class: ObjectClassHandle,
        attributes: BTreeSet<AttributeHandle>,
    },
    SubscribeObjectClass {
        class: ObjectClassHandle,
    },
    RegisterObject {
        class: ObjectClassHandle,
    },

    // synchronization points
    /// Answered only once the registration race for the label has settled.
    RegisterSyncPoint {
        label: String,
        tag: Vec<u8>,
        scope: SyncScope,
    },
    SyncPointAchieved {
        label: String,
    },
    QueryOutstandingSyncPoints,

    // time management
    EnableTimeRegulation {
        lookahead: LogicalTime,
    },
    DisableTimeRegulation,
    EnableTimeConstrained,
    DisableTimeConstrained,
    /// The federate has seen a `TimeRegulationEnabled` or `TimeConstrainedEnabled` notice.
    TimeSwitchDelivered {
        switch: TimeSwitch,
    },
    ModifyLookahead {
        lookahead: LogicalTime,
    },
    SetAsynchronousDelivery {
        enabled: bool,
    },
    TimeAdvanceRequest {
        time: LogicalTime,
        kind: AdvanceKind,
    },
    /// The federate has seen a `TimeAdvanceGrant` notice.
    TimeAdvanceGrantDelivered,
    QueryLbts,
    QueryFederateTime,

    // ownership
    AttributeAcquire {
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
        if_available: bool,
    },
    /// Answer to a `RequestDivestiture` notice.
    ReleaseResponse {
        correlation: CorrelationId,
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    },
    UnconditionalDivest {
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    },
    CancelAcquisition {
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    },
    QueryOwnership {
        object: ObjectHandle,
        attribute: AttributeHandle,
    },

    /// The federate stopped waiting for the reply to `correlation`.
    Abandon {
        correlation: CorrelationId,
    },
}

impl Display for FederateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Resign => "Resign",
            Self::PublishObjectClass { .. } => "PublishObjectClass",
            Self::SubscribeObjectClass { .. } => "SubscribeObjectClass",
            Self::RegisterObject { .. } => "RegisterObject",
            Self::RegisterSyncPoint { .. } => "RegisterSyncPoint",
            Self::SyncPointAchieved { .. } => "SyncPointAchieved",
            Self::QueryOutstandingSyncPoints => "QueryOutstandingSyncPoints",
            Self::EnableTimeRegulation { .. } => "EnableTimeRegulation",
            Self::DisableTimeRegulation => "DisableTimeRegulation",
            Self::EnableTimeConstrained => "EnableTimeConstrained",
            Self::DisableTimeConstrained => "DisableTimeConstrained",
            Self::TimeSwitchDelivered { .. } => "TimeSwitchDelivered",
            Self::ModifyLookahead { .. } => "ModifyLookahead",
            Self::SetAsynchronousDelivery { .. } => "SetAsynchronousDelivery",
            Self::TimeAdvanceRequest { .. } => "TimeAdvanceRequest",
            Self::TimeAdvanceGrantDelivered => "TimeAdvanceGrantDelivered",
            Self::QueryLbts => "QueryLbts",
            Self::QueryFederateTime => "QueryFederateTime",
            Self::AttributeAcquire { .. } => "AttributeAcquire",
            Self::ReleaseResponse { .. } => "ReleaseResponse",
            Self::UnconditionalDivest { .. } => "UnconditionalDivest",
            Self::CancelAcquisition { .. } => "CancelAcquisition",
            Self::QueryOwnership { .. } => "QueryOwnership",
            Self::Abandon { .. } => "Abandon",
        };
        f.write_str(name)
    }
}

/// Successful answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    Joined {
        handle: FederateHandle,
        members: Vec<FederateInfo>,
    },
    ObjectRegistered {
        object: ObjectHandle,
    },
    SyncPointRegistered {
        label: String,
    },
    OutstandingSyncPoints {
        labels: Vec<String>,
    },
    Lbts {
        bound: LogicalTime,
    },
    FederateTime {
        time: LogicalTime,
    },
    Ownership {
        object: ObjectHandle,
        attribute: AttributeHandle,
        owner: Owner,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionFailure {
    /// The owner did not answer the divestiture request in time.
    Timeout,
    /// A federate with a lower handle is acquiring the same attributes.
    RaceLost { winner: FederateHandle },
}

/// Callbacks the RTI delivers to federates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    FederateJoined {
        federate: FederateInfo,
    },
    FederateResigned {
        federate: FederateHandle,
    },

    SyncRegistrationIntent {
        label: String,
        federate: FederateHandle,
    },
    AnnounceSyncPoint {
        label: String,
        registrant: FederateHandle,
        tag: Vec<u8>,
        scope: SyncScope,
    },
    FederationSynchronized {
        label: String,
    },

    TimeRegulationEnabled {
        time: LogicalTime,
    },
    TimeConstrainedEnabled {
        time: LogicalTime,
    },
    TimeAdvanceGrant {
        time: LogicalTime,
    },

    DiscoverObject {
        object: ObjectHandle,
        class: ObjectClassHandle,
    },
    /// Asks the owner to release attributes; answered with a `ReleaseResponse`.
    RequestDivestiture {
        correlation: CorrelationId,
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    },
    DivestitureRequestWithdrawn {
        correlation: CorrelationId,
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    },
    OwnershipAcquired {
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    },
    AttributesUnavailable {
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    },
    AcquisitionFailed {
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
        reason: AcquisitionFailure,
    },
}

/// Frames the RTI sends to a federate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RtiMessage {
    Reply {
        correlation: CorrelationId,
        outcome: Result<Reply, RtiError>,
    },
    Notice(Notice),
}

impl RtiMessage {
    pub fn reply(correlation: CorrelationId, outcome: Result<Reply, RtiError>) -> Self {
        Self::Reply {
            correlation,
            outcome,
        }
    }
}

impl From<Notice> for RtiMessage {
    fn from(notice: Notice) -> Self {
        Self::Notice(notice)
    }
}

/// Who a coordinator output is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    One(FederateHandle),
    Set(BTreeSet<FederateHandle>),
    /// Everyone attached to the connection.
    All,
}

/// A message produced by the coordinator, waiting to be delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub recipients: Recipients,
    pub message: RtiMessage,
}
