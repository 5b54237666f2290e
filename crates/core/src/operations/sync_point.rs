//! Synchronization point bookkeeping.
//!
//! A sync point goes through `Requested | Pending -> Announced -> Achieved -> Synchronized`
//! and never moves backwards. While a point is still `Requested` or `Pending` several
//! federates may race to register the same label; every contender is remembered and the
//! lowest handle is the registrant. Once announced the registrant, tag and scope are frozen.
//!
//! The same manager serves two roles:
//! - authoritative state inside the federation coordinator, and
//! - the local mirror a federate keeps from the notices it receives. Mirrors fed the same
//!   intents in any order agree on the registrant.
//!
//! The manager never sends anything. It reports outcomes and the coordinator turns them
//! into notices.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::federation::roster::FederateHandle;

/// Who has to achieve a sync point before the federation is synchronized on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncScope {
    /// Every federate joined at evaluation time.
    FederationWide,
    Restricted(BTreeSet<FederateHandle>),
}

impl SyncScope {
    /// An empty set means the whole federation.
    pub fn from_handles(handles: impl IntoIterator<Item = FederateHandle>) -> Self {
        let handles: BTreeSet<_> = handles.into_iter().collect();
        if handles.is_empty() {
            Self::FederationWide
        } else {
            Self::Restricted(handles)
        }
    }

    pub fn includes(&self, federate: FederateHandle) -> bool {
        match self {
            Self::FederationWide => true,
            Self::Restricted(members) => members.contains(&federate),
        }
    }

    /// Federates currently expected to achieve, given the live roster.
    pub fn effective(&self, live: &BTreeSet<FederateHandle>) -> BTreeSet<FederateHandle> {
        match self {
            Self::FederationWide => live.clone(),
            Self::Restricted(members) => members.clone(),
        }
    }

    /// Drops a departed federate from a restricted scope.
    fn prune(&mut self, federate: FederateHandle) {
        if let Self::Restricted(members) = self {
            members.remove(&federate);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SyncPointStatus {
    /// Registration requested by the local federate.
    Requested,
    /// Registration by another federate observed, not yet announced.
    Pending,
    Announced,
    /// The local federate has achieved the point.
    Achieved,
    Synchronized,
}

impl SyncPointStatus {
    pub fn is_unannounced(&self) -> bool {
        matches!(self, Self::Requested | Self::Pending)
    }
}

/// Tag and scope proposed by one contender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub tag: Vec<u8>,
    pub scope: SyncScope,
}

#[derive(Debug, Clone)]
pub struct SyncPoint {
    label: String,
    tag: Vec<u8>,
    scope: SyncScope,
    registrant: FederateHandle,
    achieved: BTreeSet<FederateHandle>,
    status: SyncPointStatus,
    /// Contenders seen before announcement. A contender learned only through an intent
    /// notice has no request data.
    contenders: BTreeMap<FederateHandle, Option<RegistrationRequest>>,
}

impl SyncPoint {
    fn new(
        label: String,
        registrant: FederateHandle,
        request: Option<RegistrationRequest>,
        status: SyncPointStatus,
    ) -> Self {
        let (tag, scope) = request
            .clone()
            .map(|r| (r.tag, r.scope))
            .unwrap_or((Vec::new(), SyncScope::FederationWide));
        Self {
            label,
            tag,
            scope,
            registrant,
            achieved: BTreeSet::new(),
            status,
            contenders: BTreeMap::from([(registrant, request)]),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    pub fn scope(&self) -> &SyncScope {
        &self.scope
    }

    pub fn registrant(&self) -> FederateHandle {
        self.registrant
    }

    pub fn status(&self) -> SyncPointStatus {
        self.status
    }

    pub fn achieved(&self) -> &BTreeSet<FederateHandle> {
        &self.achieved
    }

    pub fn contenders(&self) -> impl Iterator<Item = FederateHandle> + '_ {
        self.contenders.keys().copied()
    }

    /// Moves forward only; a request to go back is ignored.
    fn set_status(&mut self, status: SyncPointStatus) {
        if status > self.status {
            self.status = status;
        }
    }

    /// Re-derives the registrant from the remaining contenders.
    ///
    /// Returns `false` when no contender is left.
    fn elect_registrant(&mut self) -> bool {
        let Some((&lowest, request)) = self.contenders.iter().next() else {
            return false;
        };
        self.registrant = lowest;
        if let Some(request) = request {
            self.tag = request.tag.clone();
            self.scope = request.scope.clone();
        }
        true
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPointError {
    #[error("sync point `{0}` is already registered")]
    AlreadyRegistered(String),
    #[error("sync point `{0}` is not known")]
    LabelNotKnown(String),
    #[error("sync point `{0}` has not been announced")]
    NotAnnounced(String),
    #[error("sync point `{0}` was already announced")]
    AlreadyAnnounced(String),
    #[error("federate {federate} is not in the scope of sync point `{label}`")]
    FederateNotInScope {
        label: String,
        federate: FederateHandle,
    },
}

/// What a federate's departure did to the sync points.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncLeaveOutcome {
    /// Unannounced points whose registrant changed, with the new registrant.
    pub reassigned: Vec<(String, FederateHandle)>,
    /// Unannounced points left without any contender. Their labels are free again.
    pub abandoned: Vec<String>,
    /// Announced points that became synchronized because the federate left.
    pub synchronized: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncPointManager {
    points: BTreeMap<String, SyncPoint>,
}

impl SyncPointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> Option<&SyncPoint> {
        self.points.get(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.points.contains_key(label)
    }

    pub fn points(&self) -> impl Iterator<Item = &SyncPoint> {
        self.points.values()
    }

    /// Announced points that have not synchronized yet.
    pub fn outstanding_labels(&self) -> Vec<String> {
        self.points
            .values()
            .filter(|p| {
                matches!(
                    p.status,
                    SyncPointStatus::Announced | SyncPointStatus::Achieved
                )
            })
            .map(|p| p.label.clone())
            .collect()
    }

    /// Records a registration attempt by `requesting` for an unknown label.
    pub fn register(
        &mut self,
        label: &str,
        tag: Vec<u8>,
        scope: SyncScope,
        requesting: FederateHandle,
    ) -> Result<&SyncPoint, SyncPointError> {
        if self.points.contains_key(label) {
            return Err(SyncPointError::AlreadyRegistered(label.to_owned()));
        }
        let point = SyncPoint::new(
            label.to_owned(),
            requesting,
            Some(RegistrationRequest { tag, scope }),
            SyncPointStatus::Requested,
        );
        Ok(self.points.entry(label.to_owned()).or_insert(point))
    }

    /// Records that another federate is registering `label`.
    pub fn register_pending(
        &mut self,
        label: &str,
        registrant: FederateHandle,
    ) -> Result<&SyncPoint, SyncPointError> {
        if self.points.contains_key(label) {
            return Err(SyncPointError::AlreadyRegistered(label.to_owned()));
        }
        let point = SyncPoint::new(label.to_owned(), registrant, None, SyncPointStatus::Pending);
        Ok(self.points.entry(label.to_owned()).or_insert(point))
    }

    /// Adds `federate` as a contender for a point that has not been announced.
    ///
    /// Returns whether the registrant changed. After announcement this is a no-op.
    pub fn requested_registration(
        &mut self,
        label: &str,
        federate: FederateHandle,
        request: Option<RegistrationRequest>,
    ) -> Result<bool, SyncPointError> {
        let point = self
            .points
            .get_mut(label)
            .ok_or_else(|| SyncPointError::LabelNotKnown(label.to_owned()))?;
        if !point.status.is_unannounced() {
            return Ok(false);
        }
        match point.contenders.get_mut(&federate) {
            Some(existing) => {
                if existing.is_none() {
                    *existing = request;
                }
            }
            None => {
                point.contenders.insert(federate, request);
            }
        }
        let previous = point.registrant;
        point.elect_registrant();
        Ok(previous != point.registrant)
    }

    /// Freezes the registrant, tag and scope and marks the point announced.
    pub fn announce(&mut self, label: &str) -> Result<&SyncPoint, SyncPointError> {
        let point = self
            .points
            .get_mut(label)
            .ok_or_else(|| SyncPointError::LabelNotKnown(label.to_owned()))?;
        if !point.status.is_unannounced() {
            return Err(SyncPointError::AlreadyAnnounced(label.to_owned()));
        }
        point.elect_registrant();
        point.contenders.clear();
        point.set_status(SyncPointStatus::Announced);
        Ok(point)
    }

    /// Mirror side of [`Self::announce`]: applies an announcement decided elsewhere.
    ///
    /// Duplicate announcements are ignored.
    pub fn record_announcement(
        &mut self,
        label: &str,
        registrant: FederateHandle,
        tag: Vec<u8>,
        scope: SyncScope,
    ) -> &SyncPoint {
        let point = self.points.entry(label.to_owned()).or_insert_with(|| {
            SyncPoint::new(label.to_owned(), registrant, None, SyncPointStatus::Pending)
        });
        if point.status.is_unannounced() {
            point.registrant = registrant;
            point.tag = tag;
            point.scope = scope;
            point.contenders.clear();
            point.set_status(SyncPointStatus::Announced);
        }
        point
    }

    /// Records that `federate` reached the point. Repeating it is harmless.
    pub fn achieve(
        &mut self,
        label: &str,
        federate: FederateHandle,
    ) -> Result<&SyncPoint, SyncPointError> {
        let point = self
            .points
            .get_mut(label)
            .ok_or_else(|| SyncPointError::NotAnnounced(label.to_owned()))?;
        if !matches!(
            point.status,
            SyncPointStatus::Announced | SyncPointStatus::Achieved
        ) {
            return Err(SyncPointError::NotAnnounced(label.to_owned()));
        }
        if !point.scope.includes(federate) {
            return Err(SyncPointError::FederateNotInScope {
                label: label.to_owned(),
                federate,
            });
        }
        point.achieved.insert(federate);
        Ok(point)
    }

    /// Mirror side: the local federate achieved the point.
    pub fn mark_achieved(&mut self, label: &str, local: FederateHandle) -> Result<(), SyncPointError> {
        self.achieve(label, local)?;
        if let Some(point) = self.points.get_mut(label) {
            point.set_status(SyncPointStatus::Achieved);
        }
        Ok(())
    }

    /// Checks whether everyone in scope has achieved and, if so, marks the point
    /// synchronized.
    ///
    /// `live` is the roster snapshot used for federation-wide points.
    pub fn is_synchronized(
        &mut self,
        label: &str,
        live: &BTreeSet<FederateHandle>,
    ) -> Result<bool, SyncPointError> {
        let point = self
            .points
            .get_mut(label)
            .ok_or_else(|| SyncPointError::LabelNotKnown(label.to_owned()))?;
        match point.status {
            SyncPointStatus::Synchronized => return Ok(true),
            SyncPointStatus::Requested | SyncPointStatus::Pending => return Ok(false),
            SyncPointStatus::Announced | SyncPointStatus::Achieved => {}
        }
        let synchronized = point.scope.effective(live).is_subset(&point.achieved);
        if synchronized {
            point.set_status(SyncPointStatus::Synchronized);
        }
        Ok(synchronized)
    }

    /// Mirror side: the federation reported the point synchronized.
    pub fn mark_synchronized(&mut self, label: &str) -> Option<SyncPoint> {
        let point = self.points.get_mut(label)?;
        point.set_status(SyncPointStatus::Synchronized);
        self.retire(label)
    }

    /// Drops a synchronized point so its label can be registered again.
    pub fn retire(&mut self, label: &str) -> Option<SyncPoint> {
        if self.points.get(label)?.status != SyncPointStatus::Synchronized {
            return None;
        }
        self.points.remove(label)
    }

    /// Withdraws the registration attempt of `federate` for an unannounced point.
    ///
    /// Returns the new registrant, or `None` when the point was dropped because nobody
    /// is contending anymore.
    pub fn withdraw(
        &mut self,
        label: &str,
        federate: FederateHandle,
    ) -> Result<Option<FederateHandle>, SyncPointError> {
        let point = self
            .points
            .get_mut(label)
            .ok_or_else(|| SyncPointError::LabelNotKnown(label.to_owned()))?;
        if !point.status.is_unannounced() {
            return Err(SyncPointError::AlreadyAnnounced(label.to_owned()));
        }
        point.contenders.remove(&federate);
        if point.elect_registrant() {
            Ok(Some(point.registrant))
        } else {
            self.points.remove(label);
            Ok(None)
        }
    }

    /// Applies a federate's departure to every point and re-evaluates synchronization.
    pub fn roster_leave(
        &mut self,
        federate: FederateHandle,
        live: &BTreeSet<FederateHandle>,
    ) -> SyncLeaveOutcome {
        let mut outcome = SyncLeaveOutcome::default();
        let mut announced = Vec::new();
        self.points.retain(|label, point| {
            point.scope.prune(federate);
            if point.status.is_unannounced() {
                for request in point.contenders.values_mut().flatten() {
                    request.scope.prune(federate);
                }
                if point.contenders.remove(&federate).is_none() {
                    return true;
                }
                let previous = point.registrant;
                if !point.elect_registrant() {
                    outcome.abandoned.push(label.clone());
                    return false;
                }
                if previous == federate {
                    outcome.reassigned.push((label.clone(), point.registrant));
                }
                return true;
            }
            if point.status != SyncPointStatus::Synchronized {
                announced.push(label.clone());
            }
            true
        });
        for label in announced {
            if let Ok(true) = self.is_synchronized(&label, live) {
                outcome.synchronized.push(label);
            }
        }
        outcome
    }
}
