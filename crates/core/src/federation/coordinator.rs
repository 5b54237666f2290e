//! Sequencing of one federation's state.
//!
//! The coordinator owns the roster, the declarations and the three engines, and applies
//! one input at a time: a join, a request from a joined federate, a departure or a timer
//! tick. It never blocks and never touches the network. Everything it wants delivered is
//! queued as [`Outbound`] messages which the owning task drains after each input, so the
//! order in which inputs are applied is the order every federate observes.
//!
//! Within one input, the reply to the requester is queued ahead of any notices the input
//! caused.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tokio::time::Instant;

use super::{
    object_model::{DeclarationError, ObjectHandle, ObjectModel, ObjectModelStore, ObjectModelView},
    roster::{FederateHandle, FederateInfo, FederationRoster},
};
use crate::{
    config::RtiConfig,
    message::{
        AcquisitionFailure, CorrelationId, FederateRequest, Notice, Outbound, Recipients, Reply,
        RtiMessage,
    },
    operations::{
        ownership::{OwnershipError, OwnershipManager, Transfers},
        sync_point::{
            RegistrationRequest, SyncPointError, SyncPointManager, SyncPointStatus, SyncScope,
        },
        time::{TimeError, TimeManager},
        RtiError,
    },
};

/// Registration race for one label that has not been announced yet.
#[derive(Debug)]
struct PendingRegistration {
    deadline: Instant,
    /// Contenders still waiting for the outcome, with the request to answer.
    waiting: BTreeMap<FederateHandle, CorrelationId>,
}

pub struct FederationCoordinator {
    name: String,
    config: RtiConfig,
    roster: FederationRoster,
    declarations: ObjectModelStore,
    sync_points: SyncPointManager,
    time: TimeManager,
    ownership: OwnershipManager,
    registrations: BTreeMap<String, PendingRegistration>,
    next_object: u64,
    outbox: Vec<Outbound>,
    departed: Vec<FederateHandle>,
}

impl FederationCoordinator {
    pub fn new(name: impl Into<String>, model: Arc<ObjectModel>, config: RtiConfig) -> Self {
        Self {
            name: name.into(),
            config,
            roster: FederationRoster::new(),
            declarations: ObjectModelStore::new(model),
            sync_points: SyncPointManager::new(),
            time: TimeManager::new(),
            ownership: OwnershipManager::new(),
            registrations: BTreeMap::new(),
            next_object: 1,
            outbox: Vec::new(),
            departed: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roster(&self) -> &FederationRoster {
        &self.roster
    }

    pub fn sync_points(&self) -> &SyncPointManager {
        &self.sync_points
    }

    pub fn time(&self) -> &TimeManager {
        &self.time
    }

    pub fn ownership(&self) -> &OwnershipManager {
        &self.ownership
    }

    /// Messages queued since the last call.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Federates removed since the last call, whose connections can be dropped.
    pub fn take_departed(&mut self) -> Vec<FederateHandle> {
        std::mem::take(&mut self.departed)
    }

    /// Earliest moment [`Self::on_timer`] has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let settle = self.registrations.values().map(|p| p.deadline).min();
        settle.into_iter().chain(self.ownership.next_deadline()).min()
    }

    // ==================== Messaging helpers ====================

    fn push(&mut self, recipients: Recipients, message: RtiMessage) {
        self.outbox.push(Outbound {
            recipients,
            message,
        });
    }

    fn reply(
        &mut self,
        federate: FederateHandle,
        correlation: CorrelationId,
        outcome: Result<Reply, RtiError>,
    ) {
        self.push(
            Recipients::One(federate),
            RtiMessage::reply(correlation, outcome),
        );
    }

    fn notify(&mut self, federate: FederateHandle, notice: Notice) {
        self.push(Recipients::One(federate), notice.into());
    }

    fn broadcast(&mut self, notice: Notice) {
        let everyone = Recipients::Set(self.roster.handles());
        self.push(everyone, notice.into());
    }

    fn scope_recipients(&self, scope: &SyncScope) -> Recipients {
        match scope {
            SyncScope::FederationWide => Recipients::Set(self.roster.handles()),
            SyncScope::Restricted(members) => Recipients::Set(members.clone()),
        }
    }

    // ==================== Membership ====================

    /// Admits a federate. On success the `Joined` reply is queued for it.
    pub fn join(
        &mut self,
        correlation: CorrelationId,
        federate_name: &str,
        federate_type: &str,
    ) -> Result<FederateInfo, RtiError> {
        let info = self.roster.join(federate_name, federate_type)?;
        let handle = info.handle;
        self.time.joined_federation(handle);
        tracing::info!(
            federation = %self.name,
            federate = %handle,
            name = %info.name,
            "Federate joined"
        );

        let members = self.roster.members().cloned().collect();
        self.reply(handle, correlation, Ok(Reply::Joined { handle, members }));
        self.broadcast(Notice::FederateJoined {
            federate: info.clone(),
        });

        let outstanding: Vec<_> = self
            .sync_points
            .points()
            .filter(|p| {
                p.scope() == &SyncScope::FederationWide
                    && matches!(
                        p.status(),
                        SyncPointStatus::Announced | SyncPointStatus::Achieved
                    )
            })
            .map(|p| Notice::AnnounceSyncPoint {
                label: p.label().to_owned(),
                registrant: p.registrant(),
                tag: p.tag().to_vec(),
                scope: p.scope().clone(),
            })
            .collect();
        for notice in outstanding {
            self.notify(handle, notice);
        }
        Ok(info)
    }

    /// Removes a federate that went away without resigning.
    pub fn disconnect(&mut self, federate: FederateHandle) {
        if self.roster.contains(federate) {
            tracing::warn!(federation = %self.name, %federate, "Federate disconnected");
            self.remove_federate(federate);
        }
    }

    fn remove_federate(&mut self, federate: FederateHandle) {
        let Ok(info) = self.roster.leave(federate) else {
            return;
        };
        self.departed.push(federate);
        tracing::info!(
            federation = %self.name,
            %federate,
            name = %info.name,
            remaining = self.roster.len(),
            "Federate left"
        );

        let live = self.roster.handles();
        for pending in self.registrations.values_mut() {
            pending.waiting.remove(&federate);
        }
        let sync = self.sync_points.roster_leave(federate, &live);
        for label in &sync.abandoned {
            self.registrations.remove(label);
            tracing::debug!(%label, "Sync point registration abandoned");
        }
        for (label, registrant) in &sync.reassigned {
            tracing::debug!(%label, %registrant, "Sync point registrant reassigned");
        }

        self.time.resigned_federation(federate);

        let ownership = self.ownership.roster_leave(federate);
        for (object, transfers) in ownership.transferred {
            self.announce_transfers(object, transfers);
        }
        for request in ownership.withdrawn {
            self.notify(
                request.owner,
                Notice::DivestitureRequestWithdrawn {
                    correlation: request.correlation,
                    object: request.object,
                    attributes: request.attributes,
                },
            );
        }
        self.declarations.remove_federate(federate);

        self.broadcast(Notice::FederateResigned { federate });
        for label in sync.synchronized {
            self.check_synchronized(&label);
        }
        self.issue_possible_advances();
    }

    // ==================== Requests ====================

    pub fn handle_request(
        &mut self,
        from: FederateHandle,
        correlation: CorrelationId,
        request: FederateRequest,
        now: Instant,
    ) {
        if !self.roster.contains(from) {
            self.reply(from, correlation, Err(RtiError::FederateNotExecutionMember));
            return;
        }
        tracing::debug!(
            federation = %self.name,
            %from,
            %correlation,
            %request,
            "Handling request"
        );

        let mark = self.outbox.len();
        let outcome = match request {
            FederateRequest::RegisterSyncPoint { label, tag, scope } => {
                if let Err(err) = self.register_sync_point(from, correlation, label, tag, scope, now) {
                    self.outbox.truncate(mark);
                    self.reply(from, correlation, Err(err));
                }
                return;
            }
            FederateRequest::Resign => {
                self.remove_federate(from);
                Ok(Reply::Ack)
            }
            FederateRequest::Abandon { correlation } => {
                self.abandon(from, correlation);
                Ok(Reply::Ack)
            }
            FederateRequest::SyncPointAchieved { label } => self.achieve(from, label),
            FederateRequest::QueryOutstandingSyncPoints => Ok(Reply::OutstandingSyncPoints {
                labels: self.sync_points.outstanding_labels(),
            }),
            FederateRequest::PublishObjectClass { class, attributes } => self
                .declarations
                .publish(from, class, attributes)
                .map(|()| Reply::Ack)
                .map_err(Into::into),
            FederateRequest::SubscribeObjectClass { class } => self.subscribe(from, class),
            FederateRequest::RegisterObject { class } => self.register_object(from, class),
            request @ (FederateRequest::EnableTimeRegulation { .. }
            | FederateRequest::DisableTimeRegulation
            | FederateRequest::EnableTimeConstrained
            | FederateRequest::DisableTimeConstrained
            | FederateRequest::TimeSwitchDelivered { .. }
            | FederateRequest::ModifyLookahead { .. }
            | FederateRequest::SetAsynchronousDelivery { .. }
            | FederateRequest::TimeAdvanceRequest { .. }
            | FederateRequest::TimeAdvanceGrantDelivered
            | FederateRequest::QueryLbts
            | FederateRequest::QueryFederateTime) => self.handle_time_request(from, request),
            request @ (FederateRequest::AttributeAcquire { .. }
            | FederateRequest::ReleaseResponse { .. }
            | FederateRequest::UnconditionalDivest { .. }
            | FederateRequest::CancelAcquisition { .. }
            | FederateRequest::QueryOwnership { .. }) => {
                self.handle_ownership_request(from, request, now)
            }
        };
        if let Err(err) = &outcome {
            tracing::debug!(federation = %self.name, %from, %err, "Request rejected");
            self.outbox.truncate(mark);
        }
        self.outbox.insert(
            mark,
            Outbound {
                recipients: Recipients::One(from),
                message: RtiMessage::reply(correlation, outcome),
            },
        );
    }

    // ==================== Synchronization points ====================

    fn register_sync_point(
        &mut self,
        from: FederateHandle,
        correlation: CorrelationId,
        label: String,
        tag: Vec<u8>,
        scope: SyncScope,
        now: Instant,
    ) -> Result<(), RtiError> {
        if label.trim().is_empty() {
            return Err(RtiError::InvalidSyncLabel);
        }
        if let SyncScope::Restricted(members) = &scope {
            let unknown: BTreeSet<_> = members
                .iter()
                .filter(|f| !self.roster.contains(**f))
                .copied()
                .collect();
            if !unknown.is_empty() {
                return Err(RtiError::InvalidSyncScope(unknown));
            }
        }

        match self.sync_points.get(&label).map(|p| p.status()) {
            None => {
                self.sync_points.register(&label, tag, scope, from)?;
                self.registrations.insert(
                    label.clone(),
                    PendingRegistration {
                        deadline: now + self.config.sync_grace_period,
                        waiting: BTreeMap::from([(from, correlation)]),
                    },
                );
            }
            Some(status) if status.is_unannounced() => {
                let pending = self
                    .registrations
                    .entry(label.clone())
                    .or_insert_with(|| PendingRegistration {
                        deadline: now + self.config.sync_grace_period,
                        waiting: BTreeMap::new(),
                    });
                if pending.waiting.contains_key(&from) {
                    return Err(SyncPointError::AlreadyRegistered(label).into());
                }
                self.sync_points.requested_registration(
                    &label,
                    from,
                    Some(RegistrationRequest { tag, scope }),
                )?;
                pending.waiting.insert(from, correlation);
            }
            Some(_) => return Err(SyncPointError::AlreadyRegistered(label).into()),
        }

        tracing::debug!(federation = %self.name, %label, federate = %from, "Sync point registration intent");
        self.broadcast(Notice::SyncRegistrationIntent {
            label,
            federate: from,
        });
        Ok(())
    }

    fn settle_registrations(&mut self, now: Instant) {
        let due: Vec<String> = self
            .registrations
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(label, _)| label.clone())
            .collect();
        for label in due {
            let Some(pending) = self.registrations.remove(&label) else {
                continue;
            };
            let point = match self.sync_points.announce(&label) {
                Ok(point) => point.clone(),
                Err(err) => {
                    tracing::warn!(%label, %err, "Unable to announce sync point");
                    for (federate, correlation) in pending.waiting {
                        self.reply(federate, correlation, Err(err.clone().into()));
                    }
                    continue;
                }
            };
            let registrant = point.registrant();
            for (federate, correlation) in pending.waiting {
                let outcome = if federate == registrant {
                    Ok(Reply::SyncPointRegistered {
                        label: label.clone(),
                    })
                } else {
                    Err(RtiError::SyncPointRaceLost {
                        label: label.clone(),
                        winner: registrant,
                    })
                };
                self.reply(federate, correlation, outcome);
            }

            tracing::info!(federation = %self.name, %label, %registrant, "Sync point announced");
            let recipients = self.scope_recipients(point.scope());
            self.push(
                recipients,
                Notice::AnnounceSyncPoint {
                    label: label.clone(),
                    registrant,
                    tag: point.tag().to_vec(),
                    scope: point.scope().clone(),
                }
                .into(),
            );
            self.check_synchronized(&label);
        }
    }

    fn achieve(&mut self, from: FederateHandle, label: String) -> Result<Reply, RtiError> {
        self.sync_points.achieve(&label, from)?;
        tracing::debug!(federation = %self.name, %label, federate = %from, "Sync point achieved");
        self.check_synchronized(&label);
        Ok(Reply::Ack)
    }

    fn check_synchronized(&mut self, label: &str) {
        match self.sync_points.is_synchronized(label, &self.roster.handles()) {
            Ok(true) => {
                let Some(point) = self.sync_points.retire(label) else {
                    return;
                };
                tracing::info!(
                    federation = %self.name,
                    %label,
                    registrant = %point.registrant(),
                    "Federation synchronized"
                );
                // everyone, so mirrors outside a restricted scope drop their pending entry
                self.broadcast(Notice::FederationSynchronized {
                    label: label.to_owned(),
                });
            }
            Ok(false) => {}
            Err(err) => tracing::debug!(%label, %err, "Synchronization check skipped"),
        }
    }

    fn abandon(&mut self, from: FederateHandle, correlation: CorrelationId) {
        let found = self.registrations.iter().find_map(|(label, pending)| {
            (pending.waiting.get(&from) == Some(&correlation)).then(|| label.clone())
        });
        let Some(label) = found else {
            return;
        };
        if let Some(pending) = self.registrations.get_mut(&label) {
            pending.waiting.remove(&from);
        }
        match self.sync_points.withdraw(&label, from) {
            Ok(Some(registrant)) => {
                tracing::debug!(%label, %registrant, "Registration withdrawn, registrant re-elected");
            }
            Ok(None) => {
                tracing::debug!(%label, "Registration withdrawn, label released");
                self.registrations.remove(&label);
            }
            Err(err) => tracing::debug!(%label, %err, "Registration withdrawal ignored"),
        }
    }

    // ==================== Time management ====================

    fn handle_time_request(
        &mut self,
        from: FederateHandle,
        request: FederateRequest,
    ) -> Result<Reply, RtiError> {
        match request {
            FederateRequest::EnableTimeRegulation { lookahead } => {
                let time = self.time.enable_regulation(from, lookahead)?;
                self.notify(from, Notice::TimeRegulationEnabled { time });
            }
            FederateRequest::EnableTimeConstrained => {
                let time = self.time.enable_constrained(from)?;
                self.notify(from, Notice::TimeConstrainedEnabled { time });
            }
            FederateRequest::TimeSwitchDelivered { switch } => {
                self.time.enable_delivered(from, switch)?;
            }
            FederateRequest::DisableTimeRegulation => self.time.disable_regulation(from)?,
            FederateRequest::DisableTimeConstrained => self.time.disable_constrained(from)?,
            FederateRequest::ModifyLookahead { lookahead } => {
                self.time.modify_lookahead(from, lookahead)?
            }
            FederateRequest::SetAsynchronousDelivery { enabled } => {
                self.time.set_asynchronous_delivery(from, enabled)?
            }
            FederateRequest::TimeAdvanceRequest { time, kind } => {
                self.time.request_advance(from, time, kind)?;
                tracing::debug!(federate = %from, %time, ?kind, "Time advance requested");
            }
            FederateRequest::TimeAdvanceGrantDelivered => self.time.grant_delivered(from)?,
            FederateRequest::QueryLbts => {
                return Ok(Reply::Lbts {
                    bound: self.time.lower_bound_for(from),
                })
            }
            FederateRequest::QueryFederateTime => {
                let status = self
                    .time
                    .status(from)
                    .ok_or(TimeError::FederateNotKnown(from))?;
                return Ok(Reply::FederateTime {
                    time: status.current_time,
                });
            }
            other => return Err(RtiError::UnexpectedReply(other.to_string())),
        }
        self.issue_possible_advances();
        Ok(Reply::Ack)
    }

    /// Grants every outstanding advance the current lower bounds allow.
    fn issue_possible_advances(&mut self) {
        for federate in self.time.grantable() {
            match self.time.grant_advance(federate) {
                Ok(time) => {
                    tracing::debug!(federation = %self.name, %federate, %time, "Time advance granted");
                    self.notify(federate, Notice::TimeAdvanceGrant { time });
                }
                Err(err) => tracing::warn!(%federate, %err, "Unable to grant time advance"),
            }
        }
    }

    // ==================== Declarations, objects and ownership ====================

    fn subscribe(
        &mut self,
        from: FederateHandle,
        class: super::object_model::ObjectClassHandle,
    ) -> Result<Reply, RtiError> {
        self.declarations.subscribe(from, class)?;
        let mut undiscovered: Vec<_> = self
            .ownership
            .objects()
            .filter(|o| o.class() == class && !o.is_known_by(from))
            .map(|o| o.handle())
            .collect();
        undiscovered.sort();
        for object in undiscovered {
            self.ownership.discover(object, from)?;
            self.notify(from, Notice::DiscoverObject { object, class });
        }
        Ok(Reply::Ack)
    }

    fn register_object(
        &mut self,
        from: FederateHandle,
        class: super::object_model::ObjectClassHandle,
    ) -> Result<Reply, RtiError> {
        if !self.declarations.is_class_published(from, class) {
            return Err(OwnershipError::ObjectClassNotPublished(class).into());
        }
        let attributes = self
            .declarations
            .model()
            .class(class)
            .ok_or(DeclarationError::ClassNotDefined(class))?
            .attributes
            .clone();
        let published = self.declarations.published_attributes(from, class);
        let object = ObjectHandle::new(self.next_object);
        self.next_object += 1;
        self.ownership
            .register_object(object, class, attributes, Some((from, &published)))?;
        tracing::debug!(federation = %self.name, %object, %class, federate = %from, "Object registered");

        for subscriber in self.declarations.subscribers(class) {
            if subscriber != from && self.ownership.discover(object, subscriber)? {
                self.notify(subscriber, Notice::DiscoverObject { object, class });
            }
        }
        Ok(Reply::ObjectRegistered { object })
    }

    fn handle_ownership_request(
        &mut self,
        from: FederateHandle,
        request: FederateRequest,
        now: Instant,
    ) -> Result<Reply, RtiError> {
        match request {
            FederateRequest::AttributeAcquire {
                object,
                attributes,
                if_available,
            } => {
                let deadline = now + self.config.divestiture_timeout;
                let outcome = self.ownership.acquire(
                    from,
                    object,
                    &attributes,
                    if_available,
                    &self.declarations,
                    deadline,
                )?;
                tracing::debug!(
                    federate = %from,
                    %object,
                    acquired = outcome.acquired.len(),
                    unavailable = outcome.unavailable.len(),
                    lost = outcome.lost.len(),
                    divestitures = outcome.divestiture_requests.len(),
                    "Attribute acquisition"
                );
                if !outcome.acquired.is_empty() {
                    self.notify(
                        from,
                        Notice::OwnershipAcquired {
                            object,
                            attributes: outcome.acquired,
                        },
                    );
                }
                if !outcome.unavailable.is_empty() {
                    self.notify(
                        from,
                        Notice::AttributesUnavailable {
                            object,
                            attributes: outcome.unavailable,
                        },
                    );
                }
                for request in outcome.divestiture_requests {
                    self.notify(
                        request.owner,
                        Notice::RequestDivestiture {
                            correlation: request.correlation,
                            object,
                            attributes: request.attributes,
                        },
                    );
                }
                for (winner, attributes) in outcome.lost {
                    self.notify(
                        from,
                        Notice::AcquisitionFailed {
                            object,
                            attributes,
                            reason: AcquisitionFailure::RaceLost { winner },
                        },
                    );
                }
                for (loser, attributes) in outcome.displaced {
                    self.notify(
                        loser,
                        Notice::AcquisitionFailed {
                            object,
                            attributes,
                            reason: AcquisitionFailure::RaceLost { winner: from },
                        },
                    );
                }
            }
            FederateRequest::ReleaseResponse {
                correlation,
                object,
                attributes,
            } => {
                let transfers =
                    self.ownership
                        .release_response(from, object, &attributes, correlation)?;
                self.announce_transfers(object, transfers);
            }
            FederateRequest::UnconditionalDivest { object, attributes } => {
                let transfers = self
                    .ownership
                    .unconditional_divest(from, object, &attributes)?;
                self.announce_transfers(object, transfers);
            }
            FederateRequest::CancelAcquisition { object, attributes } => {
                for request in self
                    .ownership
                    .cancel_acquisition(from, object, &attributes)?
                {
                    self.notify(
                        request.owner,
                        Notice::DivestitureRequestWithdrawn {
                            correlation: request.correlation,
                            object,
                            attributes: request.attributes,
                        },
                    );
                }
            }
            FederateRequest::QueryOwnership { object, attribute } => {
                let owner = self.ownership.query_owner(object, attribute)?;
                return Ok(Reply::Ownership {
                    object,
                    attribute,
                    owner,
                });
            }
            other => return Err(RtiError::UnexpectedReply(other.to_string())),
        }
        Ok(Reply::Ack)
    }

    fn announce_transfers(&mut self, object: ObjectHandle, transfers: Transfers) {
        for (new_owner, attributes) in transfers {
            tracing::debug!(%object, %new_owner, ?attributes, "Ownership transferred");
            self.notify(new_owner, Notice::OwnershipAcquired { object, attributes });
        }
    }

    // ==================== Timers ====================

    /// Settles due registration races and fails overdue divestitures.
    pub fn on_timer(&mut self, now: Instant) {
        self.settle_registrations(now);
        for expired in self.ownership.expire_acquisitions(now) {
            let request = expired.request;
            tracing::info!(
                object = %request.object,
                requester = %expired.requester,
                owner = %request.owner,
                "Divestiture request timed out"
            );
            self.notify(
                expired.requester,
                Notice::AcquisitionFailed {
                    object: request.object,
                    attributes: request.attributes.clone(),
                    reason: AcquisitionFailure::Timeout,
                },
            );
            self.notify(
                request.owner,
                Notice::DivestitureRequestWithdrawn {
                    correlation: request.correlation,
                    object: request.object,
                    attributes: request.attributes,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        federation::object_model::{AttributeHandle, ObjectClassHandle},
        operations::{
            ownership::Owner,
            time::{AdvanceKind, LogicalTime, TimeSwitch},
            ErrorKind,
        },
    };

    const VEHICLE: ObjectClassHandle = ObjectClassHandle::new(1);

    fn attrs(raw: &[u32]) -> BTreeSet<AttributeHandle> {
        raw.iter().copied().map(AttributeHandle::new).collect()
    }

    struct Harness {
        coordinator: FederationCoordinator,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let model = Arc::new(ObjectModel::new().with_class(VEHICLE, "Vehicle", attrs(&[1, 2, 3])));
            Self {
                coordinator: FederationCoordinator::new("test", model, RtiConfig::default()),
                now: Instant::now(),
            }
        }

        fn join(&mut self, count: usize) -> Vec<FederateHandle> {
            let handles = (0..count)
                .map(|i| {
                    self.coordinator
                        .join(CorrelationId::new(), &format!("fed-{i}"), "sim")
                        .unwrap()
                        .handle
                })
                .collect();
            self.coordinator.drain_outbox();
            handles
        }

        fn request(&mut self, from: FederateHandle, request: FederateRequest) -> Vec<Outbound> {
            self.coordinator
                .handle_request(from, CorrelationId::new(), request, self.now);
            self.coordinator.drain_outbox()
        }

        fn request_ok(&mut self, from: FederateHandle, request: FederateRequest) -> Vec<Outbound> {
            let out = self.request(from, request);
            match &out[0].message {
                RtiMessage::Reply {
                    outcome: Ok(_), ..
                } => {}
                other => panic!("unexpected first message {other:?}"),
            }
            out
        }

        fn advance(&mut self, by: Duration) -> Vec<Outbound> {
            self.now += by;
            self.coordinator.on_timer(self.now);
            self.coordinator.drain_outbox()
        }
    }

    fn notices_for(out: &[Outbound], federate: FederateHandle) -> Vec<Notice> {
        out.iter()
            .filter(|o| match &o.recipients {
                Recipients::One(f) => *f == federate,
                Recipients::Set(set) => set.contains(&federate),
                Recipients::All => true,
            })
            .filter_map(|o| match &o.message {
                RtiMessage::Notice(n) => Some(n.clone()),
                RtiMessage::Reply { .. } => None,
            })
            .collect()
    }

    fn replies_for(out: &[Outbound], federate: FederateHandle) -> Vec<Result<Reply, RtiError>> {
        out.iter()
            .filter(|o| o.recipients == Recipients::One(federate))
            .filter_map(|o| match &o.message {
                RtiMessage::Reply { outcome, .. } => Some(outcome.clone()),
                RtiMessage::Notice(_) => None,
            })
            .collect()
    }

    fn register(label: &str, scope: SyncScope) -> FederateRequest {
        FederateRequest::RegisterSyncPoint {
            label: label.into(),
            tag: label.as_bytes().to_vec(),
            scope,
        }
    }

    #[test]
    fn concurrent_registrations_resolve_to_lowest_handle() {
        let mut h = Harness::new();
        let feds = h.join(5);
        let (f3, f5) = (feds[2], feds[4]);
        let scope = SyncScope::from_handles([f3, f5]);

        let out = h.request(f5, register("ready", scope.clone()));
        assert!(replies_for(&out, f5).is_empty());
        assert_eq!(
            notices_for(&out, f3),
            vec![Notice::SyncRegistrationIntent {
                label: "ready".into(),
                federate: f5
            }]
        );
        h.request(f3, register("ready", scope.clone()));

        let out = h.advance(Duration::from_millis(300));
        assert_eq!(
            replies_for(&out, f3),
            vec![Ok(Reply::SyncPointRegistered {
                label: "ready".into()
            })]
        );
        let lost = replies_for(&out, f5);
        assert_eq!(lost.len(), 1);
        let err = lost[0].clone().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RaceLost);
        assert_eq!(
            err,
            RtiError::SyncPointRaceLost {
                label: "ready".into(),
                winner: f3
            }
        );
        for federate in [f3, f5] {
            assert!(notices_for(&out, federate).contains(&Notice::AnnounceSyncPoint {
                label: "ready".into(),
                registrant: f3,
                tag: b"ready".to_vec(),
                scope: scope.clone(),
            }));
        }
        assert!(notices_for(&out, feds[0]).is_empty());
    }

    #[test]
    fn registration_after_announcement_fails() {
        let mut h = Harness::new();
        let feds = h.join(2);
        h.request(feds[0], register("p", SyncScope::FederationWide));
        h.advance(Duration::from_millis(300));
        let out = h.request(feds[1], register("p", SyncScope::FederationWide));
        assert_eq!(
            replies_for(&out, feds[1]),
            vec![Err(RtiError::from(SyncPointError::AlreadyRegistered(
                "p".into()
            )))]
        );
    }

    #[test]
    fn registration_validates_label_and_scope() {
        let mut h = Harness::new();
        let feds = h.join(1);
        let out = h.request(feds[0], register("  ", SyncScope::FederationWide));
        assert_eq!(replies_for(&out, feds[0]), vec![Err(RtiError::InvalidSyncLabel)]);

        let ghost = FederateHandle::new(42);
        let out = h.request(feds[0], register("p", SyncScope::from_handles([ghost])));
        assert_eq!(
            replies_for(&out, feds[0]),
            vec![Err(RtiError::InvalidSyncScope(BTreeSet::from([ghost])))]
        );
        assert!(h.coordinator.sync_points().get("p").is_none());
    }

    #[test]
    fn registrant_leaving_during_race_hands_over() {
        let mut h = Harness::new();
        let feds = h.join(3);
        let (f1, f3) = (feds[0], feds[2]);
        h.request(f1, register("syncX", SyncScope::FederationWide));
        h.request(f3, register("syncX", SyncScope::FederationWide));

        h.coordinator.disconnect(f1);
        h.coordinator.drain_outbox();

        let out = h.advance(Duration::from_millis(300));
        assert_eq!(
            replies_for(&out, f3),
            vec![Ok(Reply::SyncPointRegistered {
                label: "syncX".into()
            })]
        );
        assert_eq!(h.coordinator.sync_points().get("syncX").unwrap().registrant(), f3);
    }

    #[test]
    fn federation_synchronizes_once_everyone_achieved() {
        let mut h = Harness::new();
        let feds = h.join(3);
        h.request(feds[0], register("p", SyncScope::FederationWide));
        h.advance(Duration::from_millis(300));

        h.request_ok(feds[0], FederateRequest::SyncPointAchieved { label: "p".into() });
        h.request_ok(feds[1], FederateRequest::SyncPointAchieved { label: "p".into() });
        assert!(h.coordinator.sync_points().contains("p"));

        let out = h.request(feds[2], FederateRequest::Resign);
        assert_eq!(replies_for(&out, feds[2]), vec![Ok(Reply::Ack)]);
        for federate in [feds[0], feds[1]] {
            assert!(notices_for(&out, federate).contains(&Notice::FederationSynchronized {
                label: "p".into()
            }));
        }
        assert!(!h.coordinator.sync_points().contains("p"));
        assert_eq!(h.coordinator.take_departed(), vec![feds[2]]);
    }

    #[test]
    fn synchronization_reaches_federates_outside_the_scope() {
        let mut h = Harness::new();
        let feds = h.join(3);
        let scope = SyncScope::from_handles([feds[0], feds[1]]);
        h.request(feds[0], register("r", scope));
        let out = h.advance(Duration::from_millis(300));
        assert!(notices_for(&out, feds[2]).is_empty());

        h.request_ok(feds[0], FederateRequest::SyncPointAchieved { label: "r".into() });
        let out = h.request_ok(feds[1], FederateRequest::SyncPointAchieved { label: "r".into() });
        for federate in &feds {
            assert_eq!(
                notices_for(&out, *federate),
                vec![Notice::FederationSynchronized { label: "r".into() }]
            );
        }
    }

    #[test]
    fn scope_member_leaving_before_announcement_is_not_waited_on() {
        let mut h = Harness::new();
        let feds = h.join(3);
        let (f1, f2) = (feds[0], feds[1]);
        h.request(f1, register("r", SyncScope::from_handles([f1, f2])));

        h.coordinator.disconnect(f2);
        h.coordinator.drain_outbox();
        let out = h.advance(Duration::from_millis(300));
        let announced = SyncScope::from_handles([f1]);
        assert!(notices_for(&out, f1).contains(&Notice::AnnounceSyncPoint {
            label: "r".into(),
            registrant: f1,
            tag: b"r".to_vec(),
            scope: announced.clone(),
        }));
        assert_eq!(h.coordinator.sync_points().get("r").unwrap().scope(), &announced);

        let out = h.request_ok(f1, FederateRequest::SyncPointAchieved { label: "r".into() });
        assert!(notices_for(&out, f1).contains(&Notice::FederationSynchronized {
            label: "r".into()
        }));
        assert!(!h.coordinator.sync_points().contains("r"));
    }

    #[test]
    fn achieving_unannounced_point_is_rejected() {
        let mut h = Harness::new();
        let feds = h.join(1);
        let out = h.request(feds[0], FederateRequest::SyncPointAchieved { label: "x".into() });
        let err = replies_for(&out, feds[0])[0].clone().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn abandoned_registration_releases_label() {
        let mut h = Harness::new();
        let feds = h.join(1);
        let correlation = CorrelationId::new();
        h.coordinator.handle_request(
            feds[0],
            correlation,
            register("p", SyncScope::FederationWide),
            h.now,
        );
        h.coordinator.drain_outbox();
        h.request_ok(feds[0], FederateRequest::Abandon { correlation });
        assert!(!h.coordinator.sync_points().contains("p"));
        assert_eq!(h.coordinator.next_deadline(), None);
    }

    #[test]
    fn late_joiner_sees_outstanding_federation_wide_points() {
        let mut h = Harness::new();
        let feds = h.join(1);
        h.request(feds[0], register("p", SyncScope::FederationWide));
        h.advance(Duration::from_millis(300));

        h.coordinator
            .join(CorrelationId::new(), "late", "sim")
            .unwrap();
        let out = h.coordinator.drain_outbox();
        let late = FederateHandle::new(2);
        assert!(matches!(
            replies_for(&out, late)[0],
            Ok(Reply::Joined { handle, .. }) if handle == late
        ));
        assert!(notices_for(&out, late)
            .iter()
            .any(|n| matches!(n, Notice::AnnounceSyncPoint { label, .. } if label == "p")));
    }

    fn enable(h: &mut Harness, federate: FederateHandle, regulation: Option<f64>, constrained: bool) {
        if let Some(lookahead) = regulation {
            h.request_ok(
                federate,
                FederateRequest::EnableTimeRegulation {
                    lookahead: LogicalTime::new(lookahead),
                },
            );
            h.request_ok(
                federate,
                FederateRequest::TimeSwitchDelivered {
                    switch: TimeSwitch::Regulation,
                },
            );
        }
        if constrained {
            h.request_ok(federate, FederateRequest::EnableTimeConstrained);
            h.request_ok(
                federate,
                FederateRequest::TimeSwitchDelivered {
                    switch: TimeSwitch::Constrained,
                },
            );
        }
    }

    fn tar(time: f64) -> FederateRequest {
        FederateRequest::TimeAdvanceRequest {
            time: LogicalTime::new(time),
            kind: AdvanceKind::Standard,
        }
    }

    fn grant(time: f64) -> Notice {
        Notice::TimeAdvanceGrant {
            time: LogicalTime::new(time),
        }
    }

    #[test]
    fn constrained_advance_waits_for_regulator() {
        let mut h = Harness::new();
        let feds = h.join(2);
        let (f1, f2) = (feds[0], feds[1]);
        enable(&mut h, f1, Some(2.0), false);
        enable(&mut h, f2, None, true);

        let out = h.request_ok(f1, tar(10.0));
        assert_eq!(notices_for(&out, f1), vec![grant(10.0)]);
        h.request_ok(f1, FederateRequest::TimeAdvanceGrantDelivered);

        let out = h.request_ok(f2, tar(11.0));
        assert_eq!(notices_for(&out, f2), vec![grant(11.0)]);
        h.request_ok(f2, FederateRequest::TimeAdvanceGrantDelivered);

        let out = h.request_ok(f2, tar(13.0));
        assert!(notices_for(&out, f2).is_empty());

        let out = h.request_ok(f1, tar(12.0));
        assert_eq!(notices_for(&out, f1), vec![grant(12.0)]);
        assert_eq!(notices_for(&out, f2), vec![grant(13.0)]);
    }

    #[test]
    fn resignation_of_regulator_unblocks_constrained() {
        let mut h = Harness::new();
        let feds = h.join(2);
        enable(&mut h, feds[0], Some(1.0), false);
        enable(&mut h, feds[1], None, true);
        let out = h.request_ok(feds[1], tar(20.0));
        assert!(notices_for(&out, feds[1]).is_empty());

        h.coordinator.disconnect(feds[0]);
        let out = h.coordinator.drain_outbox();
        assert!(notices_for(&out, feds[1]).contains(&grant(20.0)));
    }

    #[test]
    fn lbts_query_excludes_self() {
        let mut h = Harness::new();
        let feds = h.join(2);
        enable(&mut h, feds[0], Some(1.0), false);
        let out = h.request(feds[0], FederateRequest::QueryLbts);
        assert_eq!(
            replies_for(&out, feds[0]),
            vec![Ok(Reply::Lbts {
                bound: LogicalTime::INFINITY
            })]
        );
        let out = h.request(feds[1], FederateRequest::QueryLbts);
        assert_eq!(
            replies_for(&out, feds[1]),
            vec![Ok(Reply::Lbts {
                bound: LogicalTime::new(1.0)
            })]
        );
    }

    /// Both federates publish every attribute; the first registers an object and owns it.
    fn owned_object(h: &mut Harness) -> (FederateHandle, FederateHandle, ObjectHandle) {
        let feds = h.join(2);
        for federate in &feds {
            h.request_ok(
                *federate,
                FederateRequest::PublishObjectClass {
                    class: VEHICLE,
                    attributes: attrs(&[1, 2, 3]),
                },
            );
        }
        h.request_ok(feds[1], FederateRequest::SubscribeObjectClass { class: VEHICLE });
        let out = h.request_ok(feds[0], FederateRequest::RegisterObject { class: VEHICLE });
        let Ok(Reply::ObjectRegistered { object }) = replies_for(&out, feds[0])[0].clone() else {
            panic!("object not registered");
        };
        assert_eq!(
            notices_for(&out, feds[1]),
            vec![Notice::DiscoverObject {
                object,
                class: VEHICLE
            }]
        );
        (feds[0], feds[1], object)
    }

    #[test]
    fn negotiated_acquisition_waits_for_release() {
        let mut h = Harness::new();
        let (f1, f2, object) = owned_object(&mut h);

        let out = h.request_ok(
            f2,
            FederateRequest::AttributeAcquire {
                object,
                attributes: attrs(&[1]),
                if_available: false,
            },
        );
        assert!(notices_for(&out, f2).is_empty());
        let asked = notices_for(&out, f1);
        let [Notice::RequestDivestiture {
            correlation,
            attributes,
            ..
        }] = asked.as_slice()
        else {
            panic!("owner was not asked to divest");
        };
        assert_eq!(attributes, &attrs(&[1]));

        let out = h.request_ok(
            f1,
            FederateRequest::ReleaseResponse {
                correlation: *correlation,
                object,
                attributes: attrs(&[1]),
            },
        );
        assert_eq!(
            notices_for(&out, f2),
            vec![Notice::OwnershipAcquired {
                object,
                attributes: attrs(&[1])
            }]
        );
        assert_eq!(
            h.coordinator
                .ownership()
                .query_owner(object, AttributeHandle::new(1)),
            Ok(Owner::Federate(f2))
        );
    }

    #[test]
    fn acquisition_if_available_reports_unavailable() {
        let mut h = Harness::new();
        let (f1, f2, object) = owned_object(&mut h);
        let out = h.request_ok(
            f2,
            FederateRequest::AttributeAcquire {
                object,
                attributes: attrs(&[1]),
                if_available: true,
            },
        );
        assert_eq!(
            notices_for(&out, f2),
            vec![Notice::AttributesUnavailable {
                object,
                attributes: attrs(&[1])
            }]
        );
        assert!(notices_for(&out, f1).is_empty());
    }

    #[test]
    fn contested_acquisition_reports_the_lost_race() {
        let mut h = Harness::new();
        let (f1, f2, object) = owned_object(&mut h);
        let f3 = h
            .coordinator
            .join(CorrelationId::new(), "third", "sim")
            .unwrap()
            .handle;
        h.request_ok(
            f3,
            FederateRequest::PublishObjectClass {
                class: VEHICLE,
                attributes: attrs(&[1, 2, 3]),
            },
        );
        h.request_ok(f3, FederateRequest::SubscribeObjectClass { class: VEHICLE });
        h.coordinator.drain_outbox();

        let acquire = || FederateRequest::AttributeAcquire {
            object,
            attributes: attrs(&[1]),
            if_available: false,
        };
        let out = h.request_ok(f3, acquire());
        assert_eq!(notices_for(&out, f1).len(), 1);

        // the lower handle takes over the pending acquisition
        let out = h.request_ok(f2, acquire());
        assert_eq!(
            notices_for(&out, f3),
            vec![Notice::AcquisitionFailed {
                object,
                attributes: attrs(&[1]),
                reason: AcquisitionFailure::RaceLost { winner: f2 }
            }]
        );
        assert!(notices_for(&out, f1).is_empty());

        let out = h.request_ok(f3, acquire());
        assert_eq!(
            notices_for(&out, f3),
            vec![Notice::AcquisitionFailed {
                object,
                attributes: attrs(&[1]),
                reason: AcquisitionFailure::RaceLost { winner: f2 }
            }]
        );
    }

    #[test]
    fn rejected_acquisition_sends_only_the_error() {
        let mut h = Harness::new();
        let (f1, _f2, object) = owned_object(&mut h);
        let out = h.request(
            f1,
            FederateRequest::AttributeAcquire {
                object,
                attributes: attrs(&[1]),
                if_available: false,
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(
            replies_for(&out, f1),
            vec![Err(RtiError::from(OwnershipError::FederateOwnsAttributes(
                attrs(&[1])
            )))]
        );
    }

    #[test]
    fn unanswered_divestiture_times_out() {
        let mut h = Harness::new();
        let (f1, f2, object) = owned_object(&mut h);
        h.request_ok(
            f2,
            FederateRequest::AttributeAcquire {
                object,
                attributes: attrs(&[2]),
                if_available: false,
            },
        );
        assert!(h.advance(Duration::from_secs(9)).is_empty());
        let out = h.advance(Duration::from_secs(1));
        assert_eq!(
            notices_for(&out, f2),
            vec![Notice::AcquisitionFailed {
                object,
                attributes: attrs(&[2]),
                reason: AcquisitionFailure::Timeout
            }]
        );
        assert!(matches!(
            notices_for(&out, f1).as_slice(),
            [Notice::DivestitureRequestWithdrawn { .. }]
        ));
        assert_eq!(
            h.coordinator
                .ownership()
                .query_owner(object, AttributeHandle::new(2)),
            Ok(Owner::Federate(f1))
        );
    }

    #[test]
    fn departing_owner_transfers_to_pending_acquirer() {
        let mut h = Harness::new();
        let (f1, f2, object) = owned_object(&mut h);
        h.request_ok(
            f2,
            FederateRequest::AttributeAcquire {
                object,
                attributes: attrs(&[3]),
                if_available: false,
            },
        );
        h.coordinator.disconnect(f1);
        let out = h.coordinator.drain_outbox();
        assert!(notices_for(&out, f2).contains(&Notice::OwnershipAcquired {
            object,
            attributes: attrs(&[3])
        }));
        assert!(notices_for(&out, f2).contains(&Notice::FederateResigned { federate: f1 }));
        assert_eq!(
            h.coordinator
                .ownership()
                .query_owner(object, AttributeHandle::new(1)),
            Ok(Owner::Unowned)
        );
    }

    #[test]
    fn requests_from_strangers_are_refused() {
        let mut h = Harness::new();
        let stranger = FederateHandle::new(9);
        let out = h.request(stranger, FederateRequest::QueryLbts);
        assert_eq!(
            replies_for(&out, stranger),
            vec![Err(RtiError::FederateNotExecutionMember)]
        );
    }
}
