use std::{collections::BTreeSet, sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use super::FederateView;
use crate::{
    federation::{
        object_model::{AttributeHandle, ObjectClassHandle, ObjectHandle},
        roster::FederateHandle,
    },
    message::{ClientFrame, CorrelationId, FederateRequest, Notice, Reply, RtiMessage},
    operations::{
        ownership::Owner,
        sync_point::SyncScope,
        time::{AdvanceKind, LogicalTime, TimeSwitch},
        RtiError,
    },
};

type Waiters = DashMap<CorrelationId, oneshot::Sender<Result<Reply, RtiError>>>;

/// Connection of one federate to an RTI.
///
/// Every call waits at most the configured request timeout for its reply. A call that
/// times out is abandoned on the RTI side, so nothing it started stays reserved.
///
/// Notices are queued until the application asks for them with [`Self::next_notice`].
/// Taking a time notice from the queue is what confirms its delivery to the RTI.
pub struct RtiClient {
    outgoing: mpsc::Sender<ClientFrame>,
    waiters: Arc<Waiters>,
    notices: mpsc::UnboundedReceiver<Notice>,
    view: Arc<RwLock<FederateView>>,
    request_timeout: Duration,
}

impl RtiClient {
    pub(crate) fn new(
        outgoing: mpsc::Sender<ClientFrame>,
        incoming: mpsc::Receiver<RtiMessage>,
        request_timeout: Duration,
    ) -> Self {
        let waiters = Arc::new(Waiters::new());
        let view = Arc::new(RwLock::new(FederateView::default()));
        let (notice_tx, notices) = mpsc::unbounded_channel();
        tokio::spawn(demultiplex(
            incoming,
            waiters.clone(),
            view.clone(),
            notice_tx,
        ));
        Self {
            outgoing,
            waiters,
            notices,
            view,
            request_timeout,
        }
    }

    pub fn handle(&self) -> Option<FederateHandle> {
        self.view.read().handle()
    }

    /// Snapshot of what this federate knows about its federation.
    pub fn view(&self) -> FederateView {
        self.view.read().clone()
    }

    async fn exchange(&self, frame: ClientFrame) -> Result<Reply, RtiError> {
        let correlation = frame.correlation();
        let abandonable = matches!(frame, ClientFrame::Request { .. });
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(correlation, tx);
        if self.outgoing.send(frame).await.is_err() {
            self.waiters.remove(&correlation);
            return Err(RtiError::ConnectionLost);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RtiError::ConnectionLost),
            Err(_) => {
                self.waiters.remove(&correlation);
                tracing::warn!(%correlation, timeout = ?self.request_timeout, "Request timed out");
                if abandonable {
                    let abandon = ClientFrame::Request {
                        correlation: CorrelationId::new(),
                        request: FederateRequest::Abandon { correlation },
                    };
                    if self.outgoing.send(abandon).await.is_err() {
                        return Err(RtiError::ConnectionLost);
                    }
                }
                Err(RtiError::Timeout)
            }
        }
    }

    async fn request(&self, request: FederateRequest) -> Result<Reply, RtiError> {
        self.exchange(ClientFrame::Request {
            correlation: CorrelationId::new(),
            request,
        })
        .await
    }

    async fn expect_ack(&self, request: FederateRequest) -> Result<(), RtiError> {
        match self.request(request).await? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    // ==================== Federation management ====================

    pub async fn create_federation(&self, name: &str) -> Result<(), RtiError> {
        match self
            .exchange(ClientFrame::CreateFederation {
                correlation: CorrelationId::new(),
                name: name.to_owned(),
            })
            .await?
        {
            Reply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn destroy_federation(&self, name: &str) -> Result<(), RtiError> {
        match self
            .exchange(ClientFrame::DestroyFederation {
                correlation: CorrelationId::new(),
                name: name.to_owned(),
            })
            .await?
        {
            Reply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn join(
        &self,
        federation: &str,
        federate_name: &str,
        federate_type: &str,
    ) -> Result<FederateHandle, RtiError> {
        let reply = self
            .exchange(ClientFrame::Join {
                correlation: CorrelationId::new(),
                federation: federation.to_owned(),
                federate_name: federate_name.to_owned(),
                federate_type: federate_type.to_owned(),
            })
            .await?;
        match reply {
            Reply::Joined { handle, .. } => {
                tracing::debug!(%federation, federate = %handle, "Joined federation");
                Ok(handle)
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn resign(&self) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::Resign).await?;
        self.view.write().resigned();
        Ok(())
    }

    // ==================== Declarations and objects ====================

    /// Publishes `attributes` of `class`. An empty set unpublishes the class.
    pub async fn publish_object_class(
        &self,
        class: ObjectClassHandle,
        attributes: impl IntoIterator<Item = AttributeHandle>,
    ) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::PublishObjectClass {
            class,
            attributes: attributes.into_iter().collect(),
        })
        .await
    }

    pub async fn subscribe_object_class(&self, class: ObjectClassHandle) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::SubscribeObjectClass { class })
            .await
    }

    pub async fn register_object(&self, class: ObjectClassHandle) -> Result<ObjectHandle, RtiError> {
        match self.request(FederateRequest::RegisterObject { class }).await? {
            Reply::ObjectRegistered { object } => Ok(object),
            other => Err(unexpected(other)),
        }
    }

    // ==================== Synchronization points ====================

    /// Registers a synchronization point.
    ///
    /// Returns once the registration race for `label` is settled. Losing the race to a
    /// federate with a lower handle is reported as [`RtiError::SyncPointRaceLost`].
    pub async fn register_sync_point(
        &self,
        label: &str,
        tag: impl Into<Vec<u8>>,
        scope: SyncScope,
    ) -> Result<(), RtiError> {
        let request = FederateRequest::RegisterSyncPoint {
            label: label.to_owned(),
            tag: tag.into(),
            scope,
        };
        match self.request(request).await? {
            Reply::SyncPointRegistered { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sync_point_achieved(&self, label: &str) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::SyncPointAchieved {
            label: label.to_owned(),
        })
        .await?;
        self.view.write().achieved(label);
        Ok(())
    }

    pub async fn outstanding_sync_points(&self) -> Result<Vec<String>, RtiError> {
        match self
            .request(FederateRequest::QueryOutstandingSyncPoints)
            .await?
        {
            Reply::OutstandingSyncPoints { labels } => Ok(labels),
            other => Err(unexpected(other)),
        }
    }

    // ==================== Time management ====================

    /// Starts enabling regulation. It takes effect once the `TimeRegulationEnabled` notice
    /// is taken with [`Self::next_notice`].
    pub async fn enable_time_regulation(&self, lookahead: LogicalTime) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::EnableTimeRegulation { lookahead })
            .await
    }

    pub async fn disable_time_regulation(&self) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::DisableTimeRegulation)
            .await?;
        self.view.write().regulation_disabled();
        Ok(())
    }

    /// Starts enabling constrained mode. Completes like [`Self::enable_time_regulation`].
    pub async fn enable_time_constrained(&self) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::EnableTimeConstrained)
            .await
    }

    pub async fn disable_time_constrained(&self) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::DisableTimeConstrained)
            .await?;
        self.view.write().constrained_disabled();
        Ok(())
    }

    pub async fn modify_lookahead(&self, lookahead: LogicalTime) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::ModifyLookahead { lookahead })
            .await
    }

    pub async fn set_asynchronous_delivery(&self, enabled: bool) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::SetAsynchronousDelivery { enabled })
            .await
    }

    /// Asks to advance to `time`. The grant arrives as a `TimeAdvanceGrant` notice.
    pub async fn time_advance_request(&self, time: LogicalTime) -> Result<(), RtiError> {
        self.advance(time, AdvanceKind::Standard).await
    }

    /// Like [`Self::time_advance_request`], but may be granted at a bound equal to `time`.
    pub async fn time_advance_request_available(&self, time: LogicalTime) -> Result<(), RtiError> {
        self.advance(time, AdvanceKind::Available).await
    }

    async fn advance(&self, time: LogicalTime, kind: AdvanceKind) -> Result<(), RtiError> {
        let already_advancing = {
            let mut view = self.view.write();
            let advancing = view.time().advancing;
            view.advance_requested();
            advancing
        };
        let outcome = self
            .expect_ack(FederateRequest::TimeAdvanceRequest { time, kind })
            .await;
        if outcome.is_err() && !already_advancing {
            self.view.write().advance_withdrawn();
        }
        outcome
    }

    /// Lower bound on the time stamps this federate can still receive.
    pub async fn query_lbts(&self) -> Result<LogicalTime, RtiError> {
        match self.request(FederateRequest::QueryLbts).await? {
            Reply::Lbts { bound } => Ok(bound),
            other => Err(unexpected(other)),
        }
    }

    pub async fn query_federate_time(&self) -> Result<LogicalTime, RtiError> {
        match self.request(FederateRequest::QueryFederateTime).await? {
            Reply::FederateTime { time } => Ok(time),
            other => Err(unexpected(other)),
        }
    }

    // ==================== Ownership ====================

    pub async fn attribute_acquire(
        &self,
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
        if_available: bool,
    ) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::AttributeAcquire {
            object,
            attributes,
            if_available,
        })
        .await
    }

    /// Answers the `RequestDivestiture` notice identified by `correlation`.
    pub async fn release_response(
        &self,
        correlation: CorrelationId,
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    ) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::ReleaseResponse {
            correlation,
            object,
            attributes,
        })
        .await
    }

    pub async fn unconditional_divest(
        &self,
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    ) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::UnconditionalDivest { object, attributes })
            .await
    }

    pub async fn cancel_acquisition(
        &self,
        object: ObjectHandle,
        attributes: BTreeSet<AttributeHandle>,
    ) -> Result<(), RtiError> {
        self.expect_ack(FederateRequest::CancelAcquisition { object, attributes })
            .await
    }

    pub async fn query_ownership(
        &self,
        object: ObjectHandle,
        attribute: AttributeHandle,
    ) -> Result<Owner, RtiError> {
        match self
            .request(FederateRequest::QueryOwnership { object, attribute })
            .await?
        {
            Reply::Ownership { owner, .. } => Ok(owner),
            other => Err(unexpected(other)),
        }
    }

    // ==================== Notices ====================

    /// Next notice from the RTI, or `None` once the connection is gone.
    pub async fn next_notice(&mut self) -> Option<Notice> {
        let notice = self.notices.recv().await?;
        let confirmation = match &notice {
            Notice::TimeRegulationEnabled { .. } => Some(FederateRequest::TimeSwitchDelivered {
                switch: TimeSwitch::Regulation,
            }),
            Notice::TimeConstrainedEnabled { .. } => Some(FederateRequest::TimeSwitchDelivered {
                switch: TimeSwitch::Constrained,
            }),
            Notice::TimeAdvanceGrant { .. } => Some(FederateRequest::TimeAdvanceGrantDelivered),
            _ => None,
        };
        if let Some(request) = confirmation {
            if let Err(err) = self.expect_ack(request).await {
                tracing::warn!(%err, "Unable to confirm notice delivery");
            }
        }
        Some(notice)
    }

    /// Skips notices until one satisfies `predicate`.
    pub async fn next_notice_matching(
        &mut self,
        mut predicate: impl FnMut(&Notice) -> bool,
    ) -> Option<Notice> {
        loop {
            let notice = self.next_notice().await?;
            if predicate(&notice) {
                return Some(notice);
            }
            tracing::trace!(?notice, "Skipping notice");
        }
    }
}

fn unexpected(reply: Reply) -> RtiError {
    RtiError::UnexpectedReply(format!("{reply:?}"))
}

/// Routes replies to their waiting callers and queues notices for the application.
async fn demultiplex(
    mut incoming: mpsc::Receiver<RtiMessage>,
    waiters: Arc<Waiters>,
    view: Arc<RwLock<FederateView>>,
    notices: mpsc::UnboundedSender<Notice>,
) {
    while let Some(message) = incoming.recv().await {
        match message {
            RtiMessage::Reply {
                correlation,
                outcome,
            } => {
                if let Ok(reply) = &outcome {
                    view.write().apply_reply(reply);
                }
                match waiters.remove(&correlation) {
                    Some((_, waiter)) => {
                        if waiter.send(outcome).is_err() {
                            tracing::debug!(%correlation, "Caller stopped waiting for reply");
                        }
                    }
                    None => tracing::debug!(%correlation, "Reply to abandoned request"),
                }
            }
            RtiMessage::Notice(notice) => {
                view.write().apply_notice(&notice);
                if notices.send(notice).is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Connection to the RTI closed");
    waiters.clear();
}
