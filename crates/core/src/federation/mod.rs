//! A running federation execution.
//!
//! Each federation is a [`FederationCoordinator`] owned by one tokio task. Sessions talk
//! to it through a [`FederationHandle`]; the task applies one event at a time, then
//! delivers everything the event produced before looking at the next one.

use std::{collections::BTreeSet, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::{
    config::RtiConfig,
    connection::{ChannelConnection, Connection, FederateSink},
    message::{CorrelationId, FederateRequest, Outbound, Recipients, RtiMessage},
    operations::RtiError,
};

pub mod coordinator;
pub mod object_model;
pub mod roster;

use self::{coordinator::FederationCoordinator, object_model::ObjectModel, roster::FederateHandle};

pub(crate) enum FederationEvent {
    Join {
        correlation: CorrelationId,
        federate_name: String,
        federate_type: String,
        sink: FederateSink,
        reply: oneshot::Sender<Result<FederateHandle, RtiError>>,
    },
    Request {
        from: FederateHandle,
        correlation: CorrelationId,
        request: FederateRequest,
    },
    Disconnected(FederateHandle),
    Destroy {
        reply: oneshot::Sender<Result<(), RtiError>>,
    },
}

#[derive(Clone, Debug)]
pub struct FederationHandle {
    name: Arc<str>,
    events: mpsc::Sender<FederationEvent>,
}

impl FederationHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn gone(&self) -> RtiError {
        RtiError::FederationExecutionDoesNotExist(self.name.to_string())
    }

    /// Joins a federate. Replies and notices for it are pushed into `sink`; the `Joined`
    /// reply is always the first thing it receives.
    pub(crate) async fn join(
        &self,
        correlation: CorrelationId,
        federate_name: String,
        federate_type: String,
        sink: FederateSink,
    ) -> Result<FederateHandle, RtiError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(FederationEvent::Join {
                correlation,
                federate_name,
                federate_type,
                sink,
                reply,
            })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Queues a request. The reply arrives on the federate's sink.
    pub(crate) async fn submit(
        &self,
        from: FederateHandle,
        correlation: CorrelationId,
        request: FederateRequest,
    ) -> Result<(), RtiError> {
        self.events
            .send(FederationEvent::Request {
                from,
                correlation,
                request,
            })
            .await
            .map_err(|_| self.gone())
    }

    pub(crate) async fn disconnected(&self, federate: FederateHandle) {
        if self
            .events
            .send(FederationEvent::Disconnected(federate))
            .await
            .is_err()
        {
            tracing::debug!(federation = %self.name, %federate, "Federation already gone");
        }
    }

    /// Stops the federation. Fails while federates are joined.
    pub(crate) async fn destroy(&self) -> Result<(), RtiError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(FederationEvent::Destroy { reply })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }
}

/// Starts the task running a new federation execution.
pub(crate) fn spawn_federation(
    name: &str,
    model: Arc<ObjectModel>,
    config: RtiConfig,
) -> FederationHandle {
    let (events, rx) = mpsc::channel(config.channel_capacity);
    let coordinator = FederationCoordinator::new(name, model, config);
    tokio::spawn(run_federation(coordinator, rx, ChannelConnection::new()));
    FederationHandle {
        name: name.into(),
        events,
    }
}

async fn run_federation(
    mut coordinator: FederationCoordinator,
    mut events: mpsc::Receiver<FederationEvent>,
    connection: ChannelConnection,
) {
    tracing::info!(federation = %coordinator.name(), "Federation execution started");
    loop {
        let deadline = coordinator.next_deadline();
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    FederationEvent::Join {
                        correlation,
                        federate_name,
                        federate_type,
                        sink,
                        reply,
                    } => match coordinator.join(correlation, &federate_name, &federate_type) {
                        Ok(info) => {
                            connection.attach(info.handle, sink);
                            let _ = reply.send(Ok(info.handle));
                        }
                        Err(err) => {
                            tracing::debug!(%federate_name, %err, "Join refused");
                            let _ = sink.try_send(RtiMessage::reply(correlation, Err(err.clone())));
                            let _ = reply.send(Err(err));
                        }
                    },
                    FederationEvent::Request {
                        from,
                        correlation,
                        request,
                    } => coordinator.handle_request(from, correlation, request, Instant::now()),
                    FederationEvent::Disconnected(federate) => coordinator.disconnect(federate),
                    FederationEvent::Destroy { reply } => {
                        if coordinator.roster().is_empty() {
                            let _ = reply.send(Ok(()));
                            break;
                        }
                        let _ = reply.send(Err(RtiError::FederatesCurrentlyJoined(
                            coordinator.name().to_owned(),
                        )));
                    }
                }
            }
            _ = sleep_until(deadline) => coordinator.on_timer(Instant::now()),
        }
        flush(&mut coordinator, &connection).await;
    }
    tracing::info!(federation = %coordinator.name(), "Federation execution ended");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Delivers the coordinator's output. Federates that cannot be reached are removed, which
/// may produce more output for the others.
async fn flush(coordinator: &mut FederationCoordinator, connection: &ChannelConnection) {
    loop {
        let mut unreachable = BTreeSet::new();
        for Outbound {
            recipients,
            message,
        } in coordinator.drain_outbox()
        {
            let delivered = match recipients {
                Recipients::One(federate) => connection.unicast(federate, message).await,
                targets => connection.multicast(&targets, message).await,
            };
            if let Err(err) = delivered {
                unreachable.extend(err.unreachable());
            }
        }
        for federate in coordinator.take_departed() {
            connection.detach(federate);
        }

        let lost: Vec<_> = unreachable
            .into_iter()
            .filter(|f| coordinator.roster().contains(*f))
            .collect();
        if lost.is_empty() {
            break;
        }
        for federate in lost {
            tracing::warn!(federation = %coordinator.name(), %federate, "Federate unreachable");
            coordinator.disconnect(federate);
        }
    }
}
