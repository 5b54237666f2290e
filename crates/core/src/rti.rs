//! The RTI process: a registry of federation executions and the sessions federates use to
//! reach them.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{
    config::RtiConfig,
    connection::FederateSink,
    federate::RtiClient,
    federation::{
        object_model::ObjectModel, roster::FederateHandle, spawn_federation, FederationHandle,
    },
    message::{ClientFrame, CorrelationId, FederateRequest, Reply, RtiMessage},
    operations::RtiError,
};

/// Cheap to clone; every clone refers to the same set of federations.
#[derive(Clone)]
pub struct Rti {
    inner: Arc<RtiInner>,
}

struct RtiInner {
    config: RtiConfig,
    model: Arc<ObjectModel>,
    federations: RwLock<HashMap<String, FederationHandle>>,
}

impl Rti {
    /// Every federation created by this RTI shares `model`.
    pub fn new(config: RtiConfig, model: ObjectModel) -> Self {
        Self {
            inner: Arc::new(RtiInner {
                config,
                model: Arc::new(model),
                federations: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RtiConfig {
        &self.inner.config
    }

    pub fn federation_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.federations.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Must be called from within a tokio runtime.
    pub fn create_federation(&self, name: &str) -> Result<(), RtiError> {
        let mut federations = self.inner.federations.write();
        if federations.contains_key(name) {
            return Err(RtiError::FederationExecutionAlreadyExists(name.to_owned()));
        }
        let handle = spawn_federation(name, self.inner.model.clone(), self.inner.config);
        federations.insert(name.to_owned(), handle);
        tracing::info!(federation = %name, "Federation execution created");
        Ok(())
    }

    pub async fn destroy_federation(&self, name: &str) -> Result<(), RtiError> {
        let federation = self.federation(name)?;
        federation.destroy().await?;
        self.inner.federations.write().remove(name);
        tracing::info!(federation = %name, "Federation execution destroyed");
        Ok(())
    }

    fn federation(&self, name: &str) -> Result<FederationHandle, RtiError> {
        self.inner
            .federations
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RtiError::FederationExecutionDoesNotExist(name.to_owned()))
    }

    /// Opens an in-process session.
    pub fn connect_local(&self) -> RtiClient {
        let capacity = self.inner.config.channel_capacity;
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (messages_tx, messages_rx) = mpsc::channel(capacity);
        tokio::spawn(self.clone().serve_session(frames_rx, messages_tx));
        RtiClient::new(frames_tx, messages_rx, self.inner.config.request_timeout)
    }

    /// Serves one federate connection until `frames` closes.
    ///
    /// A session joins at most one federation at a time. When the session ends while joined,
    /// the federate is treated as disconnected.
    pub(crate) async fn serve_session(
        self,
        mut frames: mpsc::Receiver<ClientFrame>,
        outgoing: FederateSink,
    ) {
        let mut joined: Option<(FederationHandle, FederateHandle)> = None;
        while let Some(frame) = frames.recv().await {
            match frame {
                ClientFrame::CreateFederation { correlation, name } => {
                    let outcome = self.create_federation(&name).map(|()| Reply::Ack);
                    answer(&outgoing, correlation, outcome).await;
                }
                ClientFrame::DestroyFederation { correlation, name } => {
                    let outcome = self.destroy_federation(&name).await.map(|()| Reply::Ack);
                    answer(&outgoing, correlation, outcome).await;
                }
                ClientFrame::Join {
                    correlation,
                    federation,
                    federate_name,
                    federate_type,
                } => {
                    if joined.is_some() {
                        answer(
                            &outgoing,
                            correlation,
                            Err(RtiError::FederateAlreadyExecutionMember),
                        )
                        .await;
                        continue;
                    }
                    let handle = match self.federation(&federation) {
                        Ok(handle) => handle,
                        Err(err) => {
                            answer(&outgoing, correlation, Err(err)).await;
                            continue;
                        }
                    };
                    match handle
                        .join(correlation, federate_name, federate_type, outgoing.clone())
                        .await
                    {
                        Ok(federate) => joined = Some((handle, federate)),
                        // the federation could not see the request
                        Err(err @ RtiError::FederationExecutionDoesNotExist(_)) => {
                            answer(&outgoing, correlation, Err(err)).await;
                        }
                        // already answered by the federation
                        Err(_) => {}
                    }
                }
                ClientFrame::Request {
                    correlation,
                    request,
                } => {
                    let Some((federation, federate)) = &joined else {
                        answer(
                            &outgoing,
                            correlation,
                            Err(RtiError::FederateNotExecutionMember),
                        )
                        .await;
                        continue;
                    };
                    let resigning = matches!(request, FederateRequest::Resign);
                    let submitted = federation.submit(*federate, correlation, request).await;
                    if let Err(err) = submitted {
                        answer(&outgoing, correlation, Err(err)).await;
                        joined = None;
                        continue;
                    }
                    if resigning {
                        joined = None;
                    }
                }
            }
        }
        if let Some((federation, federate)) = joined {
            federation.disconnected(federate).await;
        }
        tracing::debug!("Session closed");
    }
}

async fn answer(outgoing: &FederateSink, correlation: CorrelationId, outcome: Result<Reply, RtiError>) {
    if outgoing
        .send(RtiMessage::reply(correlation, outcome))
        .await
        .is_err()
    {
        tracing::debug!(%correlation, "Session gone before reply");
    }
}
