//! Delivery of RTI messages to joined federates.
//!
//! The federation coordinator only ever talks to federates through a [`Connection`].
//! [`ChannelConnection`] is the implementation used by federations: each attached federate
//! is a bounded queue drained by its session (in-process or TCP). Messages to one federate
//! are delivered in the order they were sent.
//!
//! Delivery never waits on a federate. A federate whose queue is full has stopped draining
//! it and is reported as unreachable, so the federation drops it instead of stalling.

use std::{collections::BTreeSet, future::Future};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    federation::roster::FederateHandle,
    message::{Recipients, RtiMessage},
};

pub(crate) mod codec;
pub mod tcp;

pub type ConnResult<T> = std::result::Result<T, ConnectionError>;

/// Outgoing queue of one federate.
pub type FederateSink = mpsc::Sender<RtiMessage>;

#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ConnectionError {
    #[error("federate {0} is not attached")]
    NotAttached(FederateHandle),
    #[error("unable to deliver to federates {0:?}")]
    Unreachable(BTreeSet<FederateHandle>),
    #[error("outgoing queue of federate {0} is full")]
    Congested(FederateHandle),
    #[error("error while de/serializing message")]
    #[serde(skip)]
    Serialization(#[from] Option<Box<bincode::ErrorKind>>),
    #[error("frame of {size} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("IO error: {0}")]
    IOError(String),
    #[error("connection closed")]
    Closed,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(format!("{err}"))
    }
}

impl Clone for ConnectionError {
    fn clone(&self) -> Self {
        match self {
            Self::NotAttached(federate) => Self::NotAttached(*federate),
            Self::Unreachable(federates) => Self::Unreachable(federates.clone()),
            Self::Congested(federate) => Self::Congested(*federate),
            Self::Serialization(_) => Self::Serialization(None),
            Self::FrameTooLarge { size, limit } => Self::FrameTooLarge {
                size: *size,
                limit: *limit,
            },
            Self::IOError(err) => Self::IOError(err.clone()),
            Self::Closed => Self::Closed,
        }
    }
}

impl ConnectionError {
    /// Federates that should be treated as departed because of this error.
    pub fn unreachable(&self) -> BTreeSet<FederateHandle> {
        match self {
            Self::NotAttached(federate) | Self::Congested(federate) => BTreeSet::from([*federate]),
            Self::Unreachable(federates) => federates.clone(),
            _ => BTreeSet::new(),
        }
    }
}

/// Sends RTI messages to joined federates.
pub trait Connection: Send + Sync {
    fn unicast(
        &self,
        target: FederateHandle,
        msg: RtiMessage,
    ) -> impl Future<Output = ConnResult<()>> + Send;

    /// Sends `msg` to every recipient. Delivery to the others continues when some fail;
    /// the failures are reported together.
    fn multicast(
        &self,
        targets: &Recipients,
        msg: RtiMessage,
    ) -> impl Future<Output = ConnResult<()>> + Send;
}

#[derive(Debug, Default)]
pub struct ChannelConnection {
    sinks: DashMap<FederateHandle, FederateSink>,
}

impl ChannelConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, federate: FederateHandle, sink: FederateSink) {
        self.sinks.insert(federate, sink);
    }

    pub fn detach(&self, federate: FederateHandle) -> Option<FederateSink> {
        self.sinks.remove(&federate).map(|(_, sink)| sink)
    }

    pub fn is_attached(&self, federate: FederateHandle) -> bool {
        self.sinks.contains_key(&federate)
    }

    fn sink(&self, federate: FederateHandle) -> Option<FederateSink> {
        self.sinks.get(&federate).map(|entry| entry.value().clone())
    }

    fn resolve(&self, targets: &Recipients) -> BTreeSet<FederateHandle> {
        match targets {
            Recipients::One(federate) => BTreeSet::from([*federate]),
            Recipients::Set(federates) => federates.clone(),
            Recipients::All => self.sinks.iter().map(|entry| *entry.key()).collect(),
        }
    }
}

impl Connection for ChannelConnection {
    async fn unicast(&self, target: FederateHandle, msg: RtiMessage) -> ConnResult<()> {
        let sink = self.sink(target).ok_or(ConnectionError::NotAttached(target))?;
        sink.try_send(msg).map_err(|err| match err {
            TrySendError::Full(_) => ConnectionError::Congested(target),
            TrySendError::Closed(_) => ConnectionError::Unreachable(BTreeSet::from([target])),
        })
    }

    async fn multicast(&self, targets: &Recipients, msg: RtiMessage) -> ConnResult<()> {
        let mut failed = BTreeSet::new();
        for federate in self.resolve(targets) {
            match self.unicast(federate, msg.clone()).await {
                Ok(()) => {}
                Err(err) => {
                    tracing::debug!(%federate, %err, "Failed delivering message");
                    failed.extend(err.unreachable());
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ConnectionError::Unreachable(failed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Notice;

    fn notice(label: &str) -> RtiMessage {
        Notice::FederationSynchronized {
            label: label.into(),
        }
        .into()
    }

    #[tokio::test]
    async fn multicast_preserves_per_recipient_order() {
        let connection = ChannelConnection::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        connection.attach(FederateHandle::new(1), tx1);
        connection.attach(FederateHandle::new(2), tx2);

        connection
            .multicast(&Recipients::All, notice("a"))
            .await
            .unwrap();
        connection
            .unicast(FederateHandle::new(2), notice("b"))
            .await
            .unwrap();
        connection
            .multicast(&Recipients::All, notice("c"))
            .await
            .unwrap();

        assert_eq!(rx1.recv().await, Some(notice("a")));
        assert_eq!(rx1.recv().await, Some(notice("c")));
        assert_eq!(rx2.recv().await, Some(notice("a")));
        assert_eq!(rx2.recv().await, Some(notice("b")));
        assert_eq!(rx2.recv().await, Some(notice("c")));
    }

    #[tokio::test]
    async fn closed_sinks_are_reported_without_blocking_others() {
        let connection = ChannelConnection::new();
        let (tx1, rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        connection.attach(FederateHandle::new(1), tx1);
        connection.attach(FederateHandle::new(2), tx2);
        drop(rx1);

        let targets = Recipients::Set(BTreeSet::from([
            FederateHandle::new(1),
            FederateHandle::new(2),
            FederateHandle::new(3),
        ]));
        let err = connection
            .multicast(&targets, notice("x"))
            .await
            .unwrap_err();
        assert_eq!(
            err.unreachable(),
            BTreeSet::from([FederateHandle::new(1), FederateHandle::new(3)])
        );
        assert_eq!(rx2.recv().await, Some(notice("x")));
    }

    #[tokio::test]
    async fn stalled_federate_is_reported_instead_of_awaited() {
        let connection = ChannelConnection::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let slow = FederateHandle::new(1);
        let fast = FederateHandle::new(2);
        connection.attach(slow, slow_tx);
        connection.attach(fast, fast_tx);

        connection.multicast(&Recipients::All, notice("a")).await.unwrap();
        let err = connection
            .multicast(&Recipients::All, notice("b"))
            .await
            .unwrap_err();
        assert_eq!(err.unreachable(), BTreeSet::from([slow]));
        assert!(matches!(
            connection.unicast(slow, notice("c")).await,
            Err(ConnectionError::Congested(federate)) if federate == slow
        ));
        assert_eq!(fast_rx.recv().await, Some(notice("a")));
        assert_eq!(fast_rx.recv().await, Some(notice("b")));
    }
}
