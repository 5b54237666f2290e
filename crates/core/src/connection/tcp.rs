//! TCP transport. Each socket carries one federate session framed by [`super::codec`].

use std::net::SocketAddr;

use tokio::{
    io::{BufReader, BufWriter},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::mpsc,
};

use super::{codec, ConnResult};
use crate::{
    config::RtiConfig,
    federate::RtiClient,
    message::{ClientFrame, RtiMessage},
    rti::Rti,
};

/// Accepts federate connections until the listener fails.
pub async fn serve(rti: Rti, listener: TcpListener, max_frame_size: usize) -> ConnResult<()> {
    let local = listener.local_addr()?;
    tracing::info!(%local, "Accepting federate connections");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Federate connected");
                tokio::spawn(serve_socket(rti.clone(), stream, peer, max_frame_size));
            }
            Err(err) => {
                tracing::warn!(%err, "Failed to accept connection");
            }
        }
    }
}

async fn serve_socket(rti: Rti, stream: TcpStream, peer: SocketAddr, max_frame_size: usize) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%peer, %err, "Unable to disable Nagle");
    }
    let (reader, writer) = stream.into_split();
    let capacity = rti.config().channel_capacity;
    let (frames_tx, frames_rx) = mpsc::channel(capacity);
    let (messages_tx, mut messages_rx) = mpsc::channel::<RtiMessage>(capacity);
    let session = tokio::spawn(rti.serve_session(frames_rx, messages_tx));

    tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(message) = messages_rx.recv().await {
            if let Err(err) = codec::write_frame(&mut writer, &message, max_frame_size).await {
                tracing::warn!(%peer, %err, "Failed writing to federate");
                break;
            }
        }
    });

    let mut reader = BufReader::new(reader);
    loop {
        match codec::read_frame::<_, ClientFrame>(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => {
                if frames_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%peer, %err, "Dropping federate connection");
                break;
            }
        }
    }
    drop(frames_tx);
    if let Err(err) = session.await {
        tracing::error!(%peer, %err, "Session task failed");
    }
    tracing::debug!(%peer, "Federate connection closed");
}

/// Connects a federate to the RTI listening on `addr`.
pub async fn connect(
    addr: impl ToSocketAddrs,
    config: &RtiConfig,
    max_frame_size: usize,
) -> ConnResult<RtiClient> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let (reader, writer) = stream.into_split();
    let (frames_tx, mut frames_rx) = mpsc::channel::<ClientFrame>(config.channel_capacity);
    let (messages_tx, messages_rx) = mpsc::channel(config.channel_capacity);

    tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(frame) = frames_rx.recv().await {
            if let Err(err) = codec::write_frame(&mut writer, &frame, max_frame_size).await {
                tracing::warn!(%peer, %err, "Failed writing to RTI");
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            match codec::read_frame::<_, RtiMessage>(&mut reader, max_frame_size).await {
                Ok(Some(message)) => {
                    if messages_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%peer, %err, "Dropping RTI connection");
                    break;
                }
            }
        }
    });

    tracing::debug!(%peer, "Connected to RTI");
    Ok(RtiClient::new(frames_tx, messages_rx, config.request_timeout))
}
