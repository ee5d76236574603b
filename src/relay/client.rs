/* This file is part of AnoNet (https://anonet.dev)
 *
 * Copyright (C) 2023-2025 AnoNet developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Relay client: attaches to a relay, requests a pairing with a peer
//! fingerprint and then exposes the paired byte stream as a
//! [`Link`] carrier.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info};
use smol::{lock::Mutex, net::TcpStream};

use super::{
    frame::{read_frame, write_frame, Frame, FrameType, MAX_DATA_PAYLOAD},
    server::{encode_auth_response, encode_hello, SessionState},
};
use crate::{
    crypto::Fingerprint,
    identity::Identity,
    link::Link,
    system::{io_timeout, ExecutorPtr, StoppableTask, StoppableTaskPtr},
    Error, Result,
};

const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);
const PAIR_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive cadence while attached, seconds.
const KEEPALIVE_SECS: u64 = 20;

pub type RelayClientPtr = Arc<RelayClient>;

/// Client side of a relay attachment.
pub struct RelayClient {
    stream: TcpStream,
    write_half: Mutex<TcpStream>,
    session_id: String,
    state: Mutex<SessionState>,
    /// Payloads of forwarded DATA frames
    incoming: (smol::channel::Sender<Vec<u8>>, smol::channel::Receiver<Vec<u8>>),
    /// ACCEPT/REJECT outcomes
    pairing: (smol::channel::Sender<Result<Fingerprint>>, smol::channel::Receiver<Result<Fingerprint>>),
    tasks: std::sync::Mutex<Vec<StoppableTaskPtr>>,
}

impl RelayClient {
    /// Connect and run the challenge/response attach handshake.
    pub async fn connect(addr: SocketAddr, identity: &Identity) -> Result<RelayClientPtr> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectFailed(format!("relay {addr}: {e}")))?;
        let mut read_stream = stream.clone();
        let mut write_stream = stream.clone();

        // Challenge arrives first.
        let challenge = io_timeout(ATTACH_TIMEOUT, read_frame(&mut read_stream)).await?;
        if challenge.frame_type != FrameType::AuthChallenge || challenge.payload.len() != 32 {
            return Err(Error::AuthFailed("bad relay challenge".to_string()))
        }

        let signature = identity.keypair().sign(&challenge.payload);
        let public_der = identity.keypair().public_der()?;
        write_frame(
            &mut write_stream,
            &Frame::new(FrameType::AuthResponse, "", encode_auth_response(&signature, &public_der)),
        )
        .await?;

        write_frame(
            &mut write_stream,
            &Frame::new(
                FrameType::Hello,
                "",
                encode_hello(&identity.fingerprint(), &public_der),
            ),
        )
        .await?;

        let hello_ack = io_timeout(ATTACH_TIMEOUT, read_frame(&mut read_stream)).await?;
        if hello_ack.frame_type != FrameType::HelloAck || hello_ack.session_id.len() != 16 {
            return Err(Error::AuthFailed("relay did not acknowledge attach".to_string()))
        }

        info!(
            target: "relay::client",
            "Attached to relay {addr} as session {}", hello_ack.session_id
        );

        Ok(Arc::new(Self {
            stream: stream.clone(),
            write_half: Mutex::new(stream),
            session_id: hello_ack.session_id,
            state: Mutex::new(SessionState::Connected),
            incoming: smol::channel::unbounded(),
            pairing: smol::channel::unbounded(),
            tasks: std::sync::Mutex::new(vec![]),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Spawn the receive and keepalive loops.
    pub fn start(self: &Arc<Self>, executor: &ExecutorPtr) {
        let recv_task = StoppableTask::new();
        recv_task.clone().start(
            self.clone().recv_loop(),
            |res| async {
                match res {
                    Ok(()) | Err(Error::DetachedTaskStopped) => {}
                    Err(e) => debug!(target: "relay::client", "Receive loop ended: {e}"),
                }
            },
            Error::DetachedTaskStopped,
            executor,
        );

        let keepalive_task = StoppableTask::new();
        keepalive_task.clone().start(
            self.clone().keepalive_loop(),
            |_| async {},
            Error::DetachedTaskStopped,
            executor,
        );

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(recv_task);
        tasks.push(keepalive_task);
    }

    pub async fn stop(&self) {
        let _ = self.write(Frame::new(FrameType::Close, &self.session_id, vec![])).await;
        *self.state.lock().await = SessionState::Closed;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.stop().await;
        }
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        let mut stream = self.write_half.lock().await;
        write_frame(&mut *stream, &frame).await
    }

    /// Ask the relay to pair us with `peer`. On ACCEPT the paired
    /// stream is returned as a link.
    pub async fn request(self: &Arc<Self>, peer: &Fingerprint) -> Result<RelayLink> {
        *self.state.lock().await = SessionState::WaitingForPeer;
        self.write(Frame::new(
            FrameType::Request,
            &self.session_id,
            peer.as_bytes().to_vec(),
        ))
        .await?;

        let outcome =
            io_timeout(PAIR_TIMEOUT, async { Ok(self.pairing.1.recv().await?) }).await??;

        *self.state.lock().await = SessionState::Relaying;
        debug!(target: "relay::client", "Paired with {outcome:?}");
        Ok(RelayLink { client: self.clone(), peer: outcome })
    }

    /// Wait for the relay to pair someone with us.
    pub async fn wait_pair(self: &Arc<Self>) -> Result<RelayLink> {
        let outcome = self.pairing.1.recv().await??;
        *self.state.lock().await = SessionState::Relaying;
        Ok(RelayLink { client: self.clone(), peer: outcome })
    }

    async fn recv_loop(self: Arc<Self>) -> Result<()> {
        let mut read_stream = self.stream.clone();

        loop {
            let frame = read_frame(&mut read_stream).await?;

            match frame.frame_type {
                FrameType::Data => {
                    let _ = self.incoming.0.send(frame.payload).await;
                }
                FrameType::Accept => {
                    let peer = Fingerprint::from_bytes(&frame.payload)?;
                    let _ = self.pairing.0.send(Ok(peer)).await;
                }
                FrameType::Reject => {
                    let reason = String::from_utf8_lossy(&frame.payload).to_string();
                    let _ = self.pairing.0.send(Err(Error::RelayRejected(reason))).await;
                }
                FrameType::Ping => {
                    self.write(Frame::new(FrameType::Pong, &self.session_id, vec![])).await?
                }
                FrameType::Pong => {}
                FrameType::Close => {
                    *self.state.lock().await = SessionState::Connected;
                    self.incoming.0.close();
                }
                FrameType::Error => {
                    debug!(
                        target: "relay::client",
                        "Relay error: {}", String::from_utf8_lossy(&frame.payload)
                    );
                }
                other => {
                    return Err(Error::MalformedPacket(format!("unexpected frame {other:?}")))
                }
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>) -> Result<()> {
        loop {
            crate::system::sleep(KEEPALIVE_SECS).await;
            if *self.state.lock().await == SessionState::Closed {
                return Ok(())
            }
            self.write(Frame::new(FrameType::Ping, &self.session_id, vec![])).await?;
        }
    }
}

/// A paired relay stream as a message carrier.
pub struct RelayLink {
    client: RelayClientPtr,
    peer: Fingerprint,
}

impl RelayLink {
    pub fn peer(&self) -> Fingerprint {
        self.peer
    }
}

#[async_trait]
impl Link for RelayLink {
    async fn send(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_DATA_PAYLOAD {
            return Err(Error::MalformedPacket("relay payload too large".to_string()))
        }
        self.client
            .write(Frame::new(FrameType::Data, &self.client.session_id, data.to_vec()))
            .await
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        Ok(self.client.incoming.1.recv().await?)
    }

    async fn close(&self) -> Result<()> {
        self.client
            .write(Frame::new(FrameType::Close, &self.client.session_id, vec![]))
            .await
    }

    fn max_message_size(&self) -> usize {
        MAX_DATA_PAYLOAD
    }
}
