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

//! TCP relay server.
//!
//! Clients attach with a challenge/response against their long-term
//! key; the relay trusts only the fingerprint it computes itself from
//! the presented public key. Two attached clients are paired on
//! request, after which DATA frames are forwarded verbatim in both
//! directions. The relay never inspects payloads.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use rand::{rngs::OsRng, RngCore};
use smol::{lock::Mutex, net::TcpStream};

use super::frame::{read_frame, write_frame, Frame, FrameType};
use crate::{
    crypto::{keys as crypto_keys, Fingerprint},
    system::{io_timeout, ExecutorPtr, StoppableTask, StoppableTaskPtr},
    util::time::Timestamp,
    Error, Result,
};

/// Idle sessions are evicted after this long.
const SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Maintenance scan cadence, seconds.
const MAINTENANCE_INTERVAL_SECS: u64 = 60;

/// Deadline per attach-handshake frame.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Attach rate limit per source IP.
const RATE_BUCKET_CAPACITY: f64 = 10.0;
const RATE_REFILL_PER_SEC: f64 = 1.0;

/// Relay-side session states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    WaitingForPeer,
    Relaying,
    Closed,
}

struct TokenBucket {
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self { tokens: RATE_BUCKET_CAPACITY, refilled: Instant::now() }
    }

    fn try_take(&mut self) -> bool {
        let elapsed = self.refilled.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * RATE_REFILL_PER_SEC).min(RATE_BUCKET_CAPACITY);
        self.refilled = Instant::now();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return true
        }
        false
    }
}

/// One attached client.
struct ClientHandle {
    session_id: String,
    fingerprint: Fingerprint,
    stream: TcpStream,
    outbound: smol::channel::Sender<Frame>,
    state: Mutex<SessionState>,
    last_activity: Mutex<Timestamp>,
}

impl ClientHandle {
    async fn touch(&self) {
        *self.last_activity.lock().await = Timestamp::current_time();
    }

    async fn queue(&self, frame: Frame) {
        let _ = self.outbound.send(frame).await;
    }
}

pub type RelayServerPtr = Arc<RelayServer>;

/// Relay server state.
pub struct RelayServer {
    listener: smol::net::TcpListener,
    port: u16,
    /// Attached clients by session id
    clients: Mutex<HashMap<String, Arc<ClientHandle>>>,
    /// Attached clients by identity
    by_fingerprint: Mutex<HashMap<Fingerprint, String>>,
    /// Active pairings, both directions present
    pairs: Mutex<HashMap<String, String>>,
    rate: Mutex<HashMap<IpAddr, TokenBucket>>,
    executor: std::sync::Mutex<Option<ExecutorPtr>>,
    tasks: std::sync::Mutex<Vec<StoppableTaskPtr>>,
}

impl RelayServer {
    pub async fn bind(port: u16) -> Result<RelayServerPtr> {
        let listener = smol::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        let port =
            listener.local_addr().map_err(|e| Error::BindFailed(e.to_string()))?.port();

        info!(target: "relay::server", "Relay listening on TCP port {port}");

        Ok(Arc::new(Self {
            listener,
            port,
            clients: Mutex::new(HashMap::new()),
            by_fingerprint: Mutex::new(HashMap::new()),
            pairs: Mutex::new(HashMap::new()),
            rate: Mutex::new(HashMap::new()),
            executor: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(vec![]),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn start(self: &Arc<Self>, executor: &ExecutorPtr) {
        *self.executor.lock().unwrap() = Some(executor.clone());

        let accept_task = StoppableTask::new();
        accept_task.clone().start(
            self.clone().accept_loop(),
            |res| async {
                match res {
                    Ok(()) | Err(Error::DetachedTaskStopped) => {}
                    Err(e) => warn!(target: "relay::server", "Accept loop died: {e}"),
                }
            },
            Error::DetachedTaskStopped,
            executor,
        );

        let maintenance_task = StoppableTask::new();
        maintenance_task.clone().start(
            self.clone().maintenance(),
            |res| async {
                match res {
                    Ok(()) | Err(Error::DetachedTaskStopped) => {}
                    Err(e) => warn!(target: "relay::server", "Maintenance died: {e}"),
                }
            },
            Error::DetachedTaskStopped,
            executor,
        );

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(accept_task);
        tasks.push(maintenance_task);
    }

    pub async fn stop(&self) {
        let clients: Vec<_> = self.clients.lock().await.values().cloned().collect();
        for client in clients {
            client.queue(Frame::new(FrameType::Close, &client.session_id, vec![])).await;
            let _ = client.stream.shutdown(std::net::Shutdown::Both);
        }

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.stop().await;
        }
    }

    async fn accept_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;

            if !self.rate.lock().await.entry(peer.ip()).or_insert_with(TokenBucket::new).try_take()
            {
                debug!(target: "relay::server", "Rate limited attach from {peer}");
                let _ = stream.shutdown(std::net::Shutdown::Both);
                continue
            }

            let Some(executor) = self.executor.lock().unwrap().clone() else { continue };
            let this = self.clone();
            executor
                .spawn(async move {
                    if let Err(e) = this.clone().handle_connection(stream, peer).await {
                        debug!(target: "relay::server", "Connection {peer}: {e}");
                    }
                })
                .detach();
        }
    }

    /// Challenge/response attach, then the frame dispatch loop.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut read_stream = stream.clone();

        // AUTH_CHALLENGE: 32 random bytes the client must sign.
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        write_frame(&mut stream.clone(), &Frame::new(FrameType::AuthChallenge, "", nonce.to_vec()))
            .await?;

        let response = io_timeout(READ_TIMEOUT, read_frame(&mut read_stream)).await?;
        if response.frame_type != FrameType::AuthResponse {
            return Err(Error::AuthFailed("expected AUTH_RESPONSE".to_string()))
        }
        let fingerprint = verify_auth_response(&nonce, &response.payload)?;

        // HELLO carries the claimed fingerprint and key again; the
        // computed fingerprint is authoritative.
        let hello = io_timeout(READ_TIMEOUT, read_frame(&mut read_stream)).await?;
        if hello.frame_type != FrameType::Hello {
            return Err(Error::AuthFailed("expected HELLO".to_string()))
        }
        if parse_hello(&hello.payload)? != fingerprint {
            return Err(Error::AuthFailed("HELLO fingerprint mismatch".to_string()))
        }

        let session_id = fresh_session_id();
        write_frame(
            &mut stream.clone(),
            &Frame::new(FrameType::HelloAck, &session_id, vec![]),
        )
        .await?;

        let (outbound_send, outbound_recv) = smol::channel::unbounded::<Frame>();
        let handle = Arc::new(ClientHandle {
            session_id: session_id.clone(),
            fingerprint,
            stream: stream.clone(),
            outbound: outbound_send,
            state: Mutex::new(SessionState::Connected),
            last_activity: Mutex::new(Timestamp::current_time()),
        });

        // A second attach by the same identity replaces the first.
        if let Some(old_sid) = self
            .by_fingerprint
            .lock()
            .await
            .insert(fingerprint, session_id.clone())
        {
            self.drop_client(&old_sid).await;
        }
        self.clients.lock().await.insert(session_id.clone(), handle.clone());
        info!(target: "relay::server", "Client {fingerprint:?} attached as {session_id}");

        // Writer task: single owner of the outbound direction.
        let mut write_stream = stream.clone();
        let writer = smol::spawn(async move {
            while let Ok(frame) = outbound_recv.recv().await {
                if write_frame(&mut write_stream, &frame).await.is_err() {
                    break
                }
            }
        });

        let result = self.clone().dispatch_loop(&handle, &mut read_stream).await;

        writer.cancel().await;
        self.drop_client(&session_id).await;
        result
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        handle: &Arc<ClientHandle>,
        read_stream: &mut TcpStream,
    ) -> Result<()> {
        loop {
            // Reads have no deadline of their own: idle eviction and
            // shutdown both close the socket, which ends this loop
            // within one read.
            let frame = read_frame(read_stream).await?;

            handle.touch().await;

            match frame.frame_type {
                FrameType::Request => self.handle_request(handle, &frame).await?,
                FrameType::Data => self.forward_data(handle, frame).await,
                FrameType::Close => {
                    self.unpair(&handle.session_id, true).await;
                    *handle.state.lock().await = SessionState::Connected;
                }
                FrameType::Ping => {
                    handle.queue(Frame::new(FrameType::Pong, &handle.session_id, vec![])).await
                }
                FrameType::Pong => {}
                other => {
                    debug!(target: "relay::server", "Unexpected frame {other:?}");
                    handle
                        .queue(Frame::new(
                            FrameType::Error,
                            &handle.session_id,
                            b"unexpected frame".to_vec(),
                        ))
                        .await;
                }
            }
        }
    }

    async fn handle_request(
        self: &Arc<Self>,
        handle: &Arc<ClientHandle>,
        frame: &Frame,
    ) -> Result<()> {
        let target = match Fingerprint::from_bytes(&frame.payload) {
            Ok(fp) => fp,
            Err(_) => {
                handle
                    .queue(Frame::new(
                        FrameType::Reject,
                        &handle.session_id,
                        b"malformed target".to_vec(),
                    ))
                    .await;
                return Ok(())
            }
        };

        *handle.state.lock().await = SessionState::WaitingForPeer;

        let target_sid = self.by_fingerprint.lock().await.get(&target).cloned();
        let target_handle = match target_sid {
            Some(sid) => self.clients.lock().await.get(&sid).cloned(),
            None => None,
        };

        let Some(target_handle) = target_handle else {
            *handle.state.lock().await = SessionState::Connected;
            handle
                .queue(Frame::new(
                    FrameType::Reject,
                    &handle.session_id,
                    b"peer not attached".to_vec(),
                ))
                .await;
            return Ok(())
        };

        if *target_handle.state.lock().await == SessionState::Relaying {
            *handle.state.lock().await = SessionState::Connected;
            handle
                .queue(Frame::new(FrameType::Reject, &handle.session_id, b"peer busy".to_vec()))
                .await;
            return Ok(())
        }

        // Pair them up.
        {
            let mut pairs = self.pairs.lock().await;
            pairs.insert(handle.session_id.clone(), target_handle.session_id.clone());
            pairs.insert(target_handle.session_id.clone(), handle.session_id.clone());
        }
        *handle.state.lock().await = SessionState::Relaying;
        *target_handle.state.lock().await = SessionState::Relaying;

        info!(
            target: "relay::server",
            "Paired {} with {}", handle.session_id, target_handle.session_id
        );

        handle
            .queue(Frame::new(
                FrameType::Accept,
                &handle.session_id,
                target_handle.fingerprint.as_bytes().to_vec(),
            ))
            .await;
        target_handle
            .queue(Frame::new(
                FrameType::Accept,
                &target_handle.session_id,
                handle.fingerprint.as_bytes().to_vec(),
            ))
            .await;

        Ok(())
    }

    /// Opaque forwarding; the payload is untouched.
    async fn forward_data(self: &Arc<Self>, handle: &Arc<ClientHandle>, frame: Frame) {
        let peer_sid = self.pairs.lock().await.get(&handle.session_id).cloned();
        let Some(peer_sid) = peer_sid else { return };

        let peer = self.clients.lock().await.get(&peer_sid).cloned();
        if let Some(peer) = peer {
            peer.touch().await;
            peer.queue(Frame::new(FrameType::Data, &peer_sid, frame.payload)).await;
        }
    }

    async fn unpair(&self, session_id: &str, notify_peer: bool) {
        let peer_sid = {
            let mut pairs = self.pairs.lock().await;
            let peer = pairs.remove(session_id);
            if let Some(ref peer) = peer {
                pairs.remove(peer);
            }
            peer
        };

        let Some(peer_sid) = peer_sid else { return };
        if let Some(peer) = self.clients.lock().await.get(&peer_sid).cloned() {
            *peer.state.lock().await = SessionState::Connected;
            if notify_peer {
                peer.queue(Frame::new(FrameType::Close, &peer_sid, vec![])).await;
            }
        }
    }

    async fn drop_client(&self, session_id: &str) {
        self.unpair(session_id, true).await;

        let Some(handle) = self.clients.lock().await.remove(session_id) else { return };
        *handle.state.lock().await = SessionState::Closed;

        let mut by_fp = self.by_fingerprint.lock().await;
        if by_fp.get(&handle.fingerprint) == Some(&handle.session_id) {
            by_fp.remove(&handle.fingerprint);
        }

        let _ = handle.stream.shutdown(std::net::Shutdown::Both);
        debug!(target: "relay::server", "Dropped client {session_id}");
    }

    /// Periodic eviction of idle sessions.
    async fn maintenance(self: Arc<Self>) -> Result<()> {
        loop {
            crate::system::sleep(MAINTENANCE_INTERVAL_SECS).await;

            let stale: Vec<String> = {
                let clients = self.clients.lock().await;
                let mut stale = vec![];
                for (sid, handle) in clients.iter() {
                    if handle.last_activity.lock().await.elapsed()
                        > SESSION_TIMEOUT.as_millis() as u64
                    {
                        stale.push(sid.clone());
                    }
                }
                stale
            };

            for sid in stale {
                info!(target: "relay::server", "Evicting idle session {sid}");
                if let Some(handle) = self.clients.lock().await.get(&sid).cloned() {
                    handle.queue(Frame::new(FrameType::Close, &sid, vec![])).await;
                }
                self.drop_client(&sid).await;
            }
        }
    }
}

/// `2 B signature length || DER signature || DER public key`, signature
/// over the challenge nonce. Returns the computed fingerprint.
fn verify_auth_response(nonce: &[u8; 32], payload: &[u8]) -> Result<Fingerprint> {
    if payload.len() < 2 {
        return Err(Error::AuthFailed("short AUTH_RESPONSE".to_string()))
    }

    let sig_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + sig_len + 1 {
        return Err(Error::AuthFailed("truncated AUTH_RESPONSE".to_string()))
    }

    let signature = &payload[2..2 + sig_len];
    let public_der = &payload[2 + sig_len..];

    let public = crypto_keys::public_from_der(public_der)
        .map_err(|_| Error::AuthFailed("bad public key".to_string()))?;
    crypto_keys::verify(&public, nonce, signature)
        .map_err(|_| Error::AuthFailed("challenge signature invalid".to_string()))?;

    Ok(Fingerprint::of_der(public_der))
}

/// `2 B fingerprint length || fingerprint || DER public key`
fn parse_hello(payload: &[u8]) -> Result<Fingerprint> {
    if payload.len() < 2 {
        return Err(Error::AuthFailed("short HELLO".to_string()))
    }
    let fp_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + fp_len {
        return Err(Error::AuthFailed("truncated HELLO".to_string()))
    }

    Fingerprint::from_bytes(&payload[2..2 + fp_len])
}

/// 16 lowercase hex characters.
fn fresh_session_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(super) fn encode_auth_response(signature: &[u8], public_der: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + signature.len() + public_der.len());
    payload.extend_from_slice(&(signature.len() as u16).to_be_bytes());
    payload.extend_from_slice(signature);
    payload.extend_from_slice(public_der);
    payload
}

pub(super) fn encode_hello(fingerprint: &Fingerprint, public_der: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + 32 + public_der.len());
    payload.extend_from_slice(&(32u16).to_be_bytes());
    payload.extend_from_slice(fingerprint.as_bytes());
    payload.extend_from_slice(public_der);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn auth_response_verification() {
        let (identity, _) = Identity::generate("relaytest").unwrap();
        let nonce = [0x42u8; 32];

        let signature = identity.keypair().sign(&nonce);
        let der = identity.keypair().public_der().unwrap();
        let payload = encode_auth_response(&signature, &der);

        let fp = verify_auth_response(&nonce, &payload).unwrap();
        assert_eq!(fp, identity.fingerprint());

        // Signature over a different nonce fails.
        let other_nonce = [0x43u8; 32];
        assert!(verify_auth_response(&other_nonce, &payload).is_err());
    }

    #[test]
    fn hello_parsing() {
        let (identity, _) = Identity::generate("hellotest").unwrap();
        let der = identity.keypair().public_der().unwrap();
        let payload = encode_hello(&identity.fingerprint(), &der);

        assert_eq!(parse_hello(&payload).unwrap(), identity.fingerprint());
        assert!(parse_hello(&[0x00]).is_err());
    }

    #[test]
    fn token_bucket_limits_bursts() {
        let mut bucket = TokenBucket::new();
        for _ in 0..10 {
            assert!(bucket.try_take());
        }
        assert!(!bucket.try_take());
    }

    #[test]
    fn session_ids_are_16_hex() {
        let sid = fresh_session_id();
        assert_eq!(sid.len(), 16);
        assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
