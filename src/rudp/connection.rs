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

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use log::debug;
use smol::lock::Mutex;

use super::packet::{
    Header, FLAG_ACK, FLAG_DATA, FLAG_FIN, FLAG_RST, FLAG_SYN, MAX_PAYLOAD_SIZE,
};
use crate::{
    link::Link,
    system::{io_timeout, msleep},
    Error, Result,
};

/// Sliding window: packets in flight before the sender stalls
pub const DEFAULT_WINDOW: usize = 32;

const MIN_RTO: Duration = Duration::from_millis(200);
const MAX_RTO: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 10;

/// How often the retransmit loop scans the unacked map
const RETRANSMIT_TICK_MS: u64 = 50;

pub type ConnectionPtr = Arc<Connection>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    SynSent,
    SynReceived,
    Connected,
    Closed,
}

/// Notifications a packet can produce for the owning socket.
pub(super) enum ConnEvent {
    /// Responder handshake completed; surface on the accept queue
    Established,
}

struct Pending {
    packet: Vec<u8>,
    sent_at: Instant,
    retries: u32,
}

/// One reliable-UDP connection over a punched socket.
///
/// Sequence 0 is consumed by the SYN on each side; data starts at 1.
/// ACK numbers are cumulative (last in-order sequence received).
pub struct Connection {
    remote: SocketAddr,
    socket: smol::net::UdpSocket,
    state: Mutex<State>,
    window: usize,

    /// Next sequence number to assign
    send_seq: Mutex<u32>,
    unacked: Mutex<HashMap<u32, Pending>>,
    rtt_estimate: Mutex<Duration>,
    /// Signalled whenever acks free window space
    window_event: (smol::channel::Sender<()>, smol::channel::Receiver<()>),

    /// Next expected receive sequence
    rcv_seq: Mutex<u32>,
    incoming: (smol::channel::Sender<Vec<u8>>, smol::channel::Receiver<Vec<u8>>),

    /// Handshake / teardown signals
    syn_ack_event: (smol::channel::Sender<u32>, smol::channel::Receiver<u32>),
    fin_ack_event: (smol::channel::Sender<()>, smol::channel::Receiver<()>),

    failure: Mutex<Option<Error>>,
}

impl Connection {
    pub(super) fn new(
        socket: smol::net::UdpSocket,
        remote: SocketAddr,
        initial_state: State,
    ) -> ConnectionPtr {
        Arc::new(Self {
            remote,
            socket,
            state: Mutex::new(initial_state),
            window: DEFAULT_WINDOW,
            send_seq: Mutex::new(0),
            unacked: Mutex::new(HashMap::new()),
            rtt_estimate: Mutex::new(MIN_RTO),
            window_event: smol::channel::bounded(1),
            rcv_seq: Mutex::new(0),
            incoming: smol::channel::unbounded(),
            syn_ack_event: smol::channel::bounded(1),
            fin_ack_event: smol::channel::bounded(1),
            failure: Mutex::new(None),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn state(&self) -> State {
        *self.state.lock().await
    }

    async fn send_packet(&self, flags: u8, seq: u32, ack: u32, payload: &[u8]) -> Result<()> {
        let header = Header { seq, ack, flags, window: self.window as u16 };
        self.socket.send_to(&header.encode(payload), self.remote).await?;
        Ok(())
    }

    async fn last_delivered(&self) -> u32 {
        self.rcv_seq.lock().await.wrapping_sub(1)
    }

    // =============
    // Initiator side
    // =============

    /// Three-way handshake, initiator side: SYN, await SYN|ACK, ACK.
    pub(super) async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut backoff = MIN_RTO;

        for _ in 0..5 {
            self.send_packet(FLAG_SYN, 0, 0, &[]).await?;

            match io_timeout(backoff, async { Ok(self.syn_ack_event.1.recv().await?) }).await {
                Ok(peer_seq) => {
                    self.send_packet(FLAG_ACK, 0, peer_seq, &[]).await?;
                    *self.send_seq.lock().await = 1;
                    *self.state.lock().await = State::Connected;
                    return Ok(())
                }
                Err(Error::TimedOut) => backoff = (backoff * 2).min(MAX_RTO),
                Err(e) => return Err(e),
            }
        }

        Err(Error::ConnectFailed(format!("handshake with {} timed out", self.remote)))
    }

    // ==========
    // Send path
    // ==========

    /// Queue one data packet, stalling while the window is full.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::MalformedPacket("payload exceeds rudp limit".to_string()))
        }

        loop {
            self.check_failed().await?;
            if *self.state.lock().await != State::Connected {
                return Err(Error::ConnectionClosed)
            }

            if self.unacked.lock().await.len() < self.window {
                break
            }

            // Wait for ack progress; re-check failure on timeout.
            let _ = io_timeout(MAX_RTO, async { Ok(self.window_event.1.recv().await?) }).await;
        }

        let seq = {
            let mut send_seq = self.send_seq.lock().await;
            let seq = *send_seq;
            *send_seq = send_seq.wrapping_add(1);
            seq
        };

        let header =
            Header { seq, ack: self.last_delivered().await, flags: FLAG_DATA, window: self.window as u16 };
        let packet = header.encode(data);

        self.unacked
            .lock()
            .await
            .insert(seq, Pending { packet: packet.clone(), sent_at: Instant::now(), retries: 0 });

        self.socket.send_to(&packet, self.remote).await?;
        Ok(())
    }

    /// In-order payload stream.
    pub async fn recv_data(&self) -> Result<Vec<u8>> {
        match self.incoming.1.recv().await {
            Ok(data) => Ok(data),
            Err(_) => {
                self.check_failed().await?;
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Wait until every queued packet has been acknowledged.
    pub async fn flush(&self) -> Result<()> {
        loop {
            self.check_failed().await?;
            if self.unacked.lock().await.is_empty() {
                return Ok(())
            }
            let _ = io_timeout(MIN_RTO, async { Ok(self.window_event.1.recv().await?) }).await;
        }
    }

    async fn check_failed(&self) -> Result<()> {
        match &*self.failure.lock().await {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn fail(&self, error: Error) {
        *self.failure.lock().await = Some(error);
        *self.state.lock().await = State::Closed;
        self.incoming.0.close();
        let _ = self.window_event.0.try_send(());
    }

    // ====================
    // Retransmit machinery
    // ====================

    /// Periodic scan of the unacked map. Runs until the connection
    /// closes; worst-case shutdown latency is one tick.
    pub(super) async fn retransmit_loop(self: Arc<Self>) -> Result<()> {
        loop {
            msleep(RETRANSMIT_TICK_MS).await;

            if *self.state.lock().await == State::Closed {
                return Ok(())
            }

            let rtt = *self.rtt_estimate.lock().await;
            let mut expired = None;

            {
                let mut unacked = self.unacked.lock().await;
                for (seq, pending) in unacked.iter_mut() {
                    let rto = rto_for(rtt, pending.retries);
                    if pending.sent_at.elapsed() < rto {
                        continue
                    }

                    if pending.retries >= MAX_RETRIES {
                        expired = Some(*seq);
                        break
                    }

                    debug!(
                        target: "rudp::connection",
                        "Retransmit seq {seq} (attempt {})", pending.retries + 1
                    );
                    pending.retries += 1;
                    pending.sent_at = Instant::now();
                    let _ = self.socket.send_to(&pending.packet, self.remote).await;
                }
            }

            if let Some(seq) = expired {
                self.fail(Error::TransportFailed(format!("packet {seq} exhausted retries"))).await;
                return Ok(())
            }
        }
    }

    async fn handle_ack(&self, ack: u32) {
        let mut unacked = self.unacked.lock().await;
        let before = unacked.len();

        let mut sample = None;
        unacked.retain(|seq, pending| {
            if *seq == ack || seq_before(*seq, ack) {
                sample = Some(pending.sent_at.elapsed());
                false
            } else {
                true
            }
        });

        if unacked.len() < before {
            if let Some(measured) = sample {
                *self.rtt_estimate.lock().await = rtt_update(measured);
            }
            let _ = self.window_event.0.try_send(());
        }
    }

    // =============
    // Receive path
    // =============

    /// Process one inbound packet addressed to this connection.
    pub(super) async fn handle_packet(
        self: &Arc<Self>,
        header: Header,
        payload: &[u8],
    ) -> Result<Option<ConnEvent>> {
        if header.has(FLAG_RST) {
            debug!(target: "rudp::connection", "RST from {}", self.remote);
            self.fail(Error::ConnectionClosed).await;
            return Ok(None)
        }

        if header.has(FLAG_SYN) && header.has(FLAG_ACK) {
            let _ = self.syn_ack_event.0.try_send(header.seq);
            *self.rcv_seq.lock().await = header.seq.wrapping_add(1);
            return Ok(None)
        }

        if header.has(FLAG_SYN) {
            // Responder: consume the initiator's seq 0, answer SYN|ACK.
            // A SYN retransmit repeats this; a stale duplicate on an
            // established connection is ignored.
            {
                let state = self.state.lock().await;
                if *state == State::Connected || *state == State::Closed {
                    return Ok(None)
                }
            }
            *self.rcv_seq.lock().await = header.seq.wrapping_add(1);
            *self.state.lock().await = State::SynReceived;
            self.send_packet(FLAG_SYN | FLAG_ACK, 0, header.seq, &[]).await?;
            return Ok(None)
        }

        if header.has(FLAG_FIN) {
            if header.has(FLAG_ACK) {
                let _ = self.fin_ack_event.0.try_send(());
            } else {
                self.send_packet(FLAG_FIN | FLAG_ACK, 0, header.seq, &[]).await?;
            }
            *self.state.lock().await = State::Closed;
            self.incoming.0.close();
            return Ok(None)
        }

        if header.has(FLAG_DATA) {
            // A lost handshake ACK is repaired by the first data packet.
            let established = self.promote_if_syn_received().await;
            self.handle_data(header.seq, payload).await?;
            return Ok(established)
        }

        if header.has(FLAG_ACK) {
            let established = self.promote_if_syn_received().await;
            self.handle_ack(header.ack).await;
            return Ok(established)
        }

        Ok(None)
    }

    async fn promote_if_syn_received(&self) -> Option<ConnEvent> {
        let mut state = self.state.lock().await;
        if *state == State::SynReceived {
            *state = State::Connected;
            *self.send_seq.lock().await = 1;
            return Some(ConnEvent::Established)
        }
        None
    }

    async fn handle_data(self: &Arc<Self>, seq: u32, payload: &[u8]) -> Result<()> {
        let expected = *self.rcv_seq.lock().await;

        if seq == expected {
            *self.rcv_seq.lock().await = expected.wrapping_add(1);
            let _ = self.incoming.0.send(payload.to_vec()).await;
            self.send_packet(FLAG_ACK, 0, seq, &[]).await?;
            return Ok(())
        }

        // Duplicate of an already-delivered packet: re-ack to unstick
        // the sender. Anything ahead of the expected sequence is
        // dropped; the send window does the buffering.
        if seq_before(seq, expected) {
            self.send_packet(FLAG_ACK, 0, self.last_delivered().await, &[]).await?;
        }

        Ok(())
    }

    // =========
    // Teardown
    // =========

    /// FIN / FIN|ACK exchange with a single retransmit, then the
    /// connection is closed regardless. In-flight data is drained
    /// first so the peer never sees FIN overtake a payload.
    pub async fn close(&self) -> Result<()> {
        let _ = self.flush().await;
        {
            let mut state = self.state.lock().await;
            if *state == State::Closed {
                return Ok(())
            }
            *state = State::Closed;
        }

        let seq = *self.send_seq.lock().await;
        for _ in 0..2 {
            self.send_packet(FLAG_FIN, seq, self.last_delivered().await, &[]).await?;
            if io_timeout(MIN_RTO * 2, async { Ok(self.fin_ack_event.1.recv().await?) })
                .await
                .is_ok()
            {
                break
            }
        }

        self.incoming.0.close();
        Ok(())
    }

    /// Abort without the FIN exchange.
    pub(super) async fn reset(&self) {
        let _ = self.send_packet(FLAG_RST, 0, 0, &[]).await;
        self.fail(Error::ConnectionClosed).await;
    }
}

fn rto_for(estimate: Duration, retries: u32) -> Duration {
    let scaled = estimate * 2u32.saturating_pow(retries).min(64);
    scaled.clamp(MIN_RTO, MAX_RTO)
}

fn rtt_update(measured: Duration) -> Duration {
    (measured * 2).clamp(MIN_RTO, MAX_RTO)
}

/// `a` strictly before `b` in sequence space, wrap-aware.
fn seq_before(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < u32::MAX / 2
}

#[async_trait]
impl Link for Connection {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_data(data).await
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.recv_data().await
    }

    async fn close(&self) -> Result<()> {
        Connection::close(self).await
    }

    fn max_message_size(&self) -> usize {
        MAX_PAYLOAD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rto_backoff_clamps() {
        assert_eq!(rto_for(MIN_RTO, 0), MIN_RTO);
        assert_eq!(rto_for(MIN_RTO, 1), MIN_RTO * 2);
        assert_eq!(rto_for(MIN_RTO, 10), MAX_RTO);
        assert_eq!(rtt_update(Duration::from_millis(10)), MIN_RTO);
        assert_eq!(rtt_update(Duration::from_secs(30)), MAX_RTO);
    }

    #[test]
    fn sequence_ordering_wraps() {
        assert!(seq_before(0, 1));
        assert!(seq_before(u32::MAX, 0));
        assert!(!seq_before(1, 0));
        assert!(!seq_before(5, 5));
    }
}
