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

/// Main result type used throughout the codebase.
pub type Result<T> = std::result::Result<T, Error>;

/// General error type used throughout the codebase.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    // ==============
    // Crypto errors
    // ==============
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Signature verification failed")]
    SignatureVerifyFailed,

    #[error("AEAD record replayed")]
    RecordReplayed,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // ====================
    // Authentication errors
    // ====================
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Peer fingerprint mismatch")]
    FingerprintMismatch,

    // ================
    // Protocol errors
    // ================
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Record sequence out of window")]
    SequenceOutOfWindow,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    // ===============
    // Network errors
    // ===============
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Hole punch failed")]
    HolePunchFailed,

    #[error("Transport failed: {0}")]
    TransportFailed(String),

    #[error("Relay rejected request: {0}")]
    RelayRejected(String),

    #[error("Circuit failed: {0}")]
    CircuitFailed(String),

    #[error("Timeout elapsed")]
    TimedOut,

    // ===============
    // Lookup errors
    // ===============
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("DHT value not found")]
    ValueNotFound,

    // ===============
    // Storage errors
    // ===============
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================
    // Task lifecycle errors
    // ========================
    #[error("Detached task stopped")]
    DetachedTaskStopped,

    #[error("Node stopped")]
    NodeStopped,

    #[error("Channel stopped")]
    ChannelStopped,

    // ===============
    // Wrapped errors
    // ===============
    #[error("io error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.kind())
    }
}

impl From<smol::channel::RecvError> for Error {
    fn from(_err: smol::channel::RecvError) -> Self {
        Self::ChannelStopped
    }
}

impl<T> From<smol::channel::SendError<T>> for Error {
    fn from(_err: smol::channel::SendError<T>) -> Self {
        Self::ChannelStopped
    }
}
