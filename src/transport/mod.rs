// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Socket transports the relay managers run on.
//!
//! The managers only ever see a [`Transport`]: something that can dial a peer
//! and something that can listen for peers. BlueZ RFCOMM is the production
//! backend; the in-memory backend drives tests and local simulations.

mod memory;
#[cfg(feature = "bluez")]
mod rfcomm;

use async_trait::async_trait;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

pub use memory::{MemoryNetwork, MemoryTransport};
#[cfg(feature = "bluez")]
pub use rfcomm::RfcommTransport;

/// Service UUID for secure (authenticated, encrypted) connections.
pub const SERVICE_UUID_SECURE: Uuid = Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66);

/// Service UUID for insecure connections.
pub const SERVICE_UUID_INSECURE: Uuid = Uuid::from_u128(0x8ce255c0_200a_11e0_ac64_0800200c9a66);

/// SDP record name for the secure service.
pub const SERVICE_NAME_SECURE: &str = "BluetoothChatSecure";

/// SDP record name for the insecure service.
pub const SERVICE_NAME_INSECURE: &str = "BluetoothChatInsecure";

/// Stable identifier of a remote device: its hardware address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeerId {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Socket security mode. Each mode is a distinct service on the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketMode {
    Secure,
    Insecure,
}

impl SocketMode {
    pub fn from_secure(secure: bool) -> Self {
        if secure {
            SocketMode::Secure
        } else {
            SocketMode::Insecure
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            SocketMode::Secure => SERVICE_UUID_SECURE,
            SocketMode::Insecure => SERVICE_UUID_INSECURE,
        }
    }

    pub fn service_name(&self) -> &'static str {
        match self {
            SocketMode::Secure => SERVICE_NAME_SECURE,
            SocketMode::Insecure => SERVICE_NAME_INSECURE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SocketMode::Secure => "Secure",
            SocketMode::Insecure => "Insecure",
        }
    }
}

impl fmt::Display for SocketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connected, bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Dials peers and opens listening endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish one outbound connection.
    ///
    /// Blocks until the connection succeeds or fails. Dropping the returned
    /// future abandons the attempt and closes the half-open socket.
    async fn connect(&self, peer: &PeerId, mode: SocketMode) -> io::Result<BoxStream>;

    /// Bind a listening endpoint for `mode`.
    async fn listen(&self, mode: SocketMode) -> io::Result<Box<dyn Acceptor>>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// A listening endpoint. Dropping it closes the endpoint.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> io::Result<(PeerId, BoxStream)>;
}
