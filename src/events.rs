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

//! Relay events and their processing.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::state::{ConnectionState, Role};
use crate::transport::PeerId;

/// Events emitted by the relay managers.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// A manager's coarse state changed.
    StateChanged { role: Role, state: ConnectionState },
    /// A link was established and registered.
    Connected { peer: PeerId, role: Role },
    /// An outbound dial failed.
    ConnectFailed { peer: PeerId, reason: String },
    /// A link went away (read failure or remote close).
    Disconnected { peer: PeerId, role: Role },
    /// Bytes arrived on a link.
    MessageReceived {
        peer: PeerId,
        role: Role,
        payload: Vec<u8>,
    },
    /// A write to a link failed.
    WriteFailed { peer: PeerId, role: Role },
}

/// Fan-out channel both managers publish on.
///
/// Publishing never blocks and never fails: events sent while nobody is
/// subscribed are dropped, slow subscribers observe `Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

/// Logs relay events for the daemon.
pub struct EventLogger {
    messages: u64,
}

impl EventLogger {
    pub fn new() -> Self {
        Self { messages: 0 }
    }

    /// Process a single event.
    pub fn process_event(&mut self, event: &RelayEvent) {
        match event {
            RelayEvent::StateChanged { role, state } => {
                info!("{} manager state: {}", role, state);
            }
            RelayEvent::Connected { peer, role } => {
                info!("Peer connected ({}): {}", role, peer);
            }
            RelayEvent::ConnectFailed { peer, reason } => {
                warn!("Unable to connect {}: {}", peer, reason);
            }
            RelayEvent::Disconnected { peer, role } => {
                info!("Peer disconnected ({}): {}", role, peer);
            }
            RelayEvent::MessageReceived {
                peer,
                role,
                payload,
            } => {
                self.messages += 1;
                debug!(
                    "Message from {} ({}): {}",
                    peer,
                    role,
                    String::from_utf8_lossy(payload)
                );
            }
            RelayEvent::WriteFailed { peer, role } => {
                warn!("Write to {} ({}) failed", peer, role);
            }
        }
    }

    /// Drain `rx` until the channel closes.
    pub async fn run(mut self, mut rx: broadcast::Receiver<RelayEvent>) -> u64 {
        loop {
            match rx.recv().await {
                Ok(event) => self.process_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        self.messages
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new()
    }
}
