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

//! Relay rules shared by the client and server managers.
//!
//! Every message read from a link is written to every other link of the same
//! manager and then handed once to the sibling manager, which writes it to all
//! of its links. The two registry locks are never held at the same time.

use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::link::{Link, LinkHost};
use super::registry::{Delivery, Registry};
use crate::config::RelayConfig;
use crate::events::{EventBus, RelayEvent};
use crate::state::Role;
use crate::transport::{BoxStream, PeerId};

/// Registry plus relay wiring of one manager.
pub struct Hub {
    role: Role,
    registry: Registry,
    sibling: RwLock<Weak<Hub>>,
    events: EventBus,
    read_buffer_size: usize,
    evict_on_write_error: bool,
}

impl Hub {
    pub(crate) fn new(role: Role, events: EventBus, config: &RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            role,
            registry: Registry::new(),
            sibling: RwLock::new(Weak::new()),
            events,
            read_buffer_size: config.read_buffer_size,
            evict_on_write_error: config.evict_on_write_error,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    /// Make `sibling` the hub that receives everything this hub relays.
    pub(crate) fn set_sibling(&self, sibling: &Arc<Hub>) {
        *self.sibling.write() = Arc::downgrade(sibling);
    }

    /// Create a link for `stream`, register it and start its receive loop.
    pub(crate) async fn attach(
        &self,
        host: Weak<dyn LinkHost>,
        peer: PeerId,
        stream: BoxStream,
    ) -> Arc<Link> {
        let (link, reader) = Link::new(peer.clone(), self.role, stream);

        if self.registry.insert(Arc::clone(&link)).await.is_some() {
            info!("Replaced existing {} link to {}", self.role, peer);
        }
        self.events.emit(RelayEvent::Connected {
            peer,
            role: self.role,
        });

        link.spawn_receive_loop(reader, host, self.read_buffer_size);
        link
    }

    /// Remove a lost link. Returns false if it had already been displaced.
    pub(crate) async fn unregister(&self, link: &Arc<Link>) -> bool {
        let removed = self.registry.remove(link).await;
        if removed {
            self.events.emit(RelayEvent::Disconnected {
                peer: link.peer().clone(),
                role: self.role,
            });
        }
        removed
    }

    /// Cancel and remove `link` without reporting it as lost.
    pub(crate) async fn detach(&self, link: &Arc<Link>) {
        self.registry.remove(link).await;
        link.cancel();
    }

    /// Cancel and remove every link.
    ///
    /// Links are cancelled before the registry lock is taken, so a broadcast
    /// stuck writing to a peer that stopped reading cannot hold this up.
    pub(crate) async fn clear(&self) -> usize {
        self.registry.cancel_all();
        let links = self.registry.drain().await;
        for link in &links {
            link.cancel();
        }
        links.len()
    }

    /// Write `payload` to every link of this hub except `except`.
    pub async fn broadcast(&self, payload: &[u8], except: Option<&PeerId>) -> usize {
        let Delivery { delivered, failed } = self.registry.broadcast(payload, except).await;

        for link in failed {
            self.events.emit(RelayEvent::WriteFailed {
                peer: link.peer().clone(),
                role: self.role,
            });
            if self.evict_on_write_error {
                link.evict();
            }
        }
        delivered
    }

    /// Apply the relay rule to bytes read from `from`.
    pub(crate) async fn relay(&self, from: &Link, payload: &[u8]) {
        debug!(
            "read message from {} ({}): {}",
            from.peer(),
            self.role,
            String::from_utf8_lossy(payload)
        );
        self.events.emit(RelayEvent::MessageReceived {
            peer: from.peer().clone(),
            role: self.role,
            payload: payload.to_vec(),
        });

        let local = self.broadcast(payload, Some(from.peer())).await;

        let sibling = self.sibling.read().upgrade();
        let forwarded = match sibling {
            Some(sibling) => sibling.broadcast(payload, None).await,
            None => 0,
        };

        debug!(
            "Relayed {} bytes from {}: {} {} link(s), {} sibling link(s)",
            payload.len(),
            from.peer(),
            local,
            self.role,
            forwarded
        );
    }
}
