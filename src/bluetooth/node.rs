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

//! One device's pair of managers, wired to relay into each other.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::client::ClientManager;
use super::server::ServerManager;
use crate::config::Config;
use crate::events::{EventBus, RelayEvent};
use crate::transport::{PeerId, SocketMode, Transport};

/// A relay node: a client manager and a server manager sharing one transport,
/// each forwarding what it receives to the other.
pub struct RelayNode {
    client: ClientManager,
    server: ServerManager,
    events: EventBus,
}

impl RelayNode {
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> Self {
        let events = EventBus::new(config.relay.event_capacity);
        let client = ClientManager::new(
            Arc::clone(&transport),
            events.clone(),
            &config.relay,
            SocketMode::from_secure(config.bluetooth.secure),
        );
        let server = ServerManager::new(transport, events.clone(), &config.relay);

        client.hub().set_sibling(server.hub());
        server.hub().set_sibling(client.hub());

        Self {
            client,
            server,
            events,
        }
    }

    pub fn client(&self) -> &ClientManager {
        &self.client
    }

    pub fn server(&self) -> &ServerManager {
        &self.server
    }

    /// Events from both managers.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Start whichever manager is idle.
    pub async fn resume(&self) -> Result<()> {
        if self.client.get_state().is_idle() {
            self.client.start();
        }
        if self.server.get_state().is_idle() {
            self.server.start().await?;
        }
        Ok(())
    }

    /// Dial `peers` one at a time.
    pub fn connect_many<I, P>(&self, peers: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        self.client.connect_many(peers);
    }

    /// Send a locally originated message to every connected peer, whichever
    /// role connected it. Returns the number of links written.
    pub async fn send(&self, payload: &[u8]) -> usize {
        let outbound = self.client.broadcast(payload).await;
        let inbound = self.server.broadcast(payload).await;
        info!(
            "Sent {} bytes to {} outbound and {} inbound peer(s)",
            payload.len(),
            outbound,
            inbound
        );
        outbound + inbound
    }

    /// Stop both managers.
    pub async fn shutdown(&self) {
        self.client.stop().await;
        self.server.stop().await;
    }
}
