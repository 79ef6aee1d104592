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

//! Client role: dials peers one at a time and relays over the links it made.
//!
//! Outgoing RFCOMM connects block and radios cannot reliably dial several
//! peers in parallel, so a multi-device request is a queue walked one dial at
//! a time. Each dial advances the queue whether it succeeds or fails.

use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::link::{Link, LinkHost};
use super::relay::Hub;
use crate::config::RelayConfig;
use crate::events::{EventBus, RelayEvent};
use crate::state::{ConnectionState, Role};
use crate::transport::{BoxStream, PeerId, SocketMode, Transport};

/// One in-flight outbound connection attempt.
///
/// Dropping or cancelling it abandons the dial and closes its socket. A dial
/// that completes after being superseded is discarded by the manager.
struct OutboundConnector {
    id: u64,
    peer: PeerId,
    mode: SocketMode,
    cancel_tx: oneshot::Sender<()>,
}

impl OutboundConnector {
    fn spawn(shared: &Arc<ClientShared>, id: u64, peer: PeerId, mode: SocketMode) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let shared = Arc::clone(shared);
        let target = peer.clone();

        tokio::spawn(async move {
            info!("BEGIN dial {} to {} ({})", id, target, mode);
            let address = target.clone();
            tokio::select! {
                biased;
                _ = cancel_rx => {
                    debug!("Dial {} to {} cancelled", id, target);
                }
                result = shared.transport.connect(&address, mode) => match result {
                    Ok(stream) => shared.connect_succeeded(id, target, stream).await,
                    Err(e) => shared.connect_failed(id, target, e),
                },
            }
        });

        Self {
            id,
            peer,
            mode,
            cancel_tx,
        }
    }

    fn cancel(self) {
        debug!("Cancelling dial {} to {} ({})", self.id, self.peer, self.mode);
        drop(self.cancel_tx);
    }
}

struct ClientInner {
    state: ConnectionState,
    dial: Option<OutboundConnector>,
    next_dial_id: u64,
    /// Bumped by `stop()`; completions from an older epoch are discarded.
    epoch: u64,
    queue: Vec<PeerId>,
    /// Index of the next queue entry to dial.
    cursor: usize,
    queue_mode: SocketMode,
}

struct ClientShared {
    transport: Arc<dyn Transport>,
    hub: Arc<Hub>,
    mode: SocketMode,
    inner: Mutex<ClientInner>,
}

impl ClientShared {
    fn host(self: &Arc<Self>) -> Weak<dyn LinkHost> {
        let weak: Weak<ClientShared> = Arc::downgrade(self);
        weak
    }

    /// Replace any in-flight dial with a new one to `peer`.
    fn dial(self: &Arc<Self>, inner: &mut ClientInner, peer: PeerId, mode: SocketMode) {
        info!("connect to: {} ({})", peer, mode);
        if let Some(previous) = inner.dial.take() {
            previous.cancel();
        }

        inner.next_dial_id += 1;
        let id = inner.next_dial_id;
        inner.dial = Some(OutboundConnector::spawn(self, id, peer, mode));
        self.settle(inner);
    }

    /// Dial the next queued peer, if any remain.
    fn dial_next(self: &Arc<Self>, inner: &mut ClientInner) {
        if inner.cursor < inner.queue.len() {
            let peer = inner.queue[inner.cursor].clone();
            inner.cursor += 1;
            let mode = inner.queue_mode;
            self.dial(inner, peer, mode);
        } else {
            self.settle(inner);
        }
    }

    /// Whether `id` is the dial currently in flight; clears it if so.
    fn finish_dial(inner: &mut ClientInner, id: u64) -> bool {
        if inner.dial.as_ref().map(|dial| dial.id) == Some(id) {
            inner.dial = None;
            true
        } else {
            false
        }
    }

    async fn connect_succeeded(self: &Arc<Self>, id: u64, peer: PeerId, stream: BoxStream) {
        let epoch = {
            let mut inner = self.inner.lock();
            if !Self::finish_dial(&mut inner, id) {
                debug!("Dropping late connection to {} from superseded dial {}", peer, id);
                return;
            }
            inner.epoch
        };

        info!("connected to {}", peer);
        let link = self.hub.attach(self.host(), peer, stream).await;

        let current = {
            let mut inner = self.inner.lock();
            let current = inner.epoch == epoch;
            if current {
                self.dial_next(&mut inner);
            }
            current
        };
        if !current {
            debug!("Client stopped while registering {}", link.peer());
            self.hub.detach(&link).await;
            let mut inner = self.inner.lock();
            self.settle(&mut inner);
        }
    }

    fn connect_failed(self: &Arc<Self>, id: u64, peer: PeerId, e: io::Error) {
        let mut inner = self.inner.lock();
        if !Self::finish_dial(&mut inner, id) {
            debug!("Ignoring failure of superseded dial {} to {}", id, peer);
            return;
        }

        error!("Unable to connect device {}: {}", peer, e);
        self.hub.events().emit(RelayEvent::ConnectFailed {
            peer,
            reason: e.to_string(),
        });
        self.dial_next(&mut inner);
    }

    /// Recompute the coarse state from what is actually running.
    fn settle(&self, inner: &mut ClientInner) {
        let state = if inner.dial.is_some() {
            ConnectionState::Connecting
        } else if !self.hub.registry().is_empty() {
            ConnectionState::Connected
        } else {
            ConnectionState::None
        };

        if state != inner.state {
            debug!("client state {} -> {}", inner.state, state);
            inner.state = state;
            self.hub.events().emit(RelayEvent::StateChanged {
                role: Role::Outbound,
                state,
            });
        }
    }
}

impl LinkHost for ClientShared {
    fn hub(&self) -> &Hub {
        &self.hub
    }

    fn link_lost(&self, link: &Link) {
        error!("Device connection was lost: {}", link.peer());
        let mut inner = self.inner.lock();
        self.settle(&mut inner);
    }
}

/// Manager of the links this device dialed.
pub struct ClientManager {
    shared: Arc<ClientShared>,
}

impl ClientManager {
    /// Create a client manager dialing in `mode` by default.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: EventBus,
        config: &RelayConfig,
        mode: SocketMode,
    ) -> Self {
        let shared = Arc::new(ClientShared {
            transport,
            hub: Hub::new(Role::Outbound, events, config),
            mode,
            inner: Mutex::new(ClientInner {
                state: ConnectionState::None,
                dial: None,
                next_dial_id: 0,
                epoch: 0,
                queue: Vec::new(),
                cursor: 0,
                queue_mode: mode,
            }),
        });
        Self { shared }
    }

    pub(crate) fn hub(&self) -> &Arc<Hub> {
        &self.shared.hub
    }

    pub fn get_state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Abandon any in-flight dial. Existing links are left alone.
    pub fn start(&self) {
        info!("client start");
        let mut inner = self.shared.inner.lock();
        if let Some(dial) = inner.dial.take() {
            dial.cancel();
        }
        self.shared.settle(&mut inner);
    }

    /// Dial `peer`, replacing any dial already in flight.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, peer: impl Into<PeerId>, secure: bool) {
        let mut inner = self.shared.inner.lock();
        self.shared
            .dial(&mut inner, peer.into(), SocketMode::from_secure(secure));
    }

    /// Dial `peers` one after another in the default mode, replacing any
    /// earlier batch.
    pub fn connect_many<I, P>(&self, peers: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        let mut inner = self.shared.inner.lock();
        inner.queue = peers.into_iter().map(Into::into).collect();
        inner.cursor = 0;
        inner.queue_mode = self.shared.mode;
        info!("connecting {} device(s)", inner.queue.len());

        if !inner.queue.is_empty() {
            self.shared.dial_next(&mut inner);
        }
    }

    /// Cancel the in-flight dial and every link.
    pub async fn stop(&self) {
        info!("client stop");
        let dial = {
            let mut inner = self.shared.inner.lock();
            inner.epoch += 1;
            inner.queue.clear();
            inner.cursor = 0;
            inner.dial.take()
        };
        if let Some(dial) = dial {
            dial.cancel();
        }

        let closed = self.shared.hub.clear().await;
        debug!("client closed {} link(s)", closed);

        let mut inner = self.shared.inner.lock();
        self.shared.settle(&mut inner);
    }

    /// Write `payload` to every link this manager dialed.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        self.shared.hub.broadcast(payload, None).await
    }

    /// Peers with a registered link.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.hub.registry().peers()
    }

    /// Peer of the dial in flight, if any.
    pub fn pending_dial(&self) -> Option<PeerId> {
        self.shared.inner.lock().dial.as_ref().map(|d| d.peer.clone())
    }

    /// Queued peers not yet dialed.
    pub fn queued(&self) -> Vec<PeerId> {
        let inner = self.shared.inner.lock();
        inner.queue[inner.cursor.min(inner.queue.len())..].to_vec()
    }
}

impl Drop for ClientManager {
    fn drop(&mut self) {
        if let Some(dial) = self.shared.inner.lock().dial.take() {
            warn!("client manager dropped with a dial in flight");
            dial.cancel();
        }
    }
}
