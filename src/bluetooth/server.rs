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

//! Server role: accepts peers on the secure and insecure services.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use super::link::{Link, LinkHost};
use super::relay::Hub;
use crate::config::RelayConfig;
use crate::events::{EventBus, RelayEvent};
use crate::state::{ConnectionState, Role};
use crate::transport::{Acceptor, BoxStream, PeerId, SocketMode, Transport};

/// Accept loop for one listening endpoint.
///
/// Runs until cancelled or until accept fails; it is never restarted on its
/// own.
struct InboundAcceptor {
    id: u64,
    mode: SocketMode,
    cancel_tx: oneshot::Sender<()>,
}

impl InboundAcceptor {
    fn spawn(
        shared: &Arc<ServerShared>,
        id: u64,
        mode: SocketMode,
        mut acceptor: Box<dyn Acceptor>,
    ) -> Self {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let shared = Arc::clone(shared);

        tokio::spawn(async move {
            info!("Socket Type: {} BEGIN accept loop", mode);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => {
                        debug!("Socket Type: {} accept loop stopped", mode);
                        break;
                    }
                    accepted = acceptor.accept() => match accepted {
                        Ok((peer, stream)) => shared.accepted(peer, stream, mode).await,
                        Err(e) => {
                            shared.acceptor_failed(id, mode, e);
                            break;
                        }
                    },
                }
            }
            info!("END accept loop, socket Type: {}", mode);
        });

        Self {
            id,
            mode,
            cancel_tx,
        }
    }

    fn cancel(self) {
        debug!("Socket Type {} cancel", self.mode);
        drop(self.cancel_tx);
    }
}

struct ServerInner {
    state: ConnectionState,
    secure: Option<InboundAcceptor>,
    insecure: Option<InboundAcceptor>,
    next_acceptor_id: u64,
    /// Bumped by `stop()`; admissions from an older epoch are discarded.
    epoch: u64,
}

impl ServerInner {
    fn slot(&mut self, mode: SocketMode) -> &mut Option<InboundAcceptor> {
        match mode {
            SocketMode::Secure => &mut self.secure,
            SocketMode::Insecure => &mut self.insecure,
        }
    }
}

struct ServerShared {
    transport: Arc<dyn Transport>,
    hub: Arc<Hub>,
    inner: Mutex<ServerInner>,
}

impl ServerShared {
    fn host(self: &Arc<Self>) -> Weak<dyn LinkHost> {
        let weak: Weak<ServerShared> = Arc::downgrade(self);
        weak
    }

    async fn accepted(self: &Arc<Self>, peer: PeerId, stream: BoxStream, mode: SocketMode) {
        info!("connected, device address: {} ({})", peer, mode);
        let epoch = self.inner.lock().epoch;

        let link = self.hub.attach(self.host(), peer, stream).await;

        let current = {
            let mut inner = self.inner.lock();
            let current = inner.epoch == epoch;
            if current {
                self.settle(&mut inner);
            }
            current
        };
        if !current {
            debug!("Server stopped while registering {}", link.peer());
            self.hub.detach(&link).await;
            let mut inner = self.inner.lock();
            self.settle(&mut inner);
        }
    }

    fn acceptor_failed(&self, id: u64, mode: SocketMode, e: io::Error) {
        let mut inner = self.inner.lock();
        let slot = inner.slot(mode);
        if slot.as_ref().map(|a| a.id) == Some(id) {
            error!("Socket Type: {} accept() failed: {}", mode, e);
            *slot = None;
            self.settle(&mut inner);
        } else {
            debug!("Socket Type: {} accept ended after stop: {}", mode, e);
        }
    }

    fn settle(&self, inner: &mut ServerInner) {
        let state = if !self.hub.registry().is_empty() {
            ConnectionState::Connected
        } else if inner.secure.is_some() || inner.insecure.is_some() {
            ConnectionState::Listening
        } else {
            ConnectionState::None
        };

        if state != inner.state {
            debug!("server state {} -> {}", inner.state, state);
            inner.state = state;
            self.hub.events().emit(RelayEvent::StateChanged {
                role: Role::Inbound,
                state,
            });
        }
    }
}

impl LinkHost for ServerShared {
    fn hub(&self) -> &Hub {
        &self.hub
    }

    fn link_lost(&self, link: &Link) {
        info!("Client disconnected: {}", link.peer());
        let mut inner = self.inner.lock();
        self.settle(&mut inner);
    }
}

/// Manager of the links peers opened to this device.
pub struct ServerManager {
    shared: Arc<ServerShared>,
}

impl ServerManager {
    pub fn new(transport: Arc<dyn Transport>, events: EventBus, config: &RelayConfig) -> Self {
        let shared = Arc::new(ServerShared {
            transport,
            hub: Hub::new(Role::Inbound, events, config),
            inner: Mutex::new(ServerInner {
                state: ConnectionState::None,
                secure: None,
                insecure: None,
                next_acceptor_id: 0,
                epoch: 0,
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

    /// Start an accept loop for each service that does not have one.
    ///
    /// Fails only when no service ends up listening.
    pub async fn start(&self) -> Result<()> {
        info!("server start via {}", self.shared.transport.name());

        let missing: Vec<SocketMode> = {
            let mut inner = self.shared.inner.lock();
            [SocketMode::Secure, SocketMode::Insecure]
                .into_iter()
                .filter(|mode| inner.slot(*mode).is_none())
                .collect()
        };

        let mut failures = Vec::new();
        for mode in missing {
            match self.shared.transport.listen(mode).await {
                Ok(acceptor) => {
                    let mut inner = self.shared.inner.lock();
                    if inner.slot(mode).is_none() {
                        inner.next_acceptor_id += 1;
                        let id = inner.next_acceptor_id;
                        *inner.slot(mode) =
                            Some(InboundAcceptor::spawn(&self.shared, id, mode, acceptor));
                    }
                }
                Err(e) => {
                    error!("Socket Type: {} listen() failed: {}", mode, e);
                    failures.push(format!("{}: {}", mode, e));
                }
            }
        }

        let mut inner = self.shared.inner.lock();
        self.shared.settle(&mut inner);
        if inner.secure.is_none() && inner.insecure.is_none() {
            return Err(anyhow!("no service listening ({})", failures.join("; ")));
        }
        Ok(())
    }

    /// Stop both accept loops and cancel every link.
    pub async fn stop(&self) {
        info!("server stop");
        let acceptors = {
            let mut inner = self.shared.inner.lock();
            inner.epoch += 1;
            [inner.secure.take(), inner.insecure.take()]
        };
        for acceptor in acceptors.into_iter().flatten() {
            acceptor.cancel();
        }

        let closed = self.shared.hub.clear().await;
        debug!("server closed {} link(s)", closed);

        let mut inner = self.shared.inner.lock();
        self.shared.settle(&mut inner);
    }

    /// Write `payload` to every link peers opened to us.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        self.shared.hub.broadcast(payload, None).await
    }

    /// Peers with a registered link.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.hub.registry().peers()
    }

    /// Whether the accept loop for `mode` is running.
    pub fn is_listening(&self, mode: SocketMode) -> bool {
        self.shared.inner.lock().slot(mode).is_some()
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        for acceptor in [inner.secure.take(), inner.insecure.take()].into_iter().flatten() {
            acceptor.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server(net: &MemoryNetwork, address: &str) -> ServerManager {
        ServerManager::new(
            Arc::new(net.transport(address)),
            EventBus::new(64),
            &RelayConfig::default(),
        )
    }

    async fn wait_peers(manager: &ServerManager, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.peers().len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_listens_on_both_services() {
        let net = MemoryNetwork::new();
        let manager = server(&net, "B");

        manager.start().await.unwrap();
        assert_eq!(manager.get_state(), ConnectionState::Listening);
        assert!(net.is_listening(&PeerId::from("B"), SocketMode::Secure));
        assert!(net.is_listening(&PeerId::from("B"), SocketMode::Insecure));

        // Idempotent: a second start binds nothing new.
        manager.start().await.unwrap();
        assert!(manager.is_listening(SocketMode::Secure));
    }

    #[tokio::test]
    async fn test_accepts_on_either_service() {
        let net = MemoryNetwork::new();
        let manager = server(&net, "B");
        manager.start().await.unwrap();

        let b = PeerId::from("B");
        let _a = net.transport("A").connect(&b, SocketMode::Secure).await.unwrap();
        let _c = net.transport("C").connect(&b, SocketMode::Insecure).await.unwrap();

        wait_peers(&manager, 2).await;
        assert_eq!(manager.peers(), vec![PeerId::from("A"), PeerId::from("C")]);
        assert_eq!(manager.get_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_old_link() {
        let net = MemoryNetwork::new();
        let manager = server(&net, "B");
        manager.start().await.unwrap();

        let b = PeerId::from("B");
        let a = net.transport("A");
        let mut first = a.connect(&b, SocketMode::Secure).await.unwrap();
        wait_peers(&manager, 1).await;
        let mut second = a.connect(&b, SocketMode::Insecure).await.unwrap();

        // The displaced link is closed, so its remote end reads EOF.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), first.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(manager.peers(), vec![PeerId::from("A")]);
        assert_eq!(manager.broadcast(b"x").await, 1);
        let mut buf = [0u8; 1];
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn test_client_disconnect_back_to_listening() {
        let net = MemoryNetwork::new();
        let manager = server(&net, "B");
        manager.start().await.unwrap();

        let mut a = net
            .transport("A")
            .connect(&PeerId::from("B"), SocketMode::Secure)
            .await
            .unwrap();
        wait_peers(&manager, 1).await;

        a.shutdown().await.unwrap();
        drop(a);
        wait_peers(&manager, 0).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while manager.get_state() != ConnectionState::Listening {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stop_twice_closes_listeners() {
        let net = MemoryNetwork::new();
        let manager = server(&net, "B");
        manager.start().await.unwrap();
        let _a = net
            .transport("A")
            .connect(&PeerId::from("B"), SocketMode::Secure)
            .await
            .unwrap();
        wait_peers(&manager, 1).await;

        manager.stop().await;
        assert_eq!(manager.get_state(), ConnectionState::None);
        assert!(manager.peers().is_empty());

        manager.stop().await;
        assert_eq!(manager.get_state(), ConnectionState::None);
        assert!(manager.peers().is_empty());

        tokio::time::timeout(Duration::from_secs(1), async {
            let b = PeerId::from("B");
            while net.is_listening(&b, SocketMode::Secure)
                || net.is_listening(&b, SocketMode::Insecure)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Restartable after stop.
        manager.start().await.unwrap();
        assert_eq!(manager.get_state(), ConnectionState::Listening);
    }

    #[tokio::test]
    async fn test_stop_unblocks_stalled_broadcast() {
        let net = MemoryNetwork::new();
        let manager = Arc::new(server(&net, "B"));
        manager.start().await.unwrap();

        // A connects and never reads.
        let _a = net
            .transport("A")
            .connect(&PeerId::from("B"), SocketMode::Secure)
            .await
            .unwrap();
        wait_peers(&manager, 1).await;

        let sending = Arc::clone(&manager);
        let stalled = tokio::spawn(async move { sending.broadcast(&vec![0u8; 256 * 1024]).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stalled.is_finished());

        tokio::time::timeout(Duration::from_secs(2), manager.stop())
            .await
            .unwrap();
        assert_eq!(stalled.await.unwrap(), 0);
        assert!(manager.peers().is_empty());
        assert_eq!(manager.get_state(), ConnectionState::None);
    }

    #[tokio::test]
    async fn test_admission_during_stop_is_discarded() {
        let net = MemoryNetwork::new();
        let manager = Arc::new(server(&net, "B"));
        manager.start().await.unwrap();
        let b = PeerId::from("B");

        let _a = net.transport("A").connect(&b, SocketMode::Secure).await.unwrap();
        wait_peers(&manager, 1).await;

        // The stalled write holds the registry while C's link waits to register.
        let sending = Arc::clone(&manager);
        let stalled = tokio::spawn(async move { sending.broadcast(&vec![0u8; 256 * 1024]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut c = net.transport("C").connect(&b, SocketMode::Insecure).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), manager.stop())
            .await
            .unwrap();
        assert_eq!(stalled.await.unwrap(), 0);

        // C's link is closed rather than registered.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), c.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.peers().is_empty());
        assert_eq!(manager.get_state(), ConnectionState::None);
    }
}
