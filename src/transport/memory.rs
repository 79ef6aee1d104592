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

//! In-process transport over `tokio::io::duplex` pipes.
//!
//! Every node on a [`MemoryNetwork`] has an address; listeners register under
//! `(address, mode)` and dialers are handed one end of a fresh pipe while the
//! listener receives the other.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Acceptor, BoxStream, PeerId, SocketMode, Transport};

/// Pipe capacity per direction.
const PIPE_CAPACITY: usize = 64 * 1024;

type Admission = (PeerId, DuplexStream);

struct Registration {
    id: u64,
    tx: mpsc::UnboundedSender<Admission>,
}

#[derive(Default)]
struct NetworkInner {
    listeners: Mutex<HashMap<(PeerId, SocketMode), Registration>>,
    stalled: Mutex<HashSet<PeerId>>,
    next_listener_id: AtomicU64,
    dials_in_flight: AtomicUsize,
    dial_attempts: AtomicUsize,
}

/// Shared medium all [`MemoryTransport`]s of a simulation dial through.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport for the node at `address`.
    pub fn transport(&self, address: impl Into<PeerId>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: address.into(),
        }
    }

    /// Make dials to `peer` hang until cancelled, like an unresponsive radio.
    pub fn stall(&self, peer: impl Into<PeerId>) {
        self.inner.stalled.lock().insert(peer.into());
    }

    /// Number of dials currently blocked inside `connect`.
    pub fn dials_in_flight(&self) -> usize {
        self.inner.dials_in_flight.load(Ordering::SeqCst)
    }

    /// Total number of dials ever started on this network.
    pub fn dial_attempts(&self) -> usize {
        self.inner.dial_attempts.load(Ordering::SeqCst)
    }

    /// Whether something is listening at `peer` in `mode`.
    pub fn is_listening(&self, peer: &PeerId, mode: SocketMode) -> bool {
        self.inner
            .listeners
            .lock()
            .get(&(peer.clone(), mode))
            .map(|r| !r.tx.is_closed())
            .unwrap_or(false)
    }
}

/// Decrements the in-flight counter however the dial ends.
struct DialGuard<'a>(&'a AtomicUsize);

impl<'a> DialGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, peer: &PeerId, mode: SocketMode) -> io::Result<BoxStream> {
        let inner = &self.network.inner;
        inner.dial_attempts.fetch_add(1, Ordering::SeqCst);
        let _guard = DialGuard::enter(&inner.dials_in_flight);

        // Yield so a dial is always observable as in flight for a moment.
        tokio::task::yield_now().await;

        let stalled = inner.stalled.lock().contains(peer);
        if stalled {
            debug!("Dial {} -> {} stalled", self.local, peer);
            futures::future::pending::<()>().await;
        }

        let tx = inner
            .listeners
            .lock()
            .get(&(peer.clone(), mode))
            .map(|r| r.tx.clone())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no {} listener at {}", mode, peer),
                )
            })?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send((self.local.clone(), far)).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} listener at {} closed", mode, peer),
            )
        })?;

        debug!("Dial {} -> {} ({}) established", self.local, peer, mode);
        Ok(Box::new(near))
    }

    async fn listen(&self, mode: SocketMode) -> io::Result<Box<dyn Acceptor>> {
        let inner = &self.network.inner;
        let key = (self.local.clone(), mode);
        let mut listeners = inner.listeners.lock();

        if listeners.get(&key).map(|r| !r.tx.is_closed()).unwrap_or(false) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} already listening at {}", mode, self.local),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        listeners.insert(key.clone(), Registration { id, tx });

        Ok(Box::new(MemoryAcceptor {
            network: self.network.clone(),
            key,
            id,
            rx,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryAcceptor {
    network: MemoryNetwork,
    key: (PeerId, SocketMode),
    id: u64,
    rx: mpsc::UnboundedReceiver<Admission>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&mut self) -> io::Result<(PeerId, BoxStream)> {
        match self.rx.recv().await {
            Some((peer, stream)) => Ok((peer, Box::new(stream))),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            )),
        }
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        let mut listeners = self.network.inner.listeners.lock();
        if listeners.get(&self.key).map(|r| r.id) == Some(self.id) {
            listeners.remove(&self.key);
        }
    }
}
