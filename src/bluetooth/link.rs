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

//! A single established connection and its receive loop.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::relay::Hub;
use crate::state::{LinkState, Role};
use crate::transport::{BoxStream, PeerId};

/// Why a link stopped being open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// The owning manager shut it down (stop, replacement).
    Cancelled,
    /// The connection failed underneath us or was evicted after a failed write.
    Lost,
}

/// Owner of a link's registry entry, told when the link dies on its own.
pub(crate) trait LinkHost: Send + Sync + 'static {
    fn hub(&self) -> &Hub;

    /// Called once the lost link has been removed from the registry.
    fn link_lost(&self, link: &Link);
}

/// One live connection to a remote peer.
pub struct Link {
    peer: PeerId,
    role: Role,
    closed: Mutex<Option<CloseReason>>,
    closed_tx: watch::Sender<bool>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxStream>>>,
}

impl Link {
    /// Wrap a freshly connected stream. The returned read half belongs to the
    /// receive loop.
    pub(crate) fn new(peer: PeerId, role: Role, stream: BoxStream) -> (Arc<Self>, ReadHalf<BoxStream>) {
        debug!("Creating {} link to {}", role, peer);
        let (reader, writer) = tokio::io::split(stream);
        let (closed_tx, _) = watch::channel(false);

        let link = Arc::new(Self {
            peer,
            role,
            closed: Mutex::new(None),
            closed_tx,
            writer: tokio::sync::Mutex::new(Some(writer)),
        });
        (link, reader)
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> LinkState {
        if self.closed.lock().is_some() {
            LinkState::Closed
        } else {
            LinkState::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Close the link. Safe to call any number of times; unblocks a pending
    /// read or write.
    pub fn cancel(&self) {
        if self.close(CloseReason::Cancelled) {
            debug!("Link to {} cancelled", self.peer);
        }
    }

    /// Close the link as if the connection had failed, so the receive loop
    /// unregisters it and reports the loss.
    pub(crate) fn evict(&self) {
        if self.close(CloseReason::Lost) {
            info!("Evicting link to {} after failed write", self.peer);
        }
    }

    fn close(&self, reason: CloseReason) -> bool {
        let mut closed = self.closed.lock();
        if closed.is_some() {
            return false;
        }
        *closed = Some(reason);
        self.closed_tx.send_replace(true);
        true
    }

    fn close_reason(&self) -> Option<CloseReason> {
        *self.closed.lock()
    }

    /// Write `payload` to the peer.
    ///
    /// Failures are logged and reported as `false`; the link stays registered.
    pub async fn write(&self, payload: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }

        let mut closed_rx = self.closed_tx.subscribe();
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        let result = tokio::select! {
            result = async {
                writer.write_all(payload).await?;
                writer.flush().await
            } => result,
            _ = wait_closed(&mut closed_rx) => {
                return false;
            }
        };

        match result {
            Ok(()) => {
                debug!("Wrote {} bytes to {}", payload.len(), self.peer);
                true
            }
            Err(e) => {
                warn!("Exception during write to {}: {}", self.peer, e);
                false
            }
        }
    }

    /// Start the receive loop on its own task.
    pub(crate) fn spawn_receive_loop(
        self: &Arc<Self>,
        reader: ReadHalf<BoxStream>,
        host: Weak<dyn LinkHost>,
        buffer_size: usize,
    ) -> JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move { link.receive_loop(reader, host, buffer_size).await })
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxStream>,
        host: Weak<dyn LinkHost>,
        buffer_size: usize,
    ) {
        info!("BEGIN receive loop for {} ({})", self.peer, self.role);
        let mut buffer = vec![0u8; buffer_size.max(1)];
        let mut closed_rx = self.closed_tx.subscribe();

        loop {
            let read = tokio::select! {
                biased;
                _ = wait_closed(&mut closed_rx) => break,
                read = reader.read(&mut buffer) => read,
            };

            match read {
                Ok(0) => {
                    info!("Connection to {} closed by remote", self.peer);
                    break;
                }
                Ok(n) => {
                    let Some(host) = host.upgrade() else {
                        debug!("Manager for {} is gone", self.peer);
                        break;
                    };
                    host.hub().relay(&self, &buffer[..n]).await;
                }
                Err(e) => {
                    warn!("Link to {} disconnected: {}", self.peer, e);
                    break;
                }
            }
        }

        self.close(CloseReason::Lost);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        drop(reader);

        if self.close_reason() == Some(CloseReason::Lost) {
            if let Some(host) = host.upgrade() {
                if host.hub().unregister(&self).await {
                    host.link_lost(&self);
                }
            }
        }
        info!("END receive loop for {}", self.peer);
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}
