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

//! Per-manager table of live links.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::link::Link;
use crate::transport::PeerId;

/// Result of writing one payload to every link in a registry.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Links the payload was written to.
    pub delivered: usize,
    /// Open links whose write failed.
    pub failed: Vec<Arc<Link>>,
}

/// Links of one manager, keyed by peer.
///
/// Insert, remove and broadcast all run under the same lock, so a broadcast
/// never observes a half-removed link. A copy of the table is kept behind a
/// plain mutex so links can be cancelled and counted while a broadcast holds
/// the lock.
#[derive(Default)]
pub struct Registry {
    links: Mutex<HashMap<PeerId, Arc<Link>>>,
    live: parking_lot::Mutex<HashMap<PeerId, Arc<Link>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `link`, cancelling any link it displaces for the same peer.
    pub async fn insert(&self, link: Arc<Link>) -> Option<Arc<Link>> {
        let mut links = self.links.lock().await;
        let displaced = links.insert(link.peer().clone(), link);
        if let Some(old) = &displaced {
            debug!("Displacing existing link to {}", old.peer());
            old.cancel();
        }
        self.live.lock().clone_from(&*links);
        displaced
    }

    /// Remove `link`, but only if it is still the registered link for its peer.
    pub async fn remove(&self, link: &Arc<Link>) -> bool {
        let mut links = self.links.lock().await;
        let registered = links
            .get(link.peer())
            .map(|current| Arc::ptr_eq(current, link))
            .unwrap_or(false);
        if registered {
            links.remove(link.peer());
            self.live.lock().remove(link.peer());
        }
        registered
    }

    /// Remove and return every link.
    pub async fn drain(&self) -> Vec<Arc<Link>> {
        let mut links = self.links.lock().await;
        let drained = links.drain().map(|(_, link)| link).collect();
        self.live.lock().clear();
        drained
    }

    /// Cancel every registered link without waiting for the lock, unblocking
    /// any write a broadcast is stuck in. Links stay registered.
    pub fn cancel_all(&self) -> usize {
        let live = self.live.lock();
        for link in live.values() {
            link.cancel();
        }
        live.len()
    }

    /// Write `payload` to every open link except the one for `except`.
    pub async fn broadcast(&self, payload: &[u8], except: Option<&PeerId>) -> Delivery {
        let links = self.links.lock().await;
        let mut delivery = Delivery::default();

        for (peer, link) in links.iter() {
            if Some(peer) == except || !link.is_open() {
                continue;
            }
            if link.write(payload).await {
                delivery.delivered += 1;
            } else if link.is_open() {
                delivery.failed.push(Arc::clone(link));
            }
        }

        delivery
    }

    /// Registered peers, sorted. Does not wait for a running broadcast.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.live.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Number of registered links, readable without the lock.
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Role;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn link(peer: &str) -> (Arc<Link>, DuplexStream) {
        let (near, far) = tokio::io::duplex(1024);
        let (link, _reader) = Link::new(PeerId::from(peer), Role::Inbound, Box::new(near));
        (link, far)
    }

    #[tokio::test]
    async fn test_insert_replaces_and_cancels() {
        let registry = Registry::new();
        let (first, _far1) = link("A");
        let (second, _far2) = link("A");

        assert!(registry.insert(Arc::clone(&first)).await.is_none());
        let displaced = registry.insert(Arc::clone(&second)).await.unwrap();

        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_ignores_displaced_link() {
        let registry = Registry::new();
        let (first, _far1) = link("A");
        let (second, _far2) = link("A");
        registry.insert(Arc::clone(&first)).await;
        registry.insert(Arc::clone(&second)).await;

        assert!(!registry.remove(&first).await);
        assert_eq!(registry.peers(), vec![PeerId::from("A")]);
        assert!(registry.remove(&second).await);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_closed() {
        let registry = Registry::new();
        let (a, mut far_a) = link("A");
        let (b, mut far_b) = link("B");
        let (c, _far_c) = link("C");
        registry.insert(a).await;
        registry.insert(b).await;
        registry.insert(Arc::clone(&c)).await;
        c.cancel();

        let delivery = registry.broadcast(b"hi", Some(&PeerId::from("A"))).await;
        assert_eq!(delivery.delivered, 1);
        assert!(delivery.failed.is_empty());

        let mut buf = [0u8; 2];
        far_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        drop(registry);
        let mut rest = Vec::new();
        far_a.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reports_failed_writes() {
        let registry = Registry::new();
        let (a, far_a) = link("A");
        registry.insert(a).await;
        drop(far_a);

        let delivery = registry.broadcast(b"hi", None).await;
        assert_eq!(delivery.delivered, 0);
        assert_eq!(delivery.failed.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_empties() {
        let registry = Registry::new();
        let (a, _far_a) = link("A");
        let (b, _far_b) = link("B");
        registry.insert(a).await;
        registry.insert(b).await;

        assert_eq!(registry.drain().await.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_unblocks_stalled_broadcast() {
        let registry = Arc::new(Registry::new());
        // Peer never reads: a write larger than the pipe blocks.
        let (near, _far) = tokio::io::duplex(16);
        let (stalled, _reader) = Link::new(PeerId::from("A"), Role::Inbound, Box::new(near));
        registry.insert(Arc::clone(&stalled)).await;

        let sending = Arc::clone(&registry);
        let broadcast =
            tokio::spawn(async move { sending.broadcast(&[0u8; 4096], None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!broadcast.is_finished());

        assert_eq!(registry.peers(), vec![PeerId::from("A")]);
        assert_eq!(registry.cancel_all(), 1);
        let delivery = tokio::time::timeout(Duration::from_secs(1), broadcast)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.delivered, 0);
        assert!(delivery.failed.is_empty());

        let drained = tokio::time::timeout(Duration::from_secs(1), registry.drain())
            .await
            .unwrap();
        assert_eq!(drained.len(), 1);
        assert!(!stalled.is_open());
    }
}
