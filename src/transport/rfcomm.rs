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

//! BlueZ RFCOMM transport.

use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, ReqError, Role, Stream};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use std::io;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Acceptor, BoxStream, PeerId, SocketMode, Transport};
use crate::config::BluetoothConfig;

/// RFCOMM transport on a local BlueZ adapter.
///
/// Both roles go through BlueZ profiles keyed by the mode's service UUID:
/// listening registers a server profile on the mode's channel, dialing asks
/// the remote device for the service and takes the socket from a client
/// profile.
pub struct RfcommTransport {
    session: Session,
    adapter: Adapter,
    secure_channel: u8,
    insecure_channel: u8,
    secure_client: Mutex<Option<ProfileHandle>>,
    insecure_client: Mutex<Option<ProfileHandle>>,
}

impl RfcommTransport {
    /// Open a BlueZ session and prepare the adapter.
    pub async fn new(config: &BluetoothConfig) -> Result<Self> {
        info!("Initializing RFCOMM transport...");

        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = match &config.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        adapter.set_discoverable(true).await?;
        adapter.set_pairable(true).await?;
        info!("Adapter is discoverable and pairable");

        Ok(Self {
            session,
            adapter,
            secure_channel: config.secure_channel,
            insecure_channel: config.insecure_channel,
            secure_client: Mutex::new(None),
            insecure_client: Mutex::new(None),
        })
    }

    /// Get the adapter address.
    pub async fn address(&self) -> Result<Address> {
        Ok(self.adapter.address().await?)
    }

    fn channel(&self, mode: SocketMode) -> u8 {
        match mode {
            SocketMode::Secure => self.secure_channel,
            SocketMode::Insecure => self.insecure_channel,
        }
    }

    fn client_slot(&self, mode: SocketMode) -> &Mutex<Option<ProfileHandle>> {
        match mode {
            SocketMode::Secure => &self.secure_client,
            SocketMode::Insecure => &self.insecure_client,
        }
    }
}

/// Profile advertising the mode's service on `channel`.
fn server_profile(mode: SocketMode, channel: u8) -> Profile {
    Profile {
        uuid: mode.uuid(),
        name: Some(mode.service_name().to_string()),
        role: Some(Role::Server),
        channel: Some(u16::from(channel)),
        require_authentication: Some(mode == SocketMode::Secure),
        require_authorization: Some(false),
        ..Default::default()
    }
}

/// Profile that receives outgoing connections to the mode's service,
/// wherever the remote advertises it.
fn client_profile(mode: SocketMode) -> Profile {
    Profile {
        uuid: mode.uuid(),
        name: Some(mode.service_name().to_string()),
        role: Some(Role::Client),
        require_authentication: Some(mode == SocketMode::Secure),
        require_authorization: Some(false),
        auto_connect: Some(false),
        ..Default::default()
    }
}

/// Wait for the connection BlueZ hands to the client profile for `address`
/// and accept it. Requests for other devices are leftovers of abandoned dials.
async fn admit(handle: &mut ProfileHandle, address: Address) -> io::Result<Stream> {
    while let Some(request) = handle.next().await {
        if request.device() != address {
            debug!("Rejecting stale RFCOMM connection from {}", request.device());
            request.reject(ReqError::Rejected);
            continue;
        }
        return request.accept().map_err(io::Error::other);
    }
    Err(io::Error::new(
        io::ErrorKind::NotConnected,
        "client profile unregistered",
    ))
}

#[async_trait]
impl Transport for RfcommTransport {
    async fn connect(&self, peer: &PeerId, mode: SocketMode) -> io::Result<BoxStream> {
        let address: Address = peer.as_str().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid Bluetooth address: {}", peer),
            )
        })?;
        let device = self.adapter.device(address).map_err(io::Error::other)?;
        let uuid = mode.uuid();

        // One dial per mode at a time: the profile's request stream is shared.
        let mut slot = self.client_slot(mode).lock().await;
        if slot.is_none() {
            let handle = self
                .session
                .register_profile(client_profile(mode))
                .await
                .map_err(io::Error::other)?;
            debug!("{} client profile registered", mode.service_name());
            *slot = Some(handle);
        }
        let handle = slot
            .as_mut()
            .ok_or_else(|| io::Error::other("client profile missing"))?;

        debug!("RFCOMM dial {} service {} ({})", address, uuid, mode);
        let (_, stream) = tokio::try_join!(
            async { device.connect_profile(&uuid).await.map_err(io::Error::other) },
            admit(handle, address),
        )?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, mode: SocketMode) -> io::Result<Box<dyn Acceptor>> {
        let handle = self
            .session
            .register_profile(server_profile(mode, self.channel(mode)))
            .await
            .map_err(io::Error::other)?;
        info!(
            "{} service registered (UUID: {}, channel {})",
            mode.service_name(),
            mode.uuid(),
            self.channel(mode)
        );

        Ok(Box::new(ProfileAcceptor { handle }))
    }

    fn name(&self) -> &'static str {
        "rfcomm"
    }
}

/// Admits connect requests delivered to a registered profile.
struct ProfileAcceptor {
    handle: ProfileHandle,
}

#[async_trait]
impl Acceptor for ProfileAcceptor {
    async fn accept(&mut self) -> io::Result<(PeerId, BoxStream)> {
        let request = self.handle.next().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "profile unregistered")
        })?;

        let peer = PeerId::new(request.device().to_string());
        let stream = request.accept().map_err(io::Error::other)?;
        Ok((peer, Box::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SERVICE_UUID_INSECURE, SERVICE_UUID_SECURE};

    #[test]
    fn test_client_profile_dials_by_service_uuid() {
        let secure = client_profile(SocketMode::Secure);
        assert_eq!(secure.uuid, SERVICE_UUID_SECURE);
        assert!(matches!(secure.role, Some(Role::Client)));
        assert_eq!(secure.channel, None);
        assert_eq!(secure.require_authentication, Some(true));

        let insecure = client_profile(SocketMode::Insecure);
        assert_eq!(insecure.uuid, SERVICE_UUID_INSECURE);
        assert_eq!(insecure.require_authentication, Some(false));
    }

    #[test]
    fn test_server_profile_advertises_on_channel() {
        let profile = server_profile(SocketMode::Insecure, 4);
        assert_eq!(profile.uuid, SERVICE_UUID_INSECURE);
        assert!(matches!(profile.role, Some(Role::Server)));
        assert_eq!(profile.channel, Some(4));
        assert_eq!(profile.name.as_deref(), Some(SocketMode::Insecure.service_name()));
    }
}
