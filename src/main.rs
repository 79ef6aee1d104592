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

//! RFCOMM relay daemon

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use rfcomm_relay::events::EventLogger;
use rfcomm_relay::transport::RfcommTransport;
use rfcomm_relay::{Config, RelayNode};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; the configured level is applied once the config is read.
    let (filter, filter_handle) = reload::Layer::new(log_filter("info")?);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting rfcomm-relay v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    filter_handle.reload(log_filter(&config.logging.level)?)?;
    info!("Configuration loaded from {}", Config::default_path().display());

    let transport = RfcommTransport::new(&config.bluetooth).await?;
    info!("Local adapter: {}", transport.address().await?);

    let node = RelayNode::new(Arc::new(transport), &config);
    let logger = tokio::spawn(EventLogger::new().run(node.subscribe()));

    node.resume().await?;
    if config.relay.peers.is_empty() {
        info!("No peers configured, waiting for inbound connections");
    } else {
        node.connect_many(config.relay.peers.iter().map(String::as_str));
    }

    info!("Ready.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    node.shutdown().await;
    drop(node);

    match tokio::time::timeout(Duration::from_secs(2), logger).await {
        Ok(Ok(messages)) => info!("Relayed {} message(s)", messages),
        Ok(Err(e)) => warn!("Event logger failed: {}", e),
        Err(_) => warn!("Event logger did not finish"),
    }
    Ok(())
}

fn log_filter(level: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::from_default_env().add_directive(format!("rfcomm_relay={}", level).parse()?))
}
