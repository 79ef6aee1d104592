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

//! Bluetooth relay module.
//!
//! Client and server managers for RFCOMM links, and the relay rules that
//! forward every received message to all other connected peers.

mod client;
mod link;
mod node;
mod registry;
mod relay;
mod server;

pub use client::ClientManager;
pub use link::Link;
pub use node::RelayNode;
pub use registry::{Delivery, Registry};
pub use relay::Hub;
pub use server::ServerManager;
