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

//! RFCOMM relay mesh.
//!
//! A device runs a client manager that dials peers and a server manager that
//! accepts them. Anything received on one link is written to every other
//! link, across both roles, so a handful of point-to-point connections act as
//! one shared channel.

pub mod bluetooth;
pub mod config;
pub mod events;
pub mod state;
pub mod transport;

pub use bluetooth::{ClientManager, RelayNode, ServerManager};
pub use config::Config;
pub use events::RelayEvent;
pub use state::ConnectionState;
pub use transport::{PeerId, SocketMode, Transport};
