/*
   Copyright 2020 Ilya Grishkov

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// A traceroute result.
pub type Result<T> = std::result::Result<T, Error>;

/// A traceroute error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid config: {0}")]
    BadConfig(String),
    #[error("unable to listen for ICMP on {addr}: {source}")]
    ListenerBind {
        addr: Ipv4Addr,
        #[source]
        source: io::Error,
    },
    #[error("unable to start ICMP listener: {0}")]
    ListenerSpawn(#[source] io::Error),
    #[error("unable to open probe socket to {addr}: {source}")]
    ProbeSocket {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
    #[error("probe port range exhausted after port {0}")]
    PortsExhausted(u16),
    #[error("aggregator stopped after {0} of {1} hops")]
    Incomplete(u8, u8),
}
