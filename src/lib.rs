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

//! # paratrace
//! `paratrace` is a parallel UDP traceroute for IPv4.
//!
//! ## Features
//! Probes for many hops are in flight at the same time. Each probe is an empty UDP datagram sent
//! from its own connected socket with a fixed TTL and a destination port unique to the run.
//! A single raw ICMP socket picks up "Time Exceeded" replies from routers and matches them to
//! probes by the quoted destination port, while the destination itself is detected through the
//! "connection refused" error its port-unreachable reply raises on the probe socket.
//! Results are handed out hop by hop, strictly in TTL order, as soon as every probe of a hop
//! has an outcome.
//!
//! The library allows to configure the following parameters:
//! - Base destination port
//! - Number of probes per hop
//! - Timeout per probe (in _ms_)
//! - Maximum number of hops
//! - Source address
//! - Number of probes in flight
//!
//! Listening on a raw ICMP socket requires root (or `CAP_NET_RAW` on Linux).
//!
//! ## Example
//!
//! ```rust,no_run
//! use paratrace::{Config, Traceroute};
//! use std::net::Ipv4Addr;
//!
//! fn main() -> paratrace::Result<()> {
//!     let destination_ip = Ipv4Addr::new(93, 184, 216, 34);  // example.com
//!
//!     let traceroute = Traceroute::new(destination_ip, Config::default()
//!         .with_max_hops(20)
//!         .with_number_of_queries(2)
//!         .with_timeout(1000)
//!         .with_parallelism(8));
//!
//!     for hop in traceroute.assemble()? {
//!         let hop = hop?;
//!         print!("{}", hop.ttl);
//!         for (responder, outcomes) in &hop.responses_per_ip {
//!             print!(" \t{}", responder);
//!             for outcome in outcomes {
//!                 print!(" {}", outcome);
//!             }
//!         }
//!         println!();
//!     }
//!     Ok(())
//! }
//! ```

mod aggregator;
mod error;
/// Console and JSON renderings of a finished or running traceroute
pub mod output;
mod sequence;
mod util;

pub use crate::error::{Error, Result};
pub use crate::sequence::ResultSequence;

use crate::aggregator::Aggregator;
use crate::sequence::Terminal;
use crate::util::listener::IcmpListener;
use crate::util::probe::{Probe, ProbeSettings};
use crate::util::{CorrelationTable, Event, Gate, PortSequence};
use async_std::channel::{self, Receiver, Sender};
use async_std::task;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;
use tracing::{debug, instrument};

/// Most probes a single hop may use.
pub const MAX_QUERIES_PER_HOP: u8 = 10;

/// Traceroute instance containing destination address and configurations
#[derive(Debug, Clone)]
pub struct Traceroute {
    addr: Ipv4Addr,
    config: Config,
}

/// Traceroute configurations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    port: u16,
    max_hops: u8,
    number_of_queries: u8,
    timeout: Duration,
    source: Ipv4Addr,
    parallelism: usize,
    errors_as_no_response: bool,
}

/// All outcomes of the probes sent with one TTL, grouped by the address that answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TracerouteHop {
    /// Time-To-Live the probes were sent with
    pub ttl: u8,
    /// Probe outcomes per responder, in arrival order
    pub responses_per_ip: BTreeMap<Responder, Vec<Outcome>>,
}

/// Who answered a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Responder {
    /// A router on the path, or the destination itself
    Addr(Ipv4Addr),
    /// Nobody answered in time
    None,
}

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Answered after the given round-trip time
    Reply(Duration),
    /// No answer before the timeout
    NoResponse,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 33434,
            max_hops: 30,
            number_of_queries: 3,
            timeout: Duration::from_secs(5),
            source: Ipv4Addr::UNSPECIFIED,
            parallelism: 16,
            errors_as_no_response: false,
        }
    }
}

impl Config {
    /// Builder: Base destination port. Incremented for every probe of the run
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder: Maximum number of hops
    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Builder: Number of queries to run per hop
    pub fn with_number_of_queries(mut self, number_of_queries: u8) -> Self {
        self.number_of_queries = number_of_queries;
        self
    }

    /// Builder: Timeout per query in milliseconds
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Duration::from_millis(timeout);
        self
    }

    /// Builder: Address that probes are sent from and ICMP replies are received on
    pub fn with_source(mut self, source: Ipv4Addr) -> Self {
        self.source = source;
        self
    }

    /// Builder: Maximum number of probes waiting for an outcome at the same time
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Builder: Count probes whose socket fails in an unexpected way as unanswered.
    ///
    /// Off by default, in which case such probes are only logged and their hop can never
    /// complete.
    pub fn with_errors_as_no_response(mut self, errors_as_no_response: bool) -> Self {
        self.errors_as_no_response = errors_as_no_response;
        self
    }

    /// Checks the parameters against each other.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::BadConfig(
                "destination port must be a positive integer".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(Error::BadConfig(
                "parallelism must be a positive integer".to_string(),
            ));
        }
        if self.number_of_queries == 0 {
            return Err(Error::BadConfig(
                "number of probes must be a positive integer".to_string(),
            ));
        }
        if self.number_of_queries > MAX_QUERIES_PER_HOP {
            return Err(Error::BadConfig(format!(
                "number of probes cannot be more than {}",
                MAX_QUERIES_PER_HOP
            )));
        }
        if self.max_hops == 0 {
            return Err(Error::BadConfig(
                "max hops must be a positive integer".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::BadConfig("timeout must be positive".to_string()));
        }
        PortSequence::new(self.port, self.probe_count()).map(|_| ())
    }

    fn probe_count(&self) -> usize {
        usize::from(self.max_hops) * usize::from(self.number_of_queries)
    }
}

impl TracerouteHop {
    pub(crate) fn new(ttl: u8) -> Self {
        TracerouteHop {
            ttl,
            responses_per_ip: BTreeMap::new(),
        }
    }

    pub(crate) fn push(&mut self, responder: Responder, outcome: Outcome) {
        self.responses_per_ip
            .entry(responder)
            .or_default()
            .push(outcome);
    }

    /// Number of probe outcomes recorded for this hop
    pub fn probe_count(&self) -> usize {
        self.responses_per_ip.values().map(Vec::len).sum()
    }

    /// Addresses that answered probes of this hop
    pub fn responders(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.responses_per_ip.keys().filter_map(|responder| match responder {
            Responder::Addr(addr) => Some(*addr),
            Responder::None => None,
        })
    }
}

impl Display for Responder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Responder::Addr(addr) => write!(f, "{}", addr),
            Responder::None => write!(f, "None"),
        }
    }
}

impl Serialize for Responder {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Reply(rtt) => write!(f, "{:.1?}", rtt),
            Outcome::NoResponse => write!(f, "*"),
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Traceroute {
    /// Creates new instance of Traceroute
    pub fn new(addr: Ipv4Addr, config: Config) -> Self {
        Traceroute { addr, config }
    }

    /// Starts the trace in the background and returns its hops as they complete.
    ///
    /// Configuration errors are returned here, before anything is sent. Failing to open the ICMP
    /// listener or a probe socket ends the run and is the last item of the sequence.
    #[instrument(skip(self), fields(destination = %self.addr), level = "debug")]
    pub fn assemble(&self) -> Result<ResultSequence> {
        self.config.validate()?;
        debug!(config = ?self.config);
        let (row_tx, row_rx) = channel::unbounded();
        let (terminal_tx, terminal_rx) = channel::bounded(2);
        task::spawn(self.clone().dispatch(row_tx, terminal_tx));
        Ok(ResultSequence::new(row_rx, terminal_rx))
    }

    /// Returns a vector of traceroute hops, stopping at the first error
    pub fn perform_traceroute(&self) -> Result<Vec<TracerouteHop>> {
        self.assemble()?.collect()
    }

    /// Runs the whole trace: listener, aggregator, then every probe of the run.
    async fn dispatch(self, rows: Sender<TracerouteHop>, terminal: Sender<Terminal>) {
        let table = CorrelationTable::new();
        let (event_tx, event_rx) = channel::bounded(self.config.parallelism + 1);
        let launched = match self.start(&table, &event_tx, event_rx, rows, terminal.clone()) {
            Ok(()) => self.send_probes(&table, &event_tx).await,
            Err(e) => Err(e),
        };
        if let Err(e) = launched {
            debug!("trace aborted: {}", e);
            let _ = terminal.send(Terminal::Failed(e)).await;
            // Lets the listener thread and the aggregator wind down.
            event_tx.close();
        }
    }

    fn start(
        &self,
        table: &CorrelationTable,
        events: &Sender<Event>,
        event_rx: Receiver<Event>,
        rows: Sender<TracerouteHop>,
        terminal: Sender<Terminal>,
    ) -> Result<()> {
        let listener = IcmpListener::bind(self.config.source, self.addr, table.clone())?;
        let listener_events = events.clone();
        thread::Builder::new()
            .name("icmp-listener".to_string())
            .spawn(move || listener.serve(listener_events))
            .map_err(Error::ListenerSpawn)?;
        let aggregator = Aggregator::new(self.config.max_hops, self.config.number_of_queries);
        task::spawn(aggregator.run(event_rx, rows, terminal));
        Ok(())
    }

    /// Launches probes in TTL order, waiting only for a free slot between them.
    async fn send_probes(&self, table: &CorrelationTable, events: &Sender<Event>) -> Result<()> {
        let config = &self.config;
        let settings = ProbeSettings {
            source: config.source,
            destination: self.addr,
            timeout: config.timeout,
            errors_as_no_response: config.errors_as_no_response,
        };
        let gate = Gate::new(config.parallelism);
        let mut ports = PortSequence::new(config.port, config.probe_count())?;
        for ttl in 1..=config.max_hops {
            for _ in 0..config.number_of_queries {
                let permit = gate.acquire().await;
                if events.is_closed() {
                    debug!(ttl, "trace finished, no more probes");
                    return Ok(());
                }
                let probe = Probe::open(&settings, ttl, ports.next_port()?, permit)?;
                task::spawn(probe.run(settings, table.clone(), events.clone()));
            }
        }
        debug!("all probes launched");
        Ok(())
    }
}
