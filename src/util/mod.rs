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

pub(crate) mod listener;
pub(crate) mod probe;

use crate::error::{Error, Result};
use async_std::channel::{self, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Classified outcome of a single probe, as delivered to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// A router on the path reported that the probe's TTL expired.
    TimeExceeded {
        id: u16,
        ttl: u8,
        responder: Ipv4Addr,
        rtt: Duration,
    },
    /// The destination refused the probe, so the path ends at this TTL.
    Unreachable {
        id: u16,
        ttl: u8,
        responder: Ipv4Addr,
        rtt: Duration,
    },
    /// Nothing arrived before the probe timed out.
    NoResponse { id: u16, ttl: u8 },
}

impl Event {
    /// Correlation identity (probe destination port) of the probe this event belongs to.
    pub fn id(&self) -> u16 {
        match *self {
            Event::TimeExceeded { id, .. }
            | Event::Unreachable { id, .. }
            | Event::NoResponse { id, .. } => id,
        }
    }

    /// TTL the probe was sent with.
    pub fn ttl(&self) -> u8 {
        match *self {
            Event::TimeExceeded { ttl, .. }
            | Event::Unreachable { ttl, .. }
            | Event::NoResponse { ttl, .. } => ttl,
        }
    }
}

/// Generator of probe identities.
///
/// Every probe of a run gets its own destination port, counting up from the configured base
/// port. The sequence is sized up front and refuses to wrap past the end of the port space.
#[derive(Debug)]
pub(crate) struct PortSequence {
    next: u16,
    remaining: usize,
}

impl PortSequence {
    /// Reserves `count` consecutive ports starting at `base`.
    pub(crate) fn new(base: u16, count: usize) -> Result<Self> {
        let available = usize::from(u16::MAX - base);
        if count > available {
            return Err(Error::BadConfig(format!(
                "{} probes do not fit in the {} ports above {}",
                count, available, base
            )));
        }
        Ok(PortSequence {
            next: base,
            remaining: count,
        })
    }

    /// Hands out the next port, or fails once the reserved range is used up.
    pub(crate) fn next_port(&mut self) -> Result<u16> {
        if self.remaining == 0 {
            return Err(Error::PortsExhausted(self.next.saturating_sub(1)));
        }
        let port = self.next;
        self.remaining -= 1;
        self.next = self.next.saturating_add(1);
        Ok(port)
    }
}

/// What the sender remembers about a probe so the listener can match the ICMP reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProbeRecord {
    pub(crate) id: u16,
    pub(crate) ttl: u8,
    pub(crate) sent_at: Instant,
}

/// Probe records keyed by destination port, shared by probe tasks and the ICMP listener.
#[derive(Debug, Clone, Default)]
pub(crate) struct CorrelationTable {
    records: Arc<RwLock<HashMap<u16, ProbeRecord>>>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: u16, ttl: u8, sent_at: Instant) {
        self.records
            .write()
            .insert(id, ProbeRecord { id, ttl, sent_at });
    }

    pub(crate) fn lookup(&self, id: u16) -> Option<ProbeRecord> {
        self.records.read().get(&id).copied()
    }
}

/// Bounds the number of probe sockets open at the same time.
///
/// Each slot is a token in a bounded channel: acquiring pushes a token, dropping the permit
/// pulls one back out.
#[derive(Debug, Clone)]
pub(crate) struct Gate {
    slots: Sender<()>,
    release: Receiver<()>,
}

/// An acquired gate slot. Released on drop.
#[derive(Debug)]
pub(crate) struct GatePermit {
    release: Receiver<()>,
}

impl Gate {
    pub(crate) fn new(size: usize) -> Self {
        let (slots, release) = channel::bounded(size.max(1));
        Gate { slots, release }
    }

    /// Waits until a slot is free.
    pub(crate) async fn acquire(&self) -> GatePermit {
        // Both ends live in `self`, so the channel can never be closed here.
        let _ = self.slots.send(()).await;
        GatePermit {
            release: self.release.clone(),
        }
    }

    #[cfg(test)]
    fn in_use(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let _ = self.release.try_recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_sequence_counts_up_from_base() {
        let mut ports = PortSequence::new(33434, 3).unwrap();
        assert_eq!(ports.next_port().unwrap(), 33434);
        assert_eq!(ports.next_port().unwrap(), 33435);
        assert_eq!(ports.next_port().unwrap(), 33436);
        assert!(matches!(ports.next_port(), Err(Error::PortsExhausted(33436))));
    }

    #[test]
    fn test_port_sequence_rejects_oversized_run() {
        assert!(PortSequence::new(65000, 535).is_ok());
        assert!(matches!(
            PortSequence::new(65000, 536),
            Err(Error::BadConfig(_))
        ));
    }

    #[test]
    fn test_port_sequence_up_to_last_port() {
        let mut ports = PortSequence::new(65534, 1).unwrap();
        assert_eq!(ports.next_port().unwrap(), 65534);
        assert!(ports.next_port().is_err());
    }

    #[test]
    fn test_correlation_table_lookup() {
        let table = CorrelationTable::new();
        let sent_at = Instant::now();
        table.register(33434, 1, sent_at);
        assert_eq!(
            table.lookup(33434),
            Some(ProbeRecord {
                id: 33434,
                ttl: 1,
                sent_at
            })
        );
        assert_eq!(table.lookup(33435), None);
    }

    #[test]
    fn test_correlation_table_overwrites() {
        let table = CorrelationTable::new();
        let clone = table.clone();
        table.register(40000, 1, Instant::now());
        clone.register(40000, 7, Instant::now());
        assert_eq!(table.lookup(40000).map(|record| record.ttl), Some(7));
    }

    #[test]
    fn test_event_accessors() {
        let event = Event::TimeExceeded {
            id: 5,
            ttl: 2,
            responder: Ipv4Addr::new(10, 0, 0, 1),
            rtt: Duration::from_millis(3),
        };
        assert_eq!((event.id(), event.ttl()), (5, 2));
        let event = Event::NoResponse { id: 6, ttl: 3 };
        assert_eq!((event.id(), event.ttl()), (6, 3));
    }

    #[async_std::test]
    async fn test_gate_releases_on_drop() {
        let gate = Gate::new(2);
        let first = gate.acquire().await;
        let second = gate.acquire().await;
        assert_eq!(gate.in_use(), 2);
        drop(first);
        assert_eq!(gate.in_use(), 1);
        let _third = gate.acquire().await;
        assert_eq!(gate.in_use(), 2);
        drop(second);
        assert_eq!(gate.in_use(), 1);
    }

    #[async_std::test]
    async fn test_gate_blocks_when_full() {
        let gate = Gate::new(1);
        let permit = gate.acquire().await;
        let blocked = async_std::future::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(blocked.is_err());
        drop(permit);
        let admitted = async_std::future::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(admitted.is_ok());
    }
}
