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

use crate::error::Error;
use crate::sequence::Terminal;
use crate::util::Event;
use crate::{Outcome, Responder, TracerouteHop};
use async_std::channel::{Receiver, Sender};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Collects probe outcomes into per-hop rows and releases them in TTL order.
#[derive(Debug)]
pub(crate) struct Aggregator {
    rows: Vec<TracerouteHop>,
    processed: HashSet<u16>,
    number_of_queries: usize,
    last_ttl: u8,
    emitted: u8,
}

impl Aggregator {
    pub(crate) fn new(max_hops: u8, number_of_queries: u8) -> Self {
        Aggregator {
            rows: (1..=max_hops).map(TracerouteHop::new).collect(),
            processed: HashSet::new(),
            number_of_queries: usize::from(number_of_queries),
            last_ttl: max_hops,
            emitted: 0,
        }
    }

    /// TTL at which the run stops: the max hop count, or the first hop the destination answered.
    pub(crate) fn last_ttl(&self) -> u8 {
        self.last_ttl
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.emitted >= self.last_ttl
    }

    /// Files one event and returns the rows that became ready to emit, lowest TTL first.
    pub(crate) fn process(&mut self, event: Event) -> Vec<TracerouteHop> {
        if self.is_finished() {
            trace!(?event, "run already finished");
            return Vec::new();
        }
        if !self.processed.insert(event.id()) {
            trace!(?event, "duplicate outcome");
            return Vec::new();
        }
        let ttl = event.ttl();
        let Some(row) = usize::from(ttl)
            .checked_sub(1)
            .and_then(|index| self.rows.get_mut(index))
        else {
            debug!(?event, "outcome for a TTL outside the run");
            return Vec::new();
        };
        match event {
            Event::NoResponse { .. } => row.push(Responder::None, Outcome::NoResponse),
            Event::Unreachable { responder, rtt, .. } => {
                row.push(Responder::Addr(responder), Outcome::Reply(rtt));
                if ttl < self.last_ttl {
                    debug!(ttl, "destination reached before max hops");
                    self.last_ttl = ttl;
                }
            }
            Event::TimeExceeded { responder, rtt, .. } => {
                row.push(Responder::Addr(responder), Outcome::Reply(rtt));
            }
        }
        self.release_complete_rows()
    }

    fn release_complete_rows(&mut self) -> Vec<TracerouteHop> {
        let mut ready = Vec::new();
        while !self.is_finished() {
            let row = &self.rows[usize::from(self.emitted)];
            if row.probe_count() != self.number_of_queries {
                break;
            }
            ready.push(row.clone());
            self.emitted += 1;
        }
        ready
    }

    /// Consumes `events` until the last row is out, then reports how the run ended.
    pub(crate) async fn run(
        mut self,
        events: Receiver<Event>,
        rows: Sender<TracerouteHop>,
        terminal: Sender<Terminal>,
    ) {
        while !self.is_finished() {
            let Ok(event) = events.recv().await else {
                break;
            };
            for hop in self.process(event) {
                if rows.send(hop).await.is_err() {
                    debug!("result sequence dropped, stopping aggregation");
                    events.close();
                    return;
                }
            }
        }
        // Stray probes still in flight fail their send instead of waiting on us.
        events.close();
        let signal = if self.is_finished() {
            Terminal::End
        } else {
            Terminal::Failed(Error::Incomplete(self.emitted, self.last_ttl()))
        };
        debug!(emitted = self.emitted, last_ttl = self.last_ttl(), "aggregation finished");
        let _ = terminal.send(signal).await;
    }
}
