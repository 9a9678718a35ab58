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

use crate::error::{Error, Result};
use crate::util::{CorrelationTable, Event, GatePermit};
use async_std::channel::Sender;
use async_std::future::{timeout, TimeoutError};
use async_std::net::UdpSocket;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::{instrument, trace, warn};

/// A single UDP probe: one connected socket, one empty datagram, one classified outcome.
pub(crate) struct Probe {
    socket: UdpSocket,
    id: u16,
    ttl: u8,
    destination: Ipv4Addr,
    _permit: GatePermit,
}

/// Settings shared by every probe of a run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProbeSettings {
    pub(crate) source: Ipv4Addr,
    pub(crate) destination: Ipv4Addr,
    pub(crate) timeout: Duration,
    pub(crate) errors_as_no_response: bool,
}

impl Probe {
    /// Opens a socket connected to `destination:id` with the outgoing TTL set to `ttl`.
    ///
    /// Failing to set the TTL is logged only; the probe still goes out.
    #[instrument(skip(settings, permit), level = "trace")]
    pub(crate) fn open(
        settings: &ProbeSettings,
        ttl: u8,
        id: u16,
        permit: GatePermit,
    ) -> Result<Self> {
        let target = SocketAddrV4::new(settings.destination, id);
        let setup_error = |source| Error::ProbeSocket {
            addr: target,
            source,
        };
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(setup_error)?;
        if let Err(e) = socket.set_ttl(u32::from(ttl)) {
            warn!(ttl, "couldn't assign TTL to socket: {}", e);
        }
        socket
            .bind(&SockAddr::from(SocketAddrV4::new(settings.source, 0)))
            .map_err(setup_error)?;
        socket
            .connect(&SockAddr::from(target))
            .map_err(setup_error)?;
        socket.set_nonblocking(true).map_err(setup_error)?;
        let socket = UdpSocket::from(std::net::UdpSocket::from(socket));
        Ok(Probe {
            socket,
            id,
            ttl,
            destination: settings.destination,
            _permit: permit,
        })
    }

    /// Registers the probe, sends it and reports the outcome on `events`.
    ///
    /// The socket and the gate slot are released when this returns.
    pub(crate) async fn run(
        self,
        settings: ProbeSettings,
        table: CorrelationTable,
        events: Sender<Event>,
    ) {
        let sent_at = Instant::now();
        table.register(self.id, self.ttl, sent_at);
        if let Err(e) = self.socket.send(&[]).await {
            // A refusal from an earlier datagram can surface here too.
            trace!(id = self.id, "send failed: {}", e);
        }
        let mut buf = [0u8; 1024];
        let received = timeout(settings.timeout, self.socket.recv(&mut buf)).await;
        let Some(event) =
            self.classify(received, sent_at.elapsed(), settings.errors_as_no_response)
        else {
            return;
        };
        // The aggregator may already be done; late outcomes are dropped.
        if events.send(event).await.is_err() {
            trace!(id = self.id, ttl = self.ttl, "run finished, discarding probe outcome");
        }
    }

    fn classify(
        &self,
        received: std::result::Result<io::Result<usize>, TimeoutError>,
        rtt: Duration,
        errors_as_no_response: bool,
    ) -> Option<Event> {
        let (id, ttl) = (self.id, self.ttl);
        match received {
            Err(_) => Some(Event::NoResponse { id, ttl }),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Some(Event::Unreachable {
                    id,
                    ttl,
                    responder: self.destination,
                    rtt,
                })
            }
            Ok(outcome) => {
                warn!(
                    id,
                    ttl, "expected error reading from unavailable socket, got {:?}", outcome
                );
                errors_as_no_response.then_some(Event::NoResponse { id, ttl })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Gate;
    use async_std::channel;

    const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

    fn settings(timeout: Duration) -> ProbeSettings {
        ProbeSettings {
            source: LOCALHOST,
            destination: LOCALHOST,
            timeout,
            errors_as_no_response: false,
        }
    }

    /// Reserves a local port which nobody listens on.
    fn closed_port() -> u16 {
        let socket = std::net::UdpSocket::bind((LOCALHOST, 0)).unwrap();
        socket.local_addr().unwrap().port()
    }

    async fn probe(settings: &ProbeSettings, ttl: u8, id: u16) -> Probe {
        let permit = Gate::new(1).acquire().await;
        Probe::open(settings, ttl, id, permit).unwrap()
    }

    #[async_std::test]
    async fn test_classify_timeout() {
        let settings = settings(Duration::from_secs(1));
        let probe = probe(&settings, 3, closed_port()).await;
        let event = probe.classify(Err(timeout_error().await), Duration::from_secs(1), false);
        assert_eq!(event, Some(Event::NoResponse { id: probe.id, ttl: 3 }));
    }

    #[async_std::test]
    async fn test_classify_connection_refused() {
        let settings = settings(Duration::from_secs(1));
        let probe = probe(&settings, 4, closed_port()).await;
        let refused = Ok(Err(io::Error::from(io::ErrorKind::ConnectionRefused)));
        let event = probe.classify(refused, Duration::from_millis(2), false);
        assert_eq!(
            event,
            Some(Event::Unreachable {
                id: probe.id,
                ttl: 4,
                responder: LOCALHOST,
                rtt: Duration::from_millis(2),
            })
        );
    }

    #[async_std::test]
    async fn test_classify_unexpected_outcome() {
        let settings = settings(Duration::from_secs(1));
        let probe = probe(&settings, 5, closed_port()).await;
        let denied = || Ok(Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert_eq!(probe.classify(denied(), Duration::ZERO, false), None);
        assert_eq!(probe.classify(Ok(Ok(0)), Duration::ZERO, false), None);
        assert_eq!(
            probe.classify(denied(), Duration::ZERO, true),
            Some(Event::NoResponse { id: probe.id, ttl: 5 })
        );
    }

    #[async_std::test]
    async fn test_closed_port_is_unreachable() {
        let settings = settings(Duration::from_secs(2));
        let port = closed_port();
        let (tx, rx) = channel::bounded(1);
        let table = CorrelationTable::new();
        probe(&settings, 64, port)
            .await
            .run(settings, table.clone(), tx)
            .await;
        assert!(matches!(
            rx.recv().await,
            Ok(Event::Unreachable { id, ttl: 64, responder, .. }) if id == port && responder == LOCALHOST
        ));
        assert_eq!(table.lookup(port).map(|record| record.ttl), Some(64));
    }

    #[async_std::test]
    async fn test_silent_port_times_out() {
        let settings = settings(Duration::from_millis(100));
        let silent = std::net::UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let port = silent.local_addr().unwrap().port();
        let (tx, rx) = channel::bounded(1);
        probe(&settings, 64, port)
            .await
            .run(settings, CorrelationTable::new(), tx)
            .await;
        assert_eq!(rx.recv().await, Ok(Event::NoResponse { id: port, ttl: 64 }));
    }

    #[async_std::test]
    async fn test_outcome_after_run_finished_is_dropped() {
        let settings = settings(Duration::from_millis(50));
        let silent = std::net::UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let port = silent.local_addr().unwrap().port();
        let (tx, rx) = channel::bounded(1);
        drop(rx);
        let run = probe(&settings, 1, port)
            .await
            .run(settings, CorrelationTable::new(), tx);
        assert!(timeout(Duration::from_secs(1), run).await.is_ok());
    }

    async fn timeout_error() -> TimeoutError {
        timeout(Duration::ZERO, futures::future::pending::<()>())
            .await
            .unwrap_err()
    }
}
