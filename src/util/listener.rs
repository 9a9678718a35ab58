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
use crate::util::{CorrelationTable, Event};
use async_std::channel::Sender;
use async_std::task::block_on;
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

/// ICMP header plus the embedded original IPv4 header and the first 4 bytes of its UDP header.
const MIN_ICMP_LEN: usize = 32;

/// How long a read may block before the listener checks whether the run is over.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const BUFFER_SIZE: usize = 1500;

/// Raw ICMP receiver which turns "Time Exceeded" replies into [`Event`]s.
pub(crate) struct IcmpListener {
    socket: Socket,
    destination: Ipv4Addr,
    table: CorrelationTable,
}

impl IcmpListener {
    /// Opens the raw ICMP socket on `source`.
    #[instrument(skip(table), level = "debug")]
    pub(crate) fn bind(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        table: CorrelationTable,
    ) -> Result<Self> {
        let bind_error = |source_err| Error::ListenerBind {
            addr: source,
            source: source_err,
        };
        let socket =
            Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(bind_error)?;
        socket
            .bind(&SockAddr::from(SocketAddrV4::new(source, 0)))
            .map_err(bind_error)?;
        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(bind_error)?;
        Ok(IcmpListener {
            socket,
            destination,
            table,
        })
    }

    /// Reads packets until the event receiver goes away.
    ///
    /// Blocking; runs on its own thread.
    pub(crate) fn serve(self, events: Sender<Event>) {
        let mut buf = [0u8; BUFFER_SIZE];
        while !events.is_closed() {
            let len = match (&self.socket).read(&mut buf) {
                Ok(len) => len,
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => continue,
                    _ => {
                        warn!("error reading ICMP messages: {}", e);
                        continue;
                    }
                },
            };
            let received_at = Instant::now();
            if let Some(event) = self.handle_ipv4_packet(&buf[..len], received_at) {
                if block_on(events.send(event)).is_err() {
                    break;
                }
            }
        }
        debug!("ICMP listener stopped");
    }

    /// Strips the IPv4 header that raw sockets deliver and passes the ICMP message on.
    fn handle_ipv4_packet(&self, packet: &[u8], received_at: Instant) -> Option<Event> {
        let header = Ipv4Packet::new(packet)?;
        if header.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
            return None;
        }
        let icmp = packet.get(usize::from(header.get_header_length()) * 4..)?;
        self.handle_icmp_packet(header.get_source(), icmp, received_at)
    }

    /// Matches an ICMP message against the probes registered in the correlation table.
    fn handle_icmp_packet(
        &self,
        responder: Ipv4Addr,
        icmp: &[u8],
        received_at: Instant,
    ) -> Option<Event> {
        let id = embedded_probe_port(icmp, self.destination)?;
        let Some(record) = self.table.lookup(id) else {
            trace!(id, %responder, "dropping ICMP reply for unknown probe");
            return None;
        };
        Some(Event::TimeExceeded {
            id: record.id,
            ttl: record.ttl,
            responder,
            rtt: received_at.saturating_duration_since(record.sent_at),
        })
    }
}

/// Returns the destination port of the probe quoted in a "Time Exceeded" message, provided the
/// probe was sent to `destination`.
pub(crate) fn embedded_probe_port(icmp: &[u8], destination: Ipv4Addr) -> Option<u16> {
    if icmp.len() < MIN_ICMP_LEN {
        return None;
    }
    if IcmpPacket::new(icmp)?.get_icmp_type() != IcmpTypes::TimeExceeded {
        return None;
    }
    let time_exceeded = TimeExceededPacket::new(icmp)?;
    let original = time_exceeded.payload();
    let original_header = Ipv4Packet::new(original)?;
    if original_header.get_destination() != destination {
        return None;
    }
    // Only the source and destination ports of the quoted UDP header are guaranteed.
    let udp = original.get(usize::from(original_header.get_header_length()) * 4..)?;
    let port = udp.get(2..4)?;
    Some(u16::from_be_bytes([port[0], port[1]]))
}
