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

use crate::{Responder, Result, TracerouteHop};
use serde::Serialize;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Failure while rendering a trace.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("error executing traceroute: {0}")]
    Trace(#[from] crate::Error),
    #[error("unable to write output: {0}")]
    Io(#[from] io::Error),
    #[error("unable to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Renders hops as they come out of a [`crate::ResultSequence`].
pub trait Formatter {
    /// Writes every hop of `hops` to `out`, returning the trace error that ended it, if any.
    fn format<I, W>(&self, hops: I, out: &mut W) -> std::result::Result<(), FormatError>
    where
        I: IntoIterator<Item = Result<TracerouteHop>>,
        W: Write;
}

/// Reverse DNS used for console output.
pub trait ReverseLookup {
    /// Host name of `addr`, if it has one.
    fn hostname(&self, addr: Ipv4Addr) -> Option<String>;
}

/// [`ReverseLookup`] through the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

impl ReverseLookup for SystemLookup {
    fn hostname(&self, addr: Ipv4Addr) -> Option<String> {
        dns_lookup::lookup_addr(&IpAddr::V4(addr)).ok()
    }
}

/// One line per hop: TTL, then every responder as `host (addr)` followed by its outcomes.
#[derive(Debug, Default, Clone)]
pub struct ConsoleFormatter<L = SystemLookup> {
    lookup: L,
}

impl<L: ReverseLookup> ConsoleFormatter<L> {
    pub fn new(lookup: L) -> Self {
        ConsoleFormatter { lookup }
    }

    fn render(&self, hop: &TracerouteHop) -> String {
        let mut line = format!(" {}  ", hop.ttl);
        for (responder, outcomes) in &hop.responses_per_ip {
            if let Responder::Addr(addr) = responder {
                let host = self
                    .lookup
                    .hostname(*addr)
                    .map(|host| host.trim_end_matches('.').to_string())
                    .filter(|host| !host.is_empty())
                    .unwrap_or_else(|| addr.to_string());
                line.push_str(&format!("{} ({}) ", host, addr));
            }
            let outcomes: Vec<String> = outcomes.iter().map(ToString::to_string).collect();
            line.push_str(&outcomes.join(" "));
            line.push_str("  ");
        }
        line
    }
}

impl<L: ReverseLookup> Formatter for ConsoleFormatter<L> {
    fn format<I, W>(&self, hops: I, out: &mut W) -> std::result::Result<(), FormatError>
    where
        I: IntoIterator<Item = Result<TracerouteHop>>,
        W: Write,
    {
        for hop in hops {
            writeln!(out, "{}", self.render(&hop?))?;
        }
        Ok(())
    }
}

/// Collects every hop and writes a single `{"data": [...]}` document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

#[derive(Serialize)]
struct Report<'a> {
    data: &'a [TracerouteHop],
}

impl Formatter for JsonFormatter {
    fn format<I, W>(&self, hops: I, out: &mut W) -> std::result::Result<(), FormatError>
    where
        I: IntoIterator<Item = Result<TracerouteHop>>,
        W: Write,
    {
        let data = hops.into_iter().collect::<Result<Vec<_>>>()?;
        serde_json::to_writer(&mut *out, &Report { data: &data })?;
        writeln!(out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Outcome};
    use std::time::Duration;

    const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    struct FixedLookup;

    impl ReverseLookup for FixedLookup {
        fn hostname(&self, addr: Ipv4Addr) -> Option<String> {
            (addr == ROUTER).then(|| "gateway.lan.".to_string())
        }
    }

    fn hops() -> Vec<Result<TracerouteHop>> {
        let mut first = TracerouteHop::new(1);
        first.push(
            Responder::Addr(ROUTER),
            Outcome::Reply(Duration::from_micros(1_500)),
        );
        first.push(Responder::None, Outcome::NoResponse);
        let mut second = TracerouteHop::new(2);
        second.push(
            Responder::Addr(Ipv4Addr::new(10, 0, 0, 2)),
            Outcome::Reply(Duration::from_micros(3_200)),
        );
        second.push(
            Responder::Addr(Ipv4Addr::new(10, 0, 0, 2)),
            Outcome::Reply(Duration::from_micros(3_300)),
        );
        vec![Ok(first), Ok(second)]
    }

    fn render<F: Formatter>(formatter: F, hops: Vec<Result<TracerouteHop>>) -> (String, bool) {
        let mut out = Vec::new();
        let result = formatter.format(hops, &mut out);
        (String::from_utf8(out).unwrap(), result.is_ok())
    }

    #[test]
    fn test_console_output() {
        let (text, ok) = render(ConsoleFormatter::new(FixedLookup), hops());
        assert!(ok);
        assert_eq!(
            text,
            " 1  gateway.lan (10.0.0.1) 1.5ms  *  \n 2  10.0.0.2 (10.0.0.2) 3.2ms 3.3ms  \n"
        );
    }

    #[test]
    fn test_json_output() {
        let (text, ok) = render(JsonFormatter, hops());
        assert!(ok);
        assert_eq!(
            text,
            concat!(
                r#"{"data":[{"ttl":1,"responses_per_ip":{"10.0.0.1":["1.5ms"],"None":["*"]}},"#,
                r#"{"ttl":2,"responses_per_ip":{"10.0.0.2":["3.2ms","3.3ms"]}}]}"#,
                "\n"
            )
        );
    }

    #[test]
    fn test_console_stops_at_error() {
        let mut hops = hops();
        hops.insert(1, Err(Error::Incomplete(1, 2)));
        let mut out = Vec::new();
        let result = ConsoleFormatter::new(FixedLookup).format(hops, &mut out);
        assert!(matches!(
            result,
            Err(FormatError::Trace(Error::Incomplete(1, 2)))
        ));
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_json_reports_error_without_output() {
        let mut hops = hops();
        hops.push(Err(Error::Incomplete(2, 3)));
        let mut out = Vec::new();
        let result = JsonFormatter.format(hops, &mut out);
        assert!(matches!(result, Err(FormatError::Trace(_))));
        assert!(out.is_empty());
    }
}
