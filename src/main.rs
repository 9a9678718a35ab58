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

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use paratrace::output::{ConsoleFormatter, Formatter, JsonFormatter, SystemLookup};
use paratrace::{Config, Traceroute};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tracing_subscriber::EnvFilter;

/// Parallel UDP traceroute
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Host name or IPv4 address to trace
    host: String,

    /// Destination UDP port of the first probe
    #[arg(short = 'p', default_value_t = 33434)]
    port: u16,

    /// Number of probes for one hop
    #[arg(short = 'q', default_value_t = 3)]
    queries: u8,

    /// Probe timeout in milliseconds
    #[arg(short = 'w', default_value_t = 5000)]
    timeout: u64,

    /// Number of simultaneous probes
    #[arg(short = 'n', default_value_t = 16)]
    parallelism: usize,

    /// Max TTL
    #[arg(short = 'm', default_value_t = 30)]
    max_hops: u8,

    /// Source IPv4 address
    #[arg(short = 's', default_value_t = Ipv4Addr::UNSPECIFIED)]
    source: Ipv4Addr,

    /// Print the result as JSON
    #[arg(short = 'j')]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let destination = resolve(&args.host)?;
    let config = Config::default()
        .with_port(args.port)
        .with_number_of_queries(args.queries)
        .with_timeout(args.timeout)
        .with_parallelism(args.parallelism)
        .with_max_hops(args.max_hops)
        .with_source(args.source);
    config
        .validate()
        .context("invalid command-line arguments provided")?;

    let hops = Traceroute::new(destination, config).assemble()?;
    let mut stdout = io::stdout().lock();
    if args.json {
        JsonFormatter.format(hops, &mut stdout)?;
    } else {
        ConsoleFormatter::new(SystemLookup).format(hops, &mut stdout)?;
    }
    Ok(())
}

/// First IPv4 address of `host`.
fn resolve(host: &str) -> Result<Ipv4Addr> {
    if let Ok(addr) = host.parse() {
        return Ok(addr);
    }
    dns_lookup::lookup_host(host)
        .with_context(|| format!("cannot resolve address {}", host))?
        .into_iter()
        .find_map(|addr| match addr {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("no IPv4 address found for {}", host))
}
