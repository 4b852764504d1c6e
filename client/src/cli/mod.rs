use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address the SOCKS5 listeners bind to
    #[arg(short, long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Port of the 1-hop listener; hop h uses port + h - 1. 0 picks free ports
    #[arg(short = 'p', long, default_value_t = 0)]
    pub socks_port: u16,

    /// Number of hop counts to serve, one listener each
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=5))]
    pub max_hops: u8,

    /// Seconds between circuit ownership checks
    #[arg(long, default_value_t = 30)]
    pub check_interval: u64,

    /// Seconds allowed for one request over a TCP flow
    #[arg(long, default_value_t = 30)]
    pub http_timeout: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log: String,
}

/// Settings the tunnel service runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub bind: IpAddr,
    pub socks_port: u16,
    pub max_hops: u8,
    pub check_interval: Duration,
    pub http_timeout: Duration,
}

impl From<&Args> for TunnelConfig {
    fn from(args: &Args) -> Self {
        Self {
            bind: args.bind,
            socks_port: args.socks_port,
            max_hops: args.max_hops,
            check_interval: Duration::from_secs(args.check_interval.max(1)),
            http_timeout: Duration::from_secs(args.http_timeout.max(1)),
        }
    }
}
