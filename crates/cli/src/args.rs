use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "servprobe")]
#[command(version)]
#[command(about = "Identify network services with nmap-style probe rules", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fingerprint the services behind each target and port
    Match(MatchArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct MatchArgs {
    /// Targets: IPs, hostnames, CIDRs or IPv4 ranges, comma separated
    #[arg(short = 't', long, required = true)]
    pub targets: String,

    /// Ports. Examples: 22 or 22,80,443 or 8000-8010
    #[arg(short, long, default_value = "22,80,443")]
    pub ports: String,

    /// Transports to probe over: tcp, udp or tcp,udp
    #[arg(long, default_value = "tcp", value_delimiter = ',')]
    pub transports: Vec<String>,

    /// Extra rule file merged over the bundled rules
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Payload probes sent per port (0 for no cap)
    #[arg(long, default_value = "5")]
    pub probes_max: usize,

    /// Probes in flight per port
    #[arg(long, default_value = "5")]
    pub probes_concurrency: usize,

    /// Highest rarity used for probes not declared for the port
    #[arg(long, default_value = "5")]
    pub rarity_max: u8,

    /// Only send probes declared for the port, plus the null probe
    #[arg(long)]
    pub passive: bool,

    /// Per-probe timeout in seconds
    #[arg(long, default_value = "5")]
    pub timeout: f64,

    /// Ports matched concurrently
    #[arg(short, long, default_value = "20")]
    pub concurrency: usize,

    /// Match requests started per second (0 for unlimited)
    #[arg(short = 'r', long, default_value = "0")]
    pub rate_limit: u32,

    /// Proxy chain, in dialing order (socks5://, http://)
    #[arg(long = "proxy")]
    pub proxies: Vec<String>,

    /// Hosts, IPs or CIDRs to skip, comma separated
    #[arg(long)]
    pub exclude_hosts: Option<String>,

    /// Ports to skip
    #[arg(long)]
    pub exclude_ports: Option<String>,

    /// Cache results for repeated targets
    #[arg(long)]
    pub cache: bool,

    /// Log every probe outcome at debug level
    #[arg(long)]
    pub debug_log: bool,

    /// Output format: text, json, csv
    #[arg(short, long, default_value = "text")]
    pub output_format: String,
}
