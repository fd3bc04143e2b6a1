use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "port-allowlist", version, about)]
pub struct ProgramConfig {
    /// Directory holding one sub-directory per port with `ipv4.list` / `ipv6.list`
    #[clap(long, env, default_value = "/etc/port-allowlist")]
    pub allowlist_dir: PathBuf,

    #[clap(flatten)]
    pub firewall: FirewallConfig,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct FirewallConfig {
    /// Firewall backend
    #[clap(
        long = "firewall",
        env = "FIREWALL",
        value_enum,
        ignore_case = true,
        default_value = "iptables"
    )]
    pub backend: FirewallKind,

    /// Path of the iptables binary
    #[clap(long, env, default_value = crate::firewall_backend::iptables::IPTABLES)]
    pub iptables: PathBuf,

    /// Path of the ip6tables binary
    #[clap(long, env, default_value = crate::firewall_backend::iptables::IP6TABLES)]
    pub ip6tables: PathBuf,

    /// Directory where the simulated backend keeps its rule tables between runs
    /// (simulated backend only; without it the tables start empty every run)
    #[clap(long, env)]
    pub simulated_state: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[allow(non_camel_case_types)]
pub enum FirewallKind {
    iptables,
    simulated,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Reconcile the firewall with the declared allow-lists
    Apply {
        /// Ports to apply; all declared ports if omitted
        ports: Vec<String>,
    },

    /// List managed ports with the number of allowed sources per family
    Show {
        /// Ports to report on; all managed ports if omitted
        ports: Vec<String>,
    },

    /// Remove all rules and chains of managed ports
    Delete {
        /// Ports to remove
        #[clap(required_unless_present = "all", conflicts_with = "all")]
        ports: Vec<String>,

        /// Remove every managed port
        #[clap(long)]
        all: bool,

        /// Do not ask for confirmation
        #[clap(long, short)]
        yes: bool,
    },

    /// Declare additional allowed sources for a port (does not apply them)
    Add {
        port: String,

        /// Addresses or CIDR blocks; IPv6 entries are recognized by their colon
        #[clap(required = true)]
        entries: Vec<String>,
    },
}

impl ProgramConfig {
    pub fn parse() -> Self {
        Parser::parse()
    }
}
