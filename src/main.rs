mod allowlist;
mod engine;
mod family;
mod firewall_backend;
mod port;
mod privileges;
mod program_config;
mod protocol;
mod report;
mod rule_text;

use crate::allowlist::AllowlistDir;
use crate::engine::Engine;
use crate::family::Family;
use crate::firewall_backend::iptables::IptablesFirewallBackend;
use crate::firewall_backend::simulated::SimulatedFirewallBackend;
use crate::firewall_backend::{FirewallBackend, RuleTable};
use crate::port::{parse_port_list, Port};
use crate::program_config::{Command, FirewallConfig, FirewallKind, ProgramConfig};
use crate::report::Summary;
use crate::rule_text::Marker;
use anyhow::{bail, Context};
use env_logger::Env;
use std::str::FromStr;

fn main() -> anyhow::Result<()> {
    // Parse options
    let config = ProgramConfig::parse();

    // Set up logging
    env_logger::Builder::from_env(Env::default().default_filter_or(if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_module_path(false)
    .init();

    run(config)
}

fn run(config: ProgramConfig) -> anyhow::Result<()> {
    let allowlist = AllowlistDir::new(&config.allowlist_dir);

    match config.command {
        Command::Apply { ports } => {
            let ports = if ports.is_empty() {
                let declared = allowlist.declared_ports()?;
                if declared.is_empty() {
                    bail!(
                        "No ports declared in '{}', nothing to apply",
                        allowlist.root().display()
                    );
                }
                declared
            } else {
                parse_port_list(&ports)?
            };

            let mut engine = open_engine(&config.firewall)?;
            apply(&mut engine, &allowlist, &ports)
        }
        Command::Show { ports } => {
            let ports = parse_port_list(&ports)?;
            let mut engine = open_engine(&config.firewall)?;

            let counts = if ports.is_empty() {
                engine.managed_summary()
            } else {
                ports.iter().map(|port| engine.counts_for(*port)).collect()
            };
            let counts = counts.context("Failed to read firewall rules")?;

            if counts.is_empty() {
                log::info!("No managed ports");
            }
            Summary::stdout().managed(&counts)?;
            Ok(())
        }
        Command::Delete { ports, all, yes } => {
            let ports = parse_port_list(&ports)?;
            let mut engine = open_engine(&config.firewall)?;
            delete(&mut engine, &ports, all, yes)
        }
        Command::Add { port, entries } => {
            let port = Port::from_str(&port)?;
            let summaries = allowlist.add_entries(port, &entries).with_context(|| {
                format!("Failed to update the allow-list of port {}", port)
            })?;
            Summary::stdout().added(port, &summaries)?;
            Ok(())
        }
    }
}

fn open_engine(config: &FirewallConfig) -> anyhow::Result<Engine> {
    let mut backends: Vec<Box<dyn FirewallBackend>> = Vec::new();

    match config.backend {
        FirewallKind::iptables => {
            if !privileges::is_root() {
                bail!("Managing iptables rules requires root privileges");
            }

            log::info!("Using iptables backend");
            for (family, program) in [
                (Family::Ipv4, &config.iptables),
                (Family::Ipv6, &config.ip6tables),
            ] {
                if let Some(backend) = IptablesFirewallBackend::probe(program, family) {
                    backends.push(Box::new(backend));
                }
            }
        }
        FirewallKind::simulated => {
            if let Some(dir) = &config.simulated_state {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create '{}'", dir.display()))?;
            }

            for family in Family::ALL {
                let backend = match &config.simulated_state {
                    Some(dir) => {
                        let path = dir.join(format!("{}.rules", family));
                        SimulatedFirewallBackend::with_state_file(family, &path)?
                    }
                    None => SimulatedFirewallBackend::new(family),
                };
                backends.push(Box::new(backend));
            }
        }
    }

    if backends.is_empty() {
        bail!("Neither IPv4 nor IPv6 rules can be managed, aborting");
    }

    let tables = backends.into_iter().map(RuleTable::new).collect();
    Ok(Engine::new(tables, Marker::for_run(chrono::Utc::now())))
}

fn apply(engine: &mut Engine, allowlist: &AllowlistDir, ports: &[Port]) -> anyhow::Result<()> {
    let mut summary = Summary::stdout();
    let mut failed = 0;
    let mut undeclared = 0;

    for port in ports {
        let report = engine.apply(*port, allowlist);
        summary.applied(&report)?;
        if !report.is_declared() {
            undeclared += 1;
        }
        if report.has_failures() {
            failed += 1;
        }
    }

    if undeclared > 0 {
        log::info!("{} port(s) without declared allow-list were skipped", undeclared);
    }

    if failed > 0 {
        bail!("{} of {} port(s) could not be fully applied", failed, ports.len());
    }
    Ok(())
}

/// With `all`, `ports` is ignored and every managed port is removed
fn delete(engine: &mut Engine, ports: &[Port], all: bool, assume_yes: bool) -> anyhow::Result<()> {
    let listed = if all {
        engine
            .list_managed_ports()
            .context("Failed to read firewall rules")?
            .into_iter()
            .collect()
    } else {
        ports.to_vec()
    };

    if listed.is_empty() {
        log::info!("No managed ports, nothing to delete");
        return Ok(());
    }

    if !assume_yes && privileges::stdin_is_terminal() {
        let list = listed
            .iter()
            .map(Port::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        if !privileges::confirm(&format!("Delete all allow-list rules for port(s) {}?", list))? {
            log::info!("Aborted");
            return Ok(());
        }
    }

    let reports = if all {
        engine
            .remove_all()
            .context("Failed to read firewall rules")?
    } else {
        listed.iter().map(|port| engine.remove(*port)).collect()
    };
    Summary::stdout().removed(&reports)?;
    Ok(())
}
