use crate::family::Family;
use crate::firewall_backend::{BackendError, FirewallBackend};
use crate::protocol::Protocol;
use crate::rule_text::{split_rule_line, Command, RuleSpec};
use anyhow::Context;
use ipnet::IpNet;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const BUILTIN_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];
const BUILTIN_TARGETS: [&str; 4] = ["ACCEPT", "DROP", "REJECT", "RETURN"];

/// In-memory rule table that understands the iptables command line subset
/// the engine uses, and fails where the real tool would fail. With a state
/// file the table survives between invocations.
pub struct SimulatedFirewallBackend {
    family: Family,
    chains: Vec<Chain>,
    state_file: Option<PathBuf>,
}

struct Chain {
    name: String,
    policy: Option<String>,
    rules: Vec<RuleSpec>,
}

impl SimulatedFirewallBackend {
    pub fn new(family: Family) -> Self {
        log::info!("Firewall backend is simulated ({})", family);
        Self {
            family,
            chains: BUILTIN_CHAINS
                .iter()
                .map(|name| Chain {
                    name: name.to_string(),
                    policy: Some("ACCEPT".to_string()),
                    rules: Vec::new(),
                })
                .collect(),
            state_file: None,
        }
    }

    /// Backend persisting its table to `path` after every change. An existing
    /// file is loaded first; it uses the `-S` dump format.
    pub fn with_state_file(family: Family, path: &Path) -> anyhow::Result<Self> {
        let mut backend = Self::new(family);

        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read '{}'", path.display()))?;
            backend
                .load(&text)
                .with_context(|| format!("Failed to load '{}'", path.display()))?;
        }

        backend.state_file = Some(path.to_path_buf());
        Ok(backend)
    }

    fn load(&mut self, text: &str) -> anyhow::Result<()> {
        // Chains first, rules may jump into chains declared later in the file
        let lines = text
            .lines()
            .map(split_rule_line)
            .filter(|tokens| !tokens.is_empty())
            .collect::<Vec<_>>();

        for tokens in &lines {
            match tokens[0].as_str() {
                "-P" if tokens.len() == 3 => {
                    if let Some(chain) = self.chain_mut(&tokens[1]) {
                        chain.policy = Some(tokens[2].clone());
                    }
                }
                "-N" if tokens.len() == 2 => {
                    self.new_chain(&tokens[1]).map_err(anyhow::Error::msg)?
                }
                _ => {}
            }
        }

        for tokens in lines.iter().filter(|t| t[0] == "-A") {
            let command = Command::from_args(tokens)
                .with_context(|| format!("Invalid rule '{}'", tokens.join(" ")))?;
            self.apply(&command).map_err(anyhow::Error::msg)?;
        }

        Ok(())
    }

    /// `iptables -S [chain]` output
    pub fn render(&self, only: Option<&str>) -> String {
        let selected = self
            .chains
            .iter()
            .filter(|c| only.map_or(true, |name| c.name == name))
            .collect::<Vec<_>>();

        let mut out = String::new();
        for chain in &selected {
            match &chain.policy {
                Some(policy) => out.push_str(&format!("-P {} {}\n", chain.name, policy)),
                None => out.push_str(&format!("-N {}\n", chain.name)),
            }
        }
        for chain in &selected {
            for rule in &chain.rules {
                out.push_str(&format!("-A {} {}\n", chain.name, render_rule(rule)));
            }
        }
        out
    }

    fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }

    fn chain_mut(&mut self, name: &str) -> Option<&mut Chain> {
        self.chains.iter_mut().find(|c| c.name == name)
    }

    fn existing_chain_mut(&mut self, name: &str) -> Result<&mut Chain, String> {
        self.chain_mut(name)
            .ok_or_else(|| "No chain/target/match by that name.".to_string())
    }

    fn new_chain(&mut self, name: &str) -> Result<(), String> {
        if self.chain(name).is_some() {
            return Err("Chain already exists.".to_string());
        }
        if name.is_empty() || name.len() > 28 || name.starts_with('-') {
            return Err(format!("Invalid chain name `{}'", name));
        }
        self.chains.push(Chain {
            name: name.to_string(),
            policy: None,
            rules: Vec::new(),
        });
        Ok(())
    }

    fn apply(&mut self, command: &Command) -> Result<String, String> {
        match command {
            Command::List { chain } => {
                if let Some(name) = chain {
                    if self.chain(name).is_none() {
                        return Err("No chain/target/match by that name.".to_string());
                    }
                }
                Ok(self.render(chain.as_deref()))
            }
            Command::NewChain { chain } => self.new_chain(chain).map(|_| String::new()),
            Command::FlushChain { chain } => {
                self.existing_chain_mut(chain)?.rules.clear();
                Ok(String::new())
            }
            Command::DeleteChain { chain } => {
                let target = self
                    .chain(chain)
                    .ok_or_else(|| "No chain/target/match by that name.".to_string())?;
                if target.policy.is_some() {
                    return Err("Cannot delete built-in chain.".to_string());
                }
                if !target.rules.is_empty() {
                    return Err("Directory not empty.".to_string());
                }
                let referenced = self
                    .chains
                    .iter()
                    .flat_map(|c| &c.rules)
                    .any(|r| r.target() == Some(chain.as_str()));
                if referenced {
                    return Err("Too many links.".to_string());
                }
                self.chains.retain(|c| &c.name != chain);
                Ok(String::new())
            }
            Command::Append { chain, rule } => {
                let rule = self.normalize(rule)?;
                self.existing_chain_mut(chain)?.rules.push(rule);
                Ok(String::new())
            }
            Command::Insert {
                chain,
                position,
                rule,
            } => {
                let rule = self.normalize(rule)?;
                let rules = &mut self.existing_chain_mut(chain)?.rules;
                if *position == 0 || *position > rules.len() + 1 {
                    return Err("Index of insertion too big.".to_string());
                }
                rules.insert(position - 1, rule);
                Ok(String::new())
            }
            Command::Check { chain, rule } => {
                let rule = self.normalize(rule)?;
                if self.existing_chain_mut(chain)?.rules.contains(&rule) {
                    Ok(String::new())
                } else {
                    Err("Bad rule (does a matching rule exist in that chain?).".to_string())
                }
            }
            Command::Delete { chain, rule } => {
                let rule = self.normalize(rule)?;
                let rules = &mut self.existing_chain_mut(chain)?.rules;
                match rules.iter().position(|r| *r == rule) {
                    Some(index) => {
                        rules.remove(index);
                        Ok(String::new())
                    }
                    None => Err(
                        "Bad rule (does a matching rule exist in that chain?).".to_string(),
                    ),
                }
            }
        }
    }

    /// Validates a rule and brings it into the form `-S` prints
    fn normalize(&self, rule: &RuleSpec) -> Result<RuleSpec, String> {
        let mut args = Vec::with_capacity(rule.args().len() + 2);
        let mut iter = rule.args().iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-s" | "-d" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| format!("option \"{}\" requires an argument", arg))?;
                    args.push(arg.clone());
                    args.push(self.parse_network(value)?.to_string());
                }
                "-p" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| "option \"-p\" requires an argument".to_string())?;
                    let protocol = Protocol::parse(value)
                        .ok_or_else(|| format!("unknown protocol \"{}\" specified", value))?
                        .name();
                    args.push(arg.clone());
                    args.push(protocol.to_string());
                    let has_port_match = rule
                        .args()
                        .iter()
                        .any(|a| a == "--dport" || a == "--sport");
                    let has_explicit_match = rule.option("-m") == Some(protocol);
                    if has_port_match && !has_explicit_match {
                        args.push("-m".to_string());
                        args.push(protocol.to_string());
                    }
                }
                "--dport" | "--sport" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| format!("option \"{}\" requires an argument", arg))?;
                    if u16::from_str(value).is_err() {
                        return Err(format!("invalid port/service `{}' specified", value));
                    }
                    args.push(arg.clone());
                    args.push(value.clone());
                }
                "-j" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| "option \"-j\" requires an argument".to_string())?;
                    if !BUILTIN_TARGETS.contains(&value.as_str()) && self.chain(value).is_none() {
                        return Err(format!(
                            "Couldn't load target `{}':No such file or directory",
                            value
                        ));
                    }
                    args.push(arg.clone());
                    args.push(value.clone());
                }
                _ => args.push(arg.clone()),
            }
        }

        Ok(RuleSpec::from_args(args))
    }

    fn parse_network(&self, value: &str) -> Result<IpNet, String> {
        let net = if value.contains('/') {
            IpNet::from_str(value).ok()
        } else {
            IpAddr::from_str(value).ok().map(IpNet::from)
        };

        let net = match (net, self.family) {
            (Some(net @ IpNet::V4(_)), Family::Ipv4) | (Some(net @ IpNet::V6(_)), Family::Ipv6) => {
                net
            }
            _ => return Err(format!("host/network `{}' not found", value)),
        };

        Ok(net.trunc())
    }

    fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };

        // Write to a temp file in the same directory, then rename over the target
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut file = tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
        file.write_all(self.render(None).as_bytes())?;
        file.persist(path)
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
        Ok(())
    }

    fn tool_name(&self) -> &'static str {
        match self.family {
            Family::Ipv4 => "iptables",
            Family::Ipv6 => "ip6tables",
        }
    }
}

impl FirewallBackend for SimulatedFirewallBackend {
    fn family(&self) -> Family {
        self.family
    }

    fn execute(&mut self, command: &Command) -> Result<String, BackendError> {
        let mutates = !matches!(command, Command::List { .. } | Command::Check { .. });

        let output = self
            .apply(command)
            .map_err(|message| BackendError::Rejected {
                command: format!("{} {}", self.tool_name(), command),
                message: format!("{}: {}", self.tool_name(), message),
            })?;

        if mutates {
            self.save().map_err(|e| BackendError::Rejected {
                command: format!("{} {}", self.tool_name(), command),
                message: format!("{:#}", e),
            })?;
        }

        Ok(output)
    }
}

fn render_rule(rule: &RuleSpec) -> String {
    let mut out = Vec::with_capacity(rule.args().len());
    let mut quote_next = false;

    for arg in rule.args() {
        if quote_next {
            out.push(format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\"")));
        } else {
            out.push(arg.clone());
        }
        quote_next = arg == "--comment";
    }

    out.join(" ")
}
