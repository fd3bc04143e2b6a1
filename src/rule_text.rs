//! Text model of iptables rules.
//!
//! Renders the operations the engine needs into iptables argument vectors and
//! recovers structured facts (chains, jump rules, marker-tagged rules) from a
//! `iptables -S` / `iptables-save` dump. Parsing is line oriented and ignores
//! anything it does not understand.

use crate::family::Family;
use crate::port::Port;
use crate::protocol::Protocol;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// Built-in chain that receives the jump rules
pub const INPUT_CHAIN: &str = "INPUT";

/// Every rule created inside a managed chain carries a comment starting with
/// this prefix. Changing it orphans rules created by earlier versions.
pub const MARKER_PREFIX: &str = "ipallow-";

const ACCEPT: &str = "ACCEPT";
const DROP: &str = "DROP";

/// Provenance tag of one apply run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker(String);

impl Marker {
    pub fn for_run(time: DateTime<Utc>) -> Self {
        Self(format!("{}{}", MARKER_PREFIX, time.format("%Y%m%d%H%M%S")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_owned(comment: &str) -> bool {
        comment.starts_with(MARKER_PREFIX)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Match specification plus target of a single rule, without the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    args: Vec<String>,
}

impl RuleSpec {
    pub fn from_args(args: Vec<String>) -> Self {
        Self { args }
    }

    pub fn accept_source(source: &str, marker: &Marker) -> Self {
        Self::from_args(vec![
            "-s".to_string(),
            source.to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            marker.to_string(),
            "-j".to_string(),
            ACCEPT.to_string(),
        ])
    }

    pub fn drop_all(marker: &Marker) -> Self {
        Self::from_args(vec![
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            marker.to_string(),
            "-j".to_string(),
            DROP.to_string(),
        ])
    }

    pub fn jump(protocol: Protocol, port: Port, chain: &str) -> Self {
        Self::from_args(vec![
            "-p".to_string(),
            protocol.name().to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            chain.to_string(),
        ])
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Value following the first occurrence of `option`
    pub fn option(&self, option: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == option)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn target(&self) -> Option<&str> {
        self.option("-j")
    }

    pub fn source(&self) -> Option<&str> {
        self.option("-s")
    }

    pub fn comment(&self) -> Option<&str> {
        self.option("--comment")
    }

    pub fn is_owned(&self) -> bool {
        self.comment().is_some_and(Marker::is_owned)
    }

    pub fn is_accept(&self) -> bool {
        self.target() == Some(ACCEPT)
    }
}

/// A single invocation of the rule table tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `-S [chain]`: dump everything, or one chain (fails if it does not exist)
    List { chain: Option<String> },
    NewChain { chain: String },
    FlushChain { chain: String },
    DeleteChain { chain: String },
    Append { chain: String, rule: RuleSpec },
    /// 1-based position
    Insert {
        chain: String,
        position: usize,
        rule: RuleSpec,
    },
    Check { chain: String, rule: RuleSpec },
    Delete { chain: String, rule: RuleSpec },
}

impl Command {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            Command::List { chain } => {
                args.push("-S".to_string());
                args.extend(chain.iter().cloned());
            }
            Command::NewChain { chain } => args.extend(["-N".to_string(), chain.clone()]),
            Command::FlushChain { chain } => args.extend(["-F".to_string(), chain.clone()]),
            Command::DeleteChain { chain } => args.extend(["-X".to_string(), chain.clone()]),
            Command::Append { chain, rule } => {
                args.extend(["-A".to_string(), chain.clone()]);
                args.extend(rule.args().iter().cloned());
            }
            Command::Insert {
                chain,
                position,
                rule,
            } => {
                args.extend(["-I".to_string(), chain.clone(), position.to_string()]);
                args.extend(rule.args().iter().cloned());
            }
            Command::Check { chain, rule } => {
                args.extend(["-C".to_string(), chain.clone()]);
                args.extend(rule.args().iter().cloned());
            }
            Command::Delete { chain, rule } => {
                args.extend(["-D".to_string(), chain.clone()]);
                args.extend(rule.args().iter().cloned());
            }
        }
        args
    }

    /// Inverse of [`Command::to_args`]. Options the tool would accept anywhere
    /// (`-w`, `-v`, ...) are not understood.
    pub fn from_args(args: &[String]) -> Option<Command> {
        let (op, rest) = args.split_first()?;
        let chain = rest.first().cloned();
        let rule = || RuleSpec::from_args(rest.iter().skip(1).cloned().collect());

        let command = match op.as_str() {
            "-S" => {
                if rest.len() > 1 {
                    return None;
                }
                Command::List { chain }
            }
            "-N" => Command::NewChain { chain: chain? },
            "-F" => Command::FlushChain { chain: chain? },
            "-X" => Command::DeleteChain { chain: chain? },
            "-A" => Command::Append {
                chain: chain?,
                rule: rule(),
            },
            "-I" => {
                let chain = chain?;
                match rest.get(1).and_then(|p| p.parse::<usize>().ok()) {
                    Some(position) => Command::Insert {
                        chain,
                        position,
                        rule: RuleSpec::from_args(rest.iter().skip(2).cloned().collect()),
                    },
                    None => Command::Insert {
                        chain,
                        position: 1,
                        rule: rule(),
                    },
                }
            }
            "-C" => Command::Check {
                chain: chain?,
                rule: rule(),
            },
            "-D" => Command::Delete {
                chain: chain?,
                rule: rule(),
            },
            _ => return None,
        };
        Some(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_args().join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpedRule {
    pub chain: String,
    pub rule: RuleSpec,
}

/// Structured view of a rule dump of one family
#[derive(Debug, Default, PartialEq)]
pub struct RuleDump {
    chains: BTreeSet<String>,
    rules: Vec<DumpedRule>,
}

impl RuleDump {
    pub fn parse(text: &str) -> RuleDump {
        let mut dump = RuleDump::default();

        for line in text.lines() {
            let line = line.trim();

            // iptables-save chain declaration: `:NAME POLICY [packets:bytes]`
            if let Some(declaration) = line.strip_prefix(':') {
                if let Some(name) = declaration.split_whitespace().next() {
                    dump.chains.insert(name.to_string());
                }
                continue;
            }

            let tokens = split_rule_line(line);
            match tokens.first().map(String::as_str) {
                Some("-N") | Some("-P") => {
                    if let Some(name) = tokens.get(1) {
                        dump.chains.insert(name.clone());
                    }
                }
                Some("-A") => {
                    if let Some(chain) = tokens.get(1) {
                        dump.rules.push(DumpedRule {
                            chain: chain.clone(),
                            rule: RuleSpec::from_args(tokens[2..].to_vec()),
                        });
                    }
                }
                _ => {}
            }
        }

        dump
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.chains.contains(chain)
    }

    pub fn rules_in<'a>(&'a self, chain: &'a str) -> impl Iterator<Item = &'a RuleSpec> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.chain == chain)
            .map(|r| &r.rule)
    }

    /// Rules in `chain` that carry the ownership marker
    pub fn owned_rules<'a>(&'a self, chain: &'a str) -> impl Iterator<Item = &'a RuleSpec> + 'a {
        self.rules_in(chain).filter(|r| r.is_owned())
    }

    /// Sources of the marker-tagged accept rules in `chain`
    pub fn accepted_sources<'a>(&'a self, chain: &'a str) -> Vec<&'a str> {
        self.owned_rules(chain)
            .filter(|r| r.is_accept())
            .filter_map(RuleSpec::source)
            .collect()
    }

    /// Jump rules in the INPUT chain targeting `chain`
    pub fn jumps_to<'a>(&'a self, chain: &'a str) -> impl Iterator<Item = &'a RuleSpec> + 'a {
        self.rules_in(INPUT_CHAIN)
            .filter(move |r| r.target() == Some(chain))
    }

    /// Ports managed in this table: chains named after the managed pattern,
    /// targets of INPUT jump rules into such chains, and chains holding
    /// marker-tagged rules.
    pub fn managed_ports(&self, family: Family) -> BTreeSet<Port> {
        let declared = self.chains.iter().map(String::as_str);
        let jump_targets = self.rules_in(INPUT_CHAIN).filter_map(RuleSpec::target);
        let tagged = self
            .rules
            .iter()
            .filter(|r| r.rule.is_owned())
            .map(|r| r.chain.as_str());

        declared
            .chain(jump_targets)
            .chain(tagged)
            .filter_map(|chain| family.port_of_chain(chain))
            .collect()
    }
}

/// Splits a dump line into arguments, honouring double quotes the way
/// iptables prints them (`--comment "some text"`).
pub fn split_rule_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use maplit::btreeset;

    fn port(value: u16) -> Port {
        Port::new(value).unwrap()
    }

    fn marker() -> Marker {
        Marker::for_run(Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap())
    }

    const DUMP: &str = r#"-P INPUT ACCEPT
-P FORWARD DROP
-P OUTPUT ACCEPT
-N DOCKER-USER
-N IPALLOW_443
-N IPALLOW_8080
-A INPUT -p tcp -m tcp --dport 443 -j IPALLOW_443
-A INPUT -p udp -m udp --dport 443 -j IPALLOW_443
-A INPUT -p tcp -m tcp --dport 22 -j ACCEPT
-A INPUT -p tcp -m tcp --dport 9000 -j IPALLOW_9000
-A IPALLOW_443 -s 127.0.0.1/32 -m comment --comment "ipallow-20240309140500" -j ACCEPT
-A IPALLOW_443 -s 192.168.0.0/24 -m comment --comment ipallow-20240309140500 -j ACCEPT
-A IPALLOW_443 -s 10.9.9.9/32 -m comment --comment "added by hand" -j ACCEPT
-A IPALLOW_443 -m comment --comment "ipallow-20240309140500" -j DROP
-A DOCKER-USER -j RETURN
"#;

    #[test]
    fn marker_format() {
        assert_eq!(marker().as_str(), "ipallow-20240309140500");
        assert!(Marker::is_owned(marker().as_str()));
        assert!(!Marker::is_owned("added by hand"));
    }

    #[test]
    fn emitted_arguments() {
        let m = marker();
        assert_eq!(
            Command::Append {
                chain: "IPALLOW_443".to_string(),
                rule: RuleSpec::accept_source("192.168.0.0/24", &m),
            }
            .to_string(),
            "-A IPALLOW_443 -s 192.168.0.0/24 -m comment --comment ipallow-20240309140500 -j ACCEPT"
        );
        assert_eq!(
            Command::Insert {
                chain: INPUT_CHAIN.to_string(),
                position: 1,
                rule: RuleSpec::jump(Protocol::Udp, port(443), "IPALLOW_443"),
            }
            .to_string(),
            "-I INPUT 1 -p udp --dport 443 -j IPALLOW_443"
        );
        assert_eq!(
            Command::List { chain: None }.to_args(),
            vec!["-S".to_string()]
        );
    }

    #[test]
    fn commands_parse_back() {
        let m = marker();
        let commands = vec![
            Command::List { chain: None },
            Command::List {
                chain: Some("IPALLOW_1".to_string()),
            },
            Command::NewChain {
                chain: "IPALLOW_1".to_string(),
            },
            Command::Insert {
                chain: "IPALLOW_1".to_string(),
                position: 3,
                rule: RuleSpec::accept_source("::1", &m),
            },
            Command::Delete {
                chain: INPUT_CHAIN.to_string(),
                rule: RuleSpec::jump(Protocol::Tcp, port(1), "IPALLOW_1"),
            },
        ];

        for command in commands {
            assert_eq!(Command::from_args(&command.to_args()), Some(command));
        }
        assert_eq!(Command::from_args(&["-Z".to_string()]), None);
    }

    #[test]
    fn rule_accessors() {
        let rule = RuleSpec::jump(Protocol::Tcp, port(443), "IPALLOW_443");
        assert_eq!(rule.option("-p"), Some("tcp"));
        assert_eq!(rule.option("--dport"), Some("443"));
        assert_eq!(rule.target(), Some("IPALLOW_443"));
        assert!(!rule.is_owned());
        assert!(RuleSpec::drop_all(&marker()).is_owned());
    }

    #[test]
    fn parse_dump() {
        let dump = RuleDump::parse(DUMP);

        assert!(dump.has_chain("IPALLOW_443"));
        assert!(dump.has_chain("INPUT"));
        assert!(!dump.has_chain("IPALLOW_9000"));

        assert_eq!(
            dump.accepted_sources("IPALLOW_443"),
            vec!["127.0.0.1/32", "192.168.0.0/24"]
        );
        assert_eq!(dump.owned_rules("IPALLOW_443").count(), 3);
        assert_eq!(dump.rules_in("IPALLOW_443").count(), 4);
        assert_eq!(dump.jumps_to("IPALLOW_443").count(), 2);
        assert_eq!(dump.jumps_to("IPALLOW_8080").count(), 0);
    }

    #[test]
    fn managed_ports_from_chains_and_jumps() {
        let dump = RuleDump::parse(DUMP);
        assert_eq!(
            dump.managed_ports(Family::Ipv4),
            btreeset! {port(443), port(8080), port(9000)}
        );
        assert!(dump.managed_ports(Family::Ipv6).is_empty());
    }

    #[test]
    fn parse_iptables_save_format() {
        let text = r#"# Generated by iptables-save v1.8.7
*filter
:INPUT ACCEPT [0:0]
:IPALLOW6_53 - [0:0]
-A INPUT -p udp -m udp --dport 53 -j IPALLOW6_53
-A IPALLOW6_53 -s ::1/128 -m comment --comment "ipallow-20240309140500" -j ACCEPT
COMMIT
"#;
        let dump = RuleDump::parse(text);
        assert!(dump.has_chain("IPALLOW6_53"));
        assert_eq!(dump.accepted_sources("IPALLOW6_53"), vec!["::1/128"]);
        assert_eq!(dump.managed_ports(Family::Ipv6), btreeset! {port(53)});
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let dump = RuleDump::parse("garbage\n\n-Q what\n-A\n-N IPALLOW_22\n");
        assert_eq!(dump.managed_ports(Family::Ipv4), btreeset! {port(22)});
    }

    #[test]
    fn split_quoted_tokens() {
        assert_eq!(
            split_rule_line(r#"-A X -m comment --comment "two words \"q\"" -j DROP"#),
            vec!["-A", "X", "-m", "comment", "--comment", r#"two words "q""#, "-j", "DROP"]
        );
        assert_eq!(split_rule_line(r#"--comment """#), vec!["--comment", ""]);
        assert!(split_rule_line("   ").is_empty());
    }
}
