pub mod iptables;
pub mod simulated;

use crate::family::Family;
use crate::rule_text::{Command, RuleDump, RuleSpec, INPUT_CHAIN};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{command}' failed: {message}")]
    Rejected { command: String, message: String },
}

/// The rule table tool of one address family (`iptables`, `ip6tables`).
///
/// Every call is one synchronous invocation with iptables command line
/// semantics; the output is returned on success.
pub trait FirewallBackend {
    fn family(&self) -> Family;

    fn execute(&mut self, command: &Command) -> Result<String, BackendError>;
}

/// Chain and rule primitives on top of a [`FirewallBackend`]
pub struct RuleTable {
    backend: Box<dyn FirewallBackend>,
}

impl RuleTable {
    pub fn new(backend: Box<dyn FirewallBackend>) -> Self {
        Self { backend }
    }

    pub fn family(&self) -> Family {
        self.backend.family()
    }

    pub fn chain_exists(&mut self, chain: &str) -> bool {
        self.backend
            .execute(&Command::List {
                chain: Some(chain.to_string()),
            })
            .is_ok()
    }

    pub fn create_chain(&mut self, chain: &str) -> Result<(), BackendError> {
        self.run(Command::NewChain {
            chain: chain.to_string(),
        })
    }

    pub fn flush_chain(&mut self, chain: &str) -> Result<(), BackendError> {
        self.run(Command::FlushChain {
            chain: chain.to_string(),
        })
    }

    pub fn delete_chain(&mut self, chain: &str) -> Result<(), BackendError> {
        self.run(Command::DeleteChain {
            chain: chain.to_string(),
        })
    }

    /// Creates `chain`, or flushes it if it already exists
    pub fn ensure_empty_chain(&mut self, chain: &str) -> Result<(), BackendError> {
        if self.chain_exists(chain) {
            log::debug!("[{}] Flushing chain {}", self.family(), chain);
            self.flush_chain(chain)
        } else {
            log::debug!("[{}] Creating chain {}", self.family(), chain);
            self.create_chain(chain)
        }
    }

    pub fn append_rule(&mut self, chain: &str, rule: RuleSpec) -> Result<(), BackendError> {
        self.run(Command::Append {
            chain: chain.to_string(),
            rule,
        })
    }

    pub fn insert_rule(
        &mut self,
        chain: &str,
        position: usize,
        rule: RuleSpec,
    ) -> Result<(), BackendError> {
        self.run(Command::Insert {
            chain: chain.to_string(),
            position,
            rule,
        })
    }

    pub fn rule_exists(&mut self, chain: &str, rule: &RuleSpec) -> bool {
        self.backend
            .execute(&Command::Check {
                chain: chain.to_string(),
                rule: rule.clone(),
            })
            .is_ok()
    }

    pub fn delete_rule(&mut self, chain: &str, rule: &RuleSpec) -> Result<(), BackendError> {
        self.run(Command::Delete {
            chain: chain.to_string(),
            rule: rule.clone(),
        })
    }

    /// Inserts `rule` at the head of INPUT unless an identical rule is present.
    /// Returns whether a rule was inserted.
    pub fn ensure_input_rule(&mut self, rule: RuleSpec) -> Result<bool, BackendError> {
        if self.rule_exists(INPUT_CHAIN, &rule) {
            return Ok(false);
        }
        self.insert_rule(INPUT_CHAIN, 1, rule)?;
        Ok(true)
    }

    pub fn dump_rules(&mut self) -> Result<String, BackendError> {
        self.backend.execute(&Command::List { chain: None })
    }

    pub fn dump(&mut self) -> Result<RuleDump, BackendError> {
        Ok(RuleDump::parse(&self.dump_rules()?))
    }

    fn run(&mut self, command: Command) -> Result<(), BackendError> {
        self.backend.execute(&command).map(|_| ())
    }
}
