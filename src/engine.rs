mod decommissioner;
mod reconciler;
mod scanner;

pub use decommissioner::RemovalReport;
pub use reconciler::{ApplyReport, FamilyOutcome, FamilyReport};
pub use scanner::{PortCounts, ScanError};

use crate::family::Family;
use crate::firewall_backend::RuleTable;
use crate::rule_text::Marker;

/// Reconciles declared allow-lists with the rule tables of the available
/// families. A family without a table is skipped by every operation.
pub struct Engine {
    tables: Vec<RuleTable>,
    marker: Marker,
}

impl Engine {
    /// `marker` tags every rule created through this engine
    pub fn new(tables: Vec<RuleTable>, marker: Marker) -> Self {
        Self { tables, marker }
    }

    fn table_mut(&mut self, family: Family) -> Option<&mut RuleTable> {
        self.tables.iter_mut().find(|t| t.family() == family)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::allowlist::EntrySource;
    use crate::firewall_backend::simulated::SimulatedFirewallBackend;
    use crate::firewall_backend::{BackendError, FirewallBackend};
    use crate::port::Port;
    use crate::rule_text::{Command, RuleDump};
    use chrono::TimeZone;
    use std::collections::HashMap;

    pub fn port(value: u16) -> Port {
        Port::new(value).unwrap()
    }

    pub fn marker() -> Marker {
        Marker::for_run(chrono::Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap())
    }

    pub fn engine_with(families: &[Family]) -> Engine {
        let tables = families
            .iter()
            .map(|f| RuleTable::new(Box::new(SimulatedFirewallBackend::new(*f))))
            .collect();
        Engine::new(tables, marker())
    }

    pub fn engine() -> Engine {
        engine_with(&Family::ALL)
    }

    /// Engine over a single table of `backend`'s family
    pub fn engine_over(backend: impl FirewallBackend + 'static) -> Engine {
        Engine::new(vec![RuleTable::new(Box::new(backend))], marker())
    }

    /// Simulated table that rejects every command `refuse` picks
    pub struct Faulty<F> {
        inner: SimulatedFirewallBackend,
        refuse: F,
    }

    impl<F: FnMut(&Command) -> bool> Faulty<F> {
        pub fn new(family: Family, refuse: F) -> Self {
            Self {
                inner: SimulatedFirewallBackend::new(family),
                refuse,
            }
        }
    }

    impl<F: FnMut(&Command) -> bool> FirewallBackend for Faulty<F> {
        fn family(&self) -> Family {
            self.inner.family()
        }

        fn execute(&mut self, command: &Command) -> Result<String, BackendError> {
            if (self.refuse)(command) {
                return Err(BackendError::Rejected {
                    command: command.to_string(),
                    message: "Resource temporarily unavailable".to_string(),
                });
            }
            self.inner.execute(command)
        }
    }

    pub fn dump(engine: &mut Engine, family: Family) -> RuleDump {
        engine.table_mut(family).unwrap().dump().unwrap()
    }

    /// Entries kept in memory, keyed by port and family
    #[derive(Default)]
    pub struct Declared(pub HashMap<(Port, Family), Vec<String>>);

    impl Declared {
        pub fn set(&mut self, port: Port, family: Family, entries: &[&str]) {
            self.0.insert(
                (port, family),
                entries.iter().map(|e| e.to_string()).collect(),
            );
        }
    }

    impl EntrySource for Declared {
        fn entries(&self, port: Port, family: Family) -> anyhow::Result<Option<Vec<String>>> {
            Ok(self.0.get(&(port, family)).cloned())
        }
    }
}
