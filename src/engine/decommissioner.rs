use super::{Engine, ScanError};
use crate::family::Family;
use crate::firewall_backend::RuleTable;
use crate::port::Port;
use crate::protocol::Protocol;
use crate::rule_text::{RuleSpec, INPUT_CHAIN};

/// Upper bound for deleting repeated identical jump rules of one protocol
const MAX_JUMP_DELETIONS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalReport {
    pub port: Port,
    pub deleted: usize,
}

impl Engine {
    /// Removes the jump rules, the marker-tagged rules and the chains of
    /// `port` in every available family. Returns the number of deleted rules.
    pub fn remove(&mut self, port: Port) -> RemovalReport {
        let mut deleted = 0;

        for family in Family::ALL {
            if let Some(table) = self.table_mut(family) {
                deleted += remove_family(table, port);
            }
        }

        log::info!("Port {}: {} rules deleted", port, deleted);
        RemovalReport { port, deleted }
    }

    /// Removes every port found by [`Engine::list_managed_ports`]
    pub fn remove_all(&mut self) -> Result<Vec<RemovalReport>, ScanError> {
        let ports = self.list_managed_ports()?;
        Ok(ports.into_iter().map(|port| self.remove(port)).collect())
    }
}

fn remove_family(table: &mut RuleTable, port: Port) -> usize {
    let family = table.family();
    let chain = family.chain_name(port);
    let mut deleted = 0;

    // Earlier partial runs may have left several identical jump rules behind
    for protocol in Protocol::ALL {
        let jump = RuleSpec::jump(protocol, port, &chain);
        for _ in 0..MAX_JUMP_DELETIONS {
            if table.delete_rule(INPUT_CHAIN, &jump).is_err() {
                break;
            }
            deleted += 1;
        }
    }

    let dump = match table.dump() {
        Ok(dump) => dump,
        Err(e) => {
            log::warn!("[{}] Failed to read rules of {}: {}", family, chain, e);
            return deleted;
        }
    };

    if !dump.has_chain(&chain) {
        return deleted;
    }

    let owned = dump.owned_rules(&chain).cloned().collect::<Vec<_>>();
    let foreign = dump.rules_in(&chain).count() - owned.len();

    if foreign == 0 {
        match table.flush_chain(&chain) {
            Ok(()) => deleted += owned.len(),
            Err(e) => log::warn!("[{}] Failed to flush {}: {}", family, chain, e),
        }
        if let Err(e) = table.delete_chain(&chain) {
            log::debug!("[{}] Ignoring failed deletion of {}: {}", family, chain, e);
        }
        return deleted;
    }

    // Rules without the marker belong to someone else: take ours out one by one
    // and leave the chain in place
    for rule in &owned {
        match table.delete_rule(&chain, rule) {
            Ok(()) => deleted += 1,
            Err(e) => log::warn!("[{}] Failed to delete rule from {}: {}", family, chain, e),
        }
    }
    log::warn!(
        "[{}] {} keeps {} rules not created by this tool and was not deleted",
        family,
        chain,
        foreign
    );

    deleted
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::test_support::*;
    use crate::rule_text::Command;
    use assert_matches::assert_matches;

    fn applied_engine() -> Engine {
        let mut engine = engine();
        let mut declared = Declared::default();
        declared.set(port(443), Family::Ipv4, &["127.0.0.1", "192.168.0.0/24"]);
        engine.apply(port(443), &declared);
        declared.set(port(443), Family::Ipv4, &["127.0.0.1"]);
        engine.apply(port(443), &declared);
        engine
    }

    #[test]
    fn removal_counts_every_created_rule() {
        let mut engine = applied_engine();

        // 1 accept + 1 drop + 2 jumps
        assert_eq!(
            engine.remove(port(443)),
            RemovalReport {
                port: port(443),
                deleted: 4
            }
        );
        assert!(engine.list_managed_ports().unwrap().is_empty());
        assert!(!dump(&mut engine, Family::Ipv4).has_chain("IPALLOW_443"));
    }

    #[test]
    fn duplicate_jumps_are_all_removed() {
        let mut engine = applied_engine();
        let table = engine.table_mut(Family::Ipv4).unwrap();
        for _ in 0..3 {
            table
                .insert_rule(
                    INPUT_CHAIN,
                    1,
                    RuleSpec::jump(Protocol::Tcp, port(443), "IPALLOW_443"),
                )
                .unwrap();
        }

        assert_eq!(engine.remove(port(443)).deleted, 7);
        assert_eq!(dump(&mut engine, Family::Ipv4).jumps_to("IPALLOW_443").count(), 0);
    }

    #[test]
    fn foreign_rules_are_left_alone() {
        let mut engine = applied_engine();
        let foreign = RuleSpec::from_args(vec![
            "-s".to_string(),
            "10.9.9.9/32".to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]);
        engine
            .table_mut(Family::Ipv4)
            .unwrap()
            .insert_rule("IPALLOW_443", 1, foreign.clone())
            .unwrap();

        assert_eq!(engine.remove(port(443)).deleted, 4);

        let dump = dump(&mut engine, Family::Ipv4);
        assert!(dump.has_chain("IPALLOW_443"));
        assert_eq!(dump.rules_in("IPALLOW_443").cloned().collect::<Vec<_>>(), vec![foreign]);
    }

    #[test]
    fn failed_flush_is_not_counted() {
        let mut engine = engine_over(Faulty::new(Family::Ipv4, |command| {
            matches!(command, Command::FlushChain { .. })
        }));
        let mut declared = Declared::default();
        declared.set(port(443), Family::Ipv4, &["127.0.0.1"]);
        engine.apply(port(443), &declared);

        // Only the two jumps are gone, the chain keeps its rules
        assert_eq!(engine.remove(port(443)).deleted, 2);
        let dump = dump(&mut engine, Family::Ipv4);
        assert_eq!(dump.rules_in("IPALLOW_443").count(), 2);
        assert_eq!(dump.jumps_to("IPALLOW_443").count(), 0);
    }

    #[test]
    fn non_canonical_chain_names_are_not_managed() {
        let mut engine = applied_engine();
        engine
            .table_mut(Family::Ipv4)
            .unwrap()
            .create_chain("IPALLOW_0443")
            .unwrap();
        engine.remove(port(443));

        assert!(engine.list_managed_ports().unwrap().is_empty());
        assert!(dump(&mut engine, Family::Ipv4).has_chain("IPALLOW_0443"));
    }

    #[test]
    fn removing_unknown_port_is_a_no_op() {
        let mut engine = applied_engine();
        assert_eq!(engine.remove(port(8080)).deleted, 0);
        assert_eq!(engine.list_managed_ports().unwrap().len(), 1);
    }

    #[test]
    fn remove_all_discovers_ports() {
        let mut engine = engine();
        let mut declared = Declared::default();
        declared.set(port(22), Family::Ipv4, &["10.0.0.1"]);
        declared.set(port(22), Family::Ipv6, &["::1", "fe80::/10"]);
        declared.set(port(80), Family::Ipv4, &[]);
        engine.apply(port(22), &declared);
        engine.apply(port(80), &declared);

        let reports = engine.remove_all().unwrap();

        assert_eq!(
            reports,
            vec![
                // v4: 1 accept + drop + 2 jumps, v6: 2 accepts + drop + 2 jumps
                RemovalReport {
                    port: port(22),
                    deleted: 9
                },
                RemovalReport {
                    port: port(80),
                    deleted: 3
                },
            ]
        );
        assert!(engine.list_managed_ports().unwrap().is_empty());
        assert_matches!(engine.remove_all().as_deref(), Ok([]));
    }
}
