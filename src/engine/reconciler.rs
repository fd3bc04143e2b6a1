use super::Engine;
use crate::allowlist::EntrySource;
use crate::family::Family;
use crate::firewall_backend::{BackendError, RuleTable};
use crate::port::Port;
use crate::protocol::Protocol;
use crate::rule_text::{Marker, RuleSpec, INPUT_CHAIN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FamilyOutcome {
    /// The chain now holds exactly the accepted entries followed by DROP
    Applied {
        chain: String,
        accepted: usize,
        /// Entries the rule table refused
        skipped: Vec<String>,
    },
    /// No allow-list is declared for this family
    NotDeclared,
    /// The rule table of this family is not available on this host
    Unavailable,
    Failed { chain: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyReport {
    pub family: Family,
    pub outcome: FamilyOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub port: Port,
    /// Empty if neither family declares an allow-list for the port
    pub families: Vec<FamilyReport>,
}

impl ApplyReport {
    pub fn is_declared(&self) -> bool {
        !self.families.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        self.families
            .iter()
            .any(|f| matches!(f.outcome, FamilyOutcome::Failed { .. }))
    }
}

impl Engine {
    /// Brings the chains of `port` in line with the entries declared in
    /// `source`. Safe to repeat: chains are rebuilt from scratch and jump
    /// rules are only inserted when missing.
    pub fn apply(&mut self, port: Port, source: &dyn EntrySource) -> ApplyReport {
        let mut declared = Vec::new();
        for family in Family::ALL {
            match source.entries(port, family) {
                Ok(entries) => declared.push((family, entries.map(Ok))),
                Err(e) => declared.push((family, Some(Err(format!("{:#}", e))))),
            }
        }

        if declared.iter().all(|(_, entries)| entries.is_none()) {
            log::warn!("No allow-list declared for port {}, skipping", port);
            return ApplyReport {
                port,
                families: Vec::new(),
            };
        }

        let marker = self.marker.clone();
        let mut families = Vec::new();

        for (family, entries) in declared {
            let chain = family.chain_name(port);
            let outcome = match (entries, self.table_mut(family)) {
                (None, _) => {
                    log::warn!(
                        "[{}] No allow-list declared for port {}, skipping family",
                        family,
                        port
                    );
                    FamilyOutcome::NotDeclared
                }
                (Some(_), None) => {
                    log::warn!(
                        "[{}] Rule table unavailable, skipping port {}",
                        family,
                        port
                    );
                    FamilyOutcome::Unavailable
                }
                (Some(Err(error)), Some(_)) => {
                    log::error!("[{}] Port {}: {}", family, port, error);
                    FamilyOutcome::Failed { chain, error }
                }
                (Some(Ok(entries)), Some(table)) => {
                    match rebuild_chain(table, port, &chain, &entries, &marker) {
                        Ok((accepted, skipped)) => {
                            log::info!(
                                "[{}] Port {}: {} accepted, {} skipped",
                                family,
                                port,
                                accepted,
                                skipped.len()
                            );
                            FamilyOutcome::Applied {
                                chain,
                                accepted,
                                skipped,
                            }
                        }
                        Err(e) => {
                            log::error!("[{}] Failed to apply port {}: {}", family, port, e);
                            FamilyOutcome::Failed {
                                chain,
                                error: e.to_string(),
                            }
                        }
                    }
                }
            };

            families.push(FamilyReport { family, outcome });
        }

        ApplyReport { port, families }
    }
}

/// Empties `chain`, puts the DROP rule in first and inserts the accept rules
/// above it, so an interrupted rebuild denies rather than allows. Then wires
/// the chain into INPUT for TCP and UDP.
fn rebuild_chain(
    table: &mut RuleTable,
    port: Port,
    chain: &str,
    entries: &[String],
    marker: &Marker,
) -> Result<(usize, Vec<String>), BackendError> {
    let family = table.family();

    table.ensure_empty_chain(chain)?;
    table.append_rule(chain, RuleSpec::drop_all(marker))?;

    let mut accepted = 0;
    let mut skipped = Vec::new();

    for entry in entries {
        // A refused entry cannot be told apart from a transient failure of the
        // tool; both count as skipped
        match table.insert_rule(chain, accepted + 1, RuleSpec::accept_source(entry, marker)) {
            Ok(()) => accepted += 1,
            Err(e) => {
                log::warn!(
                    "[{}] Port {}: skipping invalid entry '{}': {}",
                    family,
                    port,
                    entry,
                    e
                );
                skipped.push(entry.clone());
            }
        }
    }

    // Exactly one jump per protocol; copies left by earlier runs or by hand
    // are trimmed
    let dump = table.dump()?;
    let dport = port.to_string();
    for protocol in Protocol::ALL {
        let jump = RuleSpec::jump(protocol, port, chain);
        let copies = dump
            .jumps_to(chain)
            .filter(|r| r.option("-p") == Some(protocol.name()))
            .filter(|r| r.option("--dport") == Some(dport.as_str()))
            .count();

        for _ in 1..copies {
            match table.delete_rule(INPUT_CHAIN, &jump) {
                Ok(()) => log::info!(
                    "[{}] Removed duplicate {} jump for port {} into {}",
                    family,
                    protocol,
                    port,
                    chain
                ),
                Err(e) => {
                    log::warn!("[{}] Failed to remove duplicate {} jump: {}", family, protocol, e);
                    break;
                }
            }
        }

        if table.ensure_input_rule(jump)? {
            log::debug!("[{}] Added {} jump for port {} into {}", family, protocol, port, chain);
        }
    }

    Ok((accepted, skipped))
}
