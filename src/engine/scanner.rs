use super::Engine;
use crate::family::Family;
use crate::port::Port;
use crate::rule_text::RuleDump;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("No rule table could be read")]
    NothingReadable,
}

/// Number of marker-tagged accept rules per family for one port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortCounts {
    pub port: Port,
    pub ipv4: usize,
    pub ipv6: usize,
}

impl Engine {
    /// Dumps of every readable family. Unreadable families are left out; it is
    /// an error only if none can be read.
    fn dumps(&mut self) -> Result<Vec<(Family, RuleDump)>, ScanError> {
        let mut dumps = Vec::new();

        for table in &mut self.tables {
            let family = table.family();
            match table.dump() {
                Ok(dump) => dumps.push((family, dump)),
                Err(e) => log::warn!("[{}] Failed to read rules, ignoring family: {}", family, e),
            }
        }

        if dumps.is_empty() {
            return Err(ScanError::NothingReadable);
        }
        Ok(dumps)
    }

    pub fn list_managed_ports(&mut self) -> Result<BTreeSet<Port>, ScanError> {
        Ok(managed_ports(&self.dumps()?))
    }

    pub fn counts_for(&mut self, port: Port) -> Result<PortCounts, ScanError> {
        Ok(counts(&self.dumps()?, port))
    }

    /// Every managed port with its counts, from a single read of the tables
    pub fn managed_summary(&mut self) -> Result<Vec<PortCounts>, ScanError> {
        let dumps = self.dumps()?;
        Ok(managed_ports(&dumps)
            .into_iter()
            .map(|port| counts(&dumps, port))
            .collect())
    }
}

fn managed_ports(dumps: &[(Family, RuleDump)]) -> BTreeSet<Port> {
    dumps
        .iter()
        .flat_map(|(family, dump)| dump.managed_ports(*family))
        .collect()
}

fn counts(dumps: &[(Family, RuleDump)], port: Port) -> PortCounts {
    let mut counts = PortCounts {
        port,
        ipv4: 0,
        ipv6: 0,
    };

    for (family, dump) in dumps {
        let accepted = dump.accepted_sources(&family.chain_name(port)).len();
        match family {
            Family::Ipv4 => counts.ipv4 = accepted,
            Family::Ipv6 => counts.ipv6 = accepted,
        }
    }

    counts
}
