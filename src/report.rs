use crate::allowlist::AddSummary;
use crate::engine::{ApplyReport, FamilyOutcome, PortCounts, RemovalReport};
use crate::port::Port;
use std::io::Write;

/// Writes the machine-readable summary lines. Diagnostics never go here; they
/// are logged to stderr.
pub struct Summary<W: Write> {
    out: W,
}

impl Summary<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> Summary<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn applied(&mut self, report: &ApplyReport) -> std::io::Result<()> {
        for family_report in &report.families {
            let family = family_report.family;
            match &family_report.outcome {
                FamilyOutcome::Applied {
                    chain,
                    accepted,
                    skipped,
                } => writeln!(
                    self.out,
                    "port={} family={} chain={} accepted={} skipped={}",
                    report.port,
                    family,
                    chain,
                    accepted,
                    skipped.len()
                )?,
                FamilyOutcome::Failed { chain, .. } => writeln!(
                    self.out,
                    "port={} family={} chain={} failed",
                    report.port, family, chain
                )?,
                FamilyOutcome::NotDeclared | FamilyOutcome::Unavailable => {}
            }
        }
        Ok(())
    }

    pub fn managed(&mut self, ports: &[PortCounts]) -> std::io::Result<()> {
        for counts in ports {
            writeln!(
                self.out,
                "port={} ipv4={} ipv6={}",
                counts.port, counts.ipv4, counts.ipv6
            )?;
        }
        Ok(())
    }

    pub fn removed(&mut self, reports: &[RemovalReport]) -> std::io::Result<()> {
        for report in reports {
            writeln!(self.out, "port={} deleted={}", report.port, report.deleted)?;
        }
        let total = reports.iter().map(|r| r.deleted).sum::<usize>();
        writeln!(self.out, "total deleted={}", total)
    }

    pub fn added(&mut self, port: Port, summaries: &[AddSummary]) -> std::io::Result<()> {
        for summary in summaries {
            writeln!(
                self.out,
                "port={} family={} added={} duplicates={}",
                port, summary.family, summary.added, summary.duplicates
            )?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}
