use crate::family::Family;
use crate::port::Port;
use anyhow::Context;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Supplier of declared entries for one (port, family)
pub trait EntrySource {
    /// Comment-free, duplicate-free entries in declaration order, or `None` if
    /// nothing is declared for this family.
    fn entries(&self, port: Port, family: Family) -> anyhow::Result<Option<Vec<String>>>;
}

/// Declared state: one directory per port below the root, holding an optional
/// entry list per family.
///
/// ```text
/// <root>/443/ipv4.list
/// <root>/443/ipv6.list
/// ```
pub struct AllowlistDir {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddSummary {
    pub family: Family,
    pub added: usize,
    pub duplicates: usize,
}

impl AllowlistDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list_path(&self, port: Port, family: Family) -> PathBuf {
        self.root
            .join(port.to_string())
            .join(family.list_file_name())
    }

    /// Entries declared for `port` in `family`, or `None` if there is no list
    /// file. Read fresh on every call.
    pub fn read_entries(&self, port: Port, family: Family) -> anyhow::Result<Option<Vec<String>>> {
        let path = self.list_path(port, family);
        if !path.is_file() {
            return Ok(None);
        }

        let file =
            File::open(&path).with_context(|| format!("Failed to open '{}'", path.display()))?;
        let entries = parse_input(BufReader::new(file))
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        Ok(Some(entries))
    }

    /// All ports with a directory below the root, in ascending order.
    /// Directories whose name is not a valid port are ignored.
    pub fn declared_ports(&self) -> anyhow::Result<Vec<Port>> {
        let dir_entries = fs::read_dir(&self.root).with_context(|| {
            format!(
                "Failed to read allow-list directory '{}'",
                self.root.display()
            )
        })?;

        let mut ports = Vec::new();
        for dir_entry in dir_entries {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }

            // Entries are read from `<root>/<port>`, so `0443` is not port 443
            let name = dir_entry.file_name();
            match name.to_str().map(|n| (n, Port::from_str(n))) {
                Some((n, Ok(port))) if port.to_string() == n => ports.push(port),
                _ => log::debug!(
                    "Ignoring '{}': not a port directory",
                    dir_entry.path().display()
                ),
            }
        }

        ports.sort();
        Ok(ports)
    }

    /// Appends entries to the list of their family, skipping entries that are
    /// already declared. Creates the port directory and list files as needed.
    pub fn add_entries<S: AsRef<str>>(
        &self,
        port: Port,
        entries: &[S],
    ) -> anyhow::Result<Vec<AddSummary>> {
        let mut summaries = Vec::new();

        for family in Family::ALL {
            let new_entries = entries
                .iter()
                .filter_map(|e| clean_line(e.as_ref()))
                .filter(|e| Family::of_entry(e) == family)
                .collect::<Vec<_>>();

            if new_entries.is_empty() {
                continue;
            }

            let mut known = self.read_entries(port, family)?.unwrap_or_default();
            let mut summary = AddSummary {
                family,
                added: 0,
                duplicates: 0,
            };
            let mut to_write = Vec::new();

            for entry in new_entries {
                if known.iter().any(|k| k == entry) {
                    summary.duplicates += 1;
                } else {
                    known.push(entry.to_string());
                    to_write.push(entry);
                    summary.added += 1;
                }
            }

            if !to_write.is_empty() {
                self.append_lines(port, family, &to_write)?;
            }

            summaries.push(summary);
        }

        Ok(summaries)
    }

    fn append_lines(&self, port: Port, family: Family, lines: &[&str]) -> anyhow::Result<()> {
        let path = self.list_path(port, family);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }

        // Make sure we don't glue the first new entry onto an unterminated last line
        let needs_newline = fs::read(&path)
            .map(|content| !content.is_empty() && !content.ends_with(b"\n"))
            .unwrap_or(false);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open '{}' for writing", path.display()))?;

        if needs_newline {
            writeln!(file)?;
        }
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        file.flush()?;

        Ok(())
    }
}

impl EntrySource for AllowlistDir {
    fn entries(&self, port: Port, family: Family) -> anyhow::Result<Option<Vec<String>>> {
        self.read_entries(port, family)
    }
}

/// Parses an entry list: one address or CIDR per line, `#` starts a comment,
/// blank lines are ignored. The result keeps source order and contains every
/// entry only once.
pub fn parse_input(reader: impl BufRead) -> anyhow::Result<Vec<String>> {
    let mut entries: Vec<String> = Vec::new();

    for (line_number, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_number))?;
        if let Some(entry) = clean_line(&line) {
            if !entries.iter().any(|e| e == entry) {
                entries.push(entry.to_string());
            }
        }
    }

    Ok(entries)
}

fn clean_line(line: &str) -> Option<&str> {
    let line = line.split('#').next().unwrap_or_default().trim(); // Ignore comment part
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}
