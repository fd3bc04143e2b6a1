use crate::port::Port;
use std::fmt;

/// Address family. Each family has its own rule table, chain naming and
/// declared entry list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Ipv4, Family::Ipv6];

    /// Family of a raw allow-list entry. Only the syntax is considered:
    /// anything containing a colon is IPv6.
    pub fn of_entry(entry: &str) -> Family {
        if entry.contains(':') {
            Family::Ipv6
        } else {
            Family::Ipv4
        }
    }

    pub fn chain_prefix(self) -> &'static str {
        match self {
            Family::Ipv4 => "IPALLOW_",
            Family::Ipv6 => "IPALLOW6_",
        }
    }

    pub fn chain_name(self, port: Port) -> String {
        format!("{}{}", self.chain_prefix(), port)
    }

    /// Inverse of [`Family::chain_name`]. Only the canonical spelling maps
    /// back to a port, `IPALLOW_0443` is not ours.
    pub fn port_of_chain(self, chain: &str) -> Option<Port> {
        let port = chain.strip_prefix(self.chain_prefix())?.parse().ok()?;
        (self.chain_name(port) == chain).then_some(port)
    }

    /// File name of the declared entry list inside a port directory
    pub fn list_file_name(self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4.list",
            Family::Ipv6 => "ipv6.list",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Family::Ipv4 => write!(f, "ipv4"),
            Family::Ipv6 => write!(f, "ipv6"),
        }
    }
}
