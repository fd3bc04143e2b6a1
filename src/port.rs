use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A TCP/UDP destination port managed by this tool (1-65535)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(u16);

#[derive(Debug, Error, PartialEq)]
pub enum PortError {
    #[error("Invalid port '{0}': expected a number between 1 and 65535")]
    Invalid(String),
}

impl Port {
    pub fn new(value: u16) -> Result<Self, PortError> {
        if value == 0 {
            return Err(PortError::Invalid(value.to_string()));
        }
        Ok(Self(value))
    }
}

impl FromStr for Port {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();

        // u16::from_str accepts a leading '+', which is not a port number
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PortError::Invalid(s.to_string()));
        }

        let value = u16::from_str(trimmed).map_err(|_| PortError::Invalid(s.to_string()))?;
        Self::new(value).map_err(|_| PortError::Invalid(s.to_string()))
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validates every token before anything is done with them, so a single bad
/// token aborts the whole batch. Duplicates are removed, first occurrence wins.
pub fn parse_port_list<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<Port>, PortError> {
    let mut ports = Vec::with_capacity(tokens.len());
    for token in tokens {
        let port = Port::from_str(token.as_ref())?;
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    Ok(ports)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_valid_range() {
        assert_eq!(Port::from_str("1"), Port::new(1));
        assert_eq!(Port::from_str(" 443 "), Port::new(443));
        assert_eq!(Port::from_str("65535"), Port::new(65535));
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        for token in ["0", "65536", "-1", "+80", "", "http", "80a", "4 43"] {
            assert_eq!(
                Port::from_str(token),
                Err(PortError::Invalid(token.to_string())),
                "token {token:?}"
            );
        }
    }

    #[test]
    fn port_list_is_validated_before_use() {
        assert_eq!(
            parse_port_list(&["443", "99999", "80"]),
            Err(PortError::Invalid("99999".to_string()))
        );
    }

    #[test]
    fn port_list_deduplicates_in_order() {
        let ports = parse_port_list(&["8080", "443", "8080", "443"]).unwrap();
        assert_eq!(
            ports.iter().map(Port::to_string).collect::<Vec<_>>(),
            vec!["8080", "443"]
        );
    }
}
