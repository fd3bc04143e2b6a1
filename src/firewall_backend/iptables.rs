use crate::family::Family;
use crate::firewall_backend::{BackendError, FirewallBackend};
use crate::rule_text::Command;
use std::path::{Path, PathBuf};

pub const IPTABLES: &str = "/usr/sbin/iptables";
pub const IP6TABLES: &str = "/usr/sbin/ip6tables";

pub struct IptablesFirewallBackend {
    program: PathBuf,
    family: Family,
}

impl IptablesFirewallBackend {
    pub fn new(program: impl Into<PathBuf>, family: Family) -> Self {
        Self {
            program: program.into(),
            family,
        }
    }

    /// Returns the backend if the tool is usable on this host, i.e. the rule
    /// table can be listed.
    pub fn probe(program: &Path, family: Family) -> Option<Self> {
        let mut backend = Self::new(program, family);
        match backend.execute(&Command::List { chain: None }) {
            Ok(_) => {
                log::debug!("Using {} for {}", program.display(), family);
                Some(backend)
            }
            Err(e) => {
                log::warn!("{} rules are unavailable: {}", family, e);
                None
            }
        }
    }

    fn handle_process_output(
        &self,
        args: &[String],
        output: std::io::Result<std::process::Output>,
    ) -> Result<String, BackendError> {
        let program = self.program.display().to_string();

        match output {
            Ok(output) => {
                if output.status.success() {
                    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
                } else {
                    let message = format!(
                        "[{}] {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim_end()
                    );
                    log::debug!("'{} {}' failed: {}", program, args.join(" "), message);
                    Err(BackendError::Rejected {
                        command: format!("{} {}", program, args.join(" ")),
                        message,
                    })
                }
            }
            Err(source) => Err(BackendError::Spawn { program, source }),
        }
    }
}

impl FirewallBackend for IptablesFirewallBackend {
    fn family(&self) -> Family {
        self.family
    }

    fn execute(&mut self, command: &Command) -> Result<String, BackendError> {
        // Wait for the xtables lock instead of failing when another actor holds it
        let mut args = vec!["-w".to_string()];
        args.extend(command.to_args());

        let output = std::process::Command::new(&self.program)
            .args(&args)
            .output();
        self.handle_process_output(&args, output)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn missing_program_is_a_spawn_error() {
        let mut backend =
            IptablesFirewallBackend::new("/nonexistent/iptables-for-tests", Family::Ipv4);
        assert_matches!(
            backend.execute(&Command::List { chain: None }),
            Err(BackendError::Spawn { .. })
        );
        assert!(
            IptablesFirewallBackend::probe(Path::new("/nonexistent/ip6tables"), Family::Ipv6)
                .is_none()
        );
    }

    #[test]
    fn failing_program_is_rejected_with_command_line() {
        // `false` ignores its arguments and exits with status 1
        let mut backend = IptablesFirewallBackend::new("false", Family::Ipv4);
        let error = backend
            .execute(&Command::FlushChain {
                chain: "IPALLOW_22".to_string(),
            })
            .unwrap_err();
        assert_matches!(&error, BackendError::Rejected { command, .. } if command == "false -w -F IPALLOW_22");
    }
}
