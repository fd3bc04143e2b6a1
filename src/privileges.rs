use anyhow::Context;
use std::io::{BufRead, Write};
use std::os::fd::AsFd;

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

pub fn stdin_is_terminal() -> bool {
    nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false)
}

/// Asks a yes/no question on the terminal, defaulting to no
pub fn confirm(question: &str) -> anyhow::Result<bool> {
    // The prompt goes to stderr, stdout only carries summaries
    eprint!("{} [y/N]: ", question);
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut input)
        .context("Failed to read confirmation")?;

    Ok(is_yes(&input))
}

fn is_yes(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_explicit_yes_confirms() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }
}
