//! Shell completion generation.

use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io;

use crate::Cli;

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(shell: Shell) -> String {
        let mut cmd = Cli::command();
        let mut out = Vec::new();
        generate(shell, &mut cmd, "flashdock", &mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_bash_completions_list_subcommands() {
        let script = render(Shell::Bash);
        assert!(script.contains("flashdock"));
        assert!(script.contains("list-ports"));
        assert!(script.contains("read-mac"));
    }

    #[test]
    fn test_fish_completions_include_global_flags() {
        let script = render(Shell::Fish);
        assert!(script.contains("chip"));
        assert!(script.contains("port"));
    }
}
