//! Shell completion generation.

use {
    crate::Cli,
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    std::io::{self, Write},
};

/// Write the completion script for `shell` to `out`.
fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    write_completions(shell, &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_completions_cover_subcommands() {
        let mut buf = Vec::new();
        write_completions(Shell::Bash, &mut buf);
        let script = String::from_utf8(buf).unwrap();

        assert!(script.contains("_hactarflash()"));
        for sub in ["flash", "scan", "list-ports", "chip-info"] {
            assert!(script.contains(sub), "missing {sub}");
        }
    }

    #[test]
    fn test_fish_completions_mention_chips_flag() {
        let mut buf = Vec::new();
        write_completions(Shell::Fish, &mut buf);
        let script = String::from_utf8(buf).unwrap();
        assert!(script.contains("chips"));
    }
}
