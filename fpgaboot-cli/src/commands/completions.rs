//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN_NAME: &str = "fpgaboot";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    generate(shell, &mut Cli::command(), BIN_NAME, &mut io::stdout());
}

/// Generate completions and write them where `shell` picks them up.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => env::var("SHELL")
            .ok()
            .and_then(|path| shell_from_path(&path))
            .context(
                "Could not detect your shell. Please specify it explicitly:\n  \
                 fpgaboot completions --install bash",
            )?,
    };

    let path = install_path(shell)?;

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), BIN_NAME, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );
    if shell == Shell::Zsh {
        eprintln!(
            "Make sure {} is in your ~/.zshrc, then run {}",
            style("fpath=(~/.zfunc $fpath)").cyan(),
            style("exec zsh").cyan()
        );
    }

    Ok(())
}

/// Map a shell binary path to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path).file_name()?.to_str()?;
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Completion script location for `shell`.
fn install_path(shell: Shell) -> Result<PathBuf> {
    let home = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .context("Could not determine home directory")?;
    let config = env::var("XDG_CONFIG_HOME").map_or_else(|_| home.join(".config"), PathBuf::from);
    let data = env::var("XDG_DATA_HOME")
        .map_or_else(|_| home.join(".local").join("share"), PathBuf::from);

    Ok(match shell {
        Shell::Bash => data.join("bash-completion/completions").join(BIN_NAME),
        Shell::Zsh => home.join(".zfunc").join(format!("_{BIN_NAME}")),
        Shell::Fish => config.join("fish/completions").join(format!("{BIN_NAME}.fish")),
        Shell::Elvish => config.join("elvish/lib").join(format!("{BIN_NAME}.elv")),
        Shell::PowerShell => config
            .join("powershell/completions")
            .join(format!("{BIN_NAME}.ps1")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    })
}
