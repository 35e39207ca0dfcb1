//! Minimal CLI parsing for the mediasweep binary.

use std::env;

/// What the binary should do
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Command {
    /// Scan every configured root and write a report
    #[default]
    Scan,
    ListBackups,
    VerifyBackup(String),
    RevertBackup(String),
}

#[derive(Debug, Default)]
pub struct CliOptions {
    pub command: Command,
    /// Human-readable logs instead of JSON
    pub plain_logs: bool,
    /// Explicit confirmation for destructive commands
    pub confirmed: bool,
}

impl CliOptions {
    pub fn from_args() -> Self {
        Self::parse(env::args().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut options = CliOptions::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "scan" => options.command = Command::Scan,
                "backups" => options.command = Command::ListBackups,
                "verify" => {
                    if let Some(id) = args.next() {
                        options.command = Command::VerifyBackup(id);
                    }
                }
                "revert" => {
                    if let Some(id) = args.next() {
                        options.command = Command::RevertBackup(id);
                    }
                }
                "--plain" => options.plain_logs = true,
                "--yes" | "-y" => options.confirmed = true,
                _ => {}
            }
        }
        options
    }
}
