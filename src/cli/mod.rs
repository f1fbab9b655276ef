//! Command-line front end over the archiver and the scheduler.

mod commands;
pub mod output;

use std::env;

use strsim::levenshtein;
use thiserror::Error;

use crate::errors::BackupError;

/// Commands understood by `cripta_backup_cli`.
pub const COMMANDS: &[&str] = &[
    "create", "restore", "verify", "list", "delete", "info", "report", "schedule", "run",
    "version", "help",
];

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Failed(String),
}

pub type CliResult = Result<(), CliError>;

/// Runs the command named by the process arguments.
pub fn run_cli() -> CliResult {
    run_with_args(env::args().skip(1))
}

pub fn run_with_args<I>(args: I) -> CliResult
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    let Some((command, rest)) = args.split_first() else {
        print_usage();
        return Err(CliError::Usage("missing command".into()));
    };
    let rest: Vec<&str> = rest.iter().map(String::as_str).collect();

    match command.to_lowercase().as_str() {
        "help" => {
            print_usage();
            Ok(())
        }
        "version" => commands::version(),
        known if COMMANDS.iter().any(|name| *name == known) => {
            let ctx = commands::Context::open()?;
            let result = ctx.dispatch(known, &rest);
            if matches!(result, Err(CliError::Usage(_))) {
                print_usage();
            }
            result
        }
        _ => {
            if let Some(best) = suggest_command(command) {
                output::warning(format!("Unknown command `{command}`. Did you mean `{best}`?"));
            } else {
                output::warning(format!("Unknown command `{command}`."));
            }
            print_usage();
            Err(CliError::Usage(format!("unknown command `{command}`")))
        }
    }
}

/// Closest known command within an edit distance of 3.
pub fn suggest_command(input: &str) -> Option<&'static str> {
    let input = input.to_lowercase();
    COMMANDS
        .iter()
        .map(|name| (levenshtein(name, &input), *name))
        .min_by_key(|(distance, _)| *distance)
        .filter(|(distance, _)| *distance <= 3)
        .map(|(_, name)| name)
}

fn print_usage() {
    eprintln!(
        "Usage: cripta_backup_cli <command>\n\
         Commands:\n  \
         create [name]          create a snapshot now\n  \
         restore <archive>      restore the live data from an archive\n  \
         verify <archive>       check an archive's integrity\n  \
         list                   list snapshots, newest first\n  \
         delete <file>          delete a snapshot from the backup directory\n  \
         info <file>            show a snapshot's entries and metadata\n  \
         report [path]          export a JSON report of all snapshots\n  \
         schedule [day time]    show or change the weekly schedule\n  \
         run                    run the scheduler until stdin closes\n  \
         version                show build information"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggests_close_commands() {
        assert_eq!(suggest_command("lsit"), Some("list"));
        assert_eq!(suggest_command("restroe"), Some("restore"));
        assert_eq!(suggest_command("SCHEDUEL"), Some("schedule"));
        assert_eq!(suggest_command("completely-unrelated"), None);
    }

    #[test]
    fn unknown_and_missing_commands_are_usage_errors() {
        assert!(matches!(run_with_args(Vec::new()), Err(CliError::Usage(_))));
        assert!(matches!(
            run_with_args(vec!["frobnicate".to_string()]),
            Err(CliError::Usage(_))
        ));
    }
}
