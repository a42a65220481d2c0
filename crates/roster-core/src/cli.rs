use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "roster",
    version,
    about = "Roster: claim, complete and flag staff tasks",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append,
        global = true
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "rosterrc", global = true)]
    pub rosterrc: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List tasks by bucket.
    Tasks(TasksArgs),

    /// Show one task, how it opens, and its checklist.
    Show { id: String },

    /// Claim a global task.
    Claim { id: String },

    /// Claim every task in an applicant's group.
    ClaimAll { group: String },

    /// Mark a task completed after the undo window.
    Complete { id: String },

    /// Release a claimed task after the undo window.
    Unclaim { id: String },

    /// Flag a task for attention.
    Flag {
        id: String,
        #[arg(required = true, num_args = 1..)]
        reason: Vec<String>,
    },

    /// Resolve a flag, optionally completing the task too.
    Resolve {
        id: String,
        #[arg(long, short = 'n', default_value = "")]
        note: String,
        #[arg(long)]
        complete: bool,
    },

    /// Edit a task's tracked fields.
    Edit(EditArgs),

    /// Book an appraisal slot for an applicant task.
    Slot(SlotArgs),

    /// Tick or untick onboarding checklist items for a task.
    Check {
        id: String,
        #[arg(long = "add", action = ArgAction::Append)]
        add: Vec<String>,
        #[arg(long = "remove", action = ArgAction::Append)]
        remove: Vec<String>,
    },

    /// Hide the dashboard banner for a while.
    SnoozeBanner {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct TasksArgs {
    /// Only this bucket: upcoming, overdue or flagged.
    #[arg(long)]
    pub bucket: Option<String>,

    /// Only tasks assigned to the configured actor.
    #[arg(long)]
    pub mine: bool,

    /// Only unclaimed tasks.
    #[arg(long, conflicts_with = "mine")]
    pub global: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    pub id: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long)]
    pub priority: Option<String>,
    #[arg(long)]
    pub assignee: Option<String>,
    #[arg(long)]
    pub due: Option<String>,
    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct SlotArgs {
    pub id: String,
    /// Local date, e.g. 2024-06-10.
    #[arg(long)]
    pub date: String,
    /// Local start time, e.g. 09:30.
    #[arg(long)]
    pub start: String,
    #[arg(long)]
    pub end: String,
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = match (quiet, verbose) {
        (2.., _) => "error",
        (1, _) => "warn",
        (0, 3..) => "trace",
        (0, 2) => "debug",
        (0, 1) => "info",
        _ => "warn",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls positional `rc.key=value` overrides out before clap sees them.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> PreprocessedArgs {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.")
            && let Some((k, v)) = rest.split_once('=').or_else(|| rest.split_once(':'))
        {
            debug!(key = %k, value = %v, "captured positional rc override");
            overrides.push((format!("rc.{k}"), v.to_string()));
            continue;
        }
        cleaned.push(arg);
    }

    PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn positional_rc_overrides_are_extracted() {
        let pre = preprocess_args(&args(&[
            "roster",
            "rc.color=off",
            "complete",
            "rc.deferred.complete.delay_ms:100",
            "T1",
        ]));
        assert_eq!(pre.cleaned_args, args(&["roster", "complete", "T1"]));
        assert_eq!(
            pre.rc_overrides,
            vec![
                ("rc.color".to_string(), "off".to_string()),
                ("rc.deferred.complete.delay_ms".to_string(), "100".to_string()),
            ]
        );
    }

    #[test]
    fn resolve_subcommand_parses_flags() {
        let cli = GlobalCli::parse_from(["roster", "-v", "resolve", "T3", "--note", "ok", "--complete"]);
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Some(Command::Resolve { id, note, complete }) => {
                assert_eq!(id, "T3");
                assert_eq!(note, "ok");
                assert!(complete);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn flag_reason_words_are_collected() {
        let cli = GlobalCli::parse_from(["roster", "flag", "T9", "missing", "paperwork"]);
        match cli.command {
            Some(Command::Flag { id, reason }) => {
                assert_eq!(id, "T9");
                assert_eq!(reason.join(" "), "missing paperwork");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
