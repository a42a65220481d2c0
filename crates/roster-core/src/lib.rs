pub mod api;
pub mod appraisal;
pub mod claim;
pub mod cli;
pub mod commands;
pub mod config;
pub mod controller;
pub mod datetime;
pub mod deferred;
pub mod facts;
pub mod http;
pub mod interval;
pub mod normalize;
pub mod notice;
pub mod render;
pub mod store;
pub mod task;

use std::ffi::OsString;

use clap::{
  CommandFactory,
  Parser
};
use tracing::{
  debug,
  info
};

/// Entry point for the `roster`
/// binary. Must run inside a tokio
/// runtime.
#[tracing::instrument(skip_all)]
pub async fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args);
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting roster CLI"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let Some(command) = cli.command
  else {
    cli::GlobalCli::command()
      .print_help()?;
    return Ok(());
  };

  let mut cfg = config::Config::load(
    cli.rosterrc.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  let tz = *datetime::project_timezone();
  let session =
    commands::Session::new(cfg, tz)?;
  commands::dispatch(&session, command)
    .await?;

  info!("done");
  Ok(())
}
