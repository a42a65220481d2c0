use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use chrono::{Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, instrument, warn};

use crate::appraisal::AppraisalScheduler;
use crate::claim::{ClaimAllOutcome, ClaimOutcome};
use crate::cli::{Command, EditArgs, SlotArgs, TasksArgs};
use crate::config::Config;
use crate::controller::{CommitOutcome, EditOutcome, TaskController};
use crate::datetime::{local_date_in, parse_clock_time, parse_input_date};
use crate::deferred::{DeferredOutcome, Scheduled};
use crate::facts::FactStore;
use crate::http::HttpBackend;
use crate::interval::AppointmentDraft;
use crate::render::Renderer;
use crate::task::{Bucket, OpenMode, StaffId, Task, TaskDraft, TaskId};

/// Everything a command needs, built once per invocation.
pub struct Session {
    pub cfg: Config,
    pub backend: Arc<HttpBackend>,
    pub controller: TaskController<HttpBackend>,
    pub renderer: Renderer,
    pub tz: Tz,
}

impl Session {
    pub fn new(cfg: Config, tz: Tz) -> anyhow::Result<Self> {
        let backend = Arc::new(HttpBackend::new(
            cfg.api_url(),
            cfg.api_timeout()?,
            cfg.actor(),
        )?);
        let controller = TaskController::new(Arc::clone(&backend), cfg.deferred_delays()?);
        let renderer = Renderer::new(&cfg);
        Ok(Self {
            cfg,
            backend,
            controller,
            renderer,
            tz,
        })
    }

    fn open_facts(&self) -> anyhow::Result<FactStore> {
        let path = self.cfg.facts_path();
        let mut facts = FactStore::open(&path, self.cfg.fact_policy()?)
            .with_context(|| format!("failed to open fact store at {}", path.display()))?;
        facts.purge_expired(Utc::now())?;
        Ok(facts)
    }

    /// Loads staff names (best effort) and the current task list.
    async fn load(&self) -> anyhow::Result<()> {
        if let Err(err) = self.controller.load_staff(self.backend.as_ref()).await {
            warn!(error = %err, "could not load staff directory; showing raw ids");
        }
        self.controller
            .refresh()
            .await
            .with_context(|| format!("failed to load tasks from {}", self.backend.base_url()))?;
        Ok(())
    }

    fn task(&self, id: &TaskId) -> anyhow::Result<Task> {
        self.controller
            .store()
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no open task with id {id}"))
    }

    fn flush_notices(&self) -> anyhow::Result<()> {
        let notices = self.controller.notices().drain();
        self.renderer.print_notices(&notices)
    }
}

#[instrument(skip(session, command))]
pub async fn dispatch(session: &Session, command: Command) -> anyhow::Result<()> {
    debug!(?command, "dispatching command");

    match command {
        Command::Tasks(args) => cmd_tasks(session, args).await,
        Command::Show { id } => cmd_show(session, TaskId::new(id)).await,
        Command::Claim { id } => cmd_claim(session, TaskId::new(id)).await,
        Command::ClaimAll { group } => cmd_claim_all(session, &group).await,
        Command::Complete { id } => {
            session.load().await?;
            let scheduled = session.controller.complete(&TaskId::new(id))?;
            wait_or_undo(session, scheduled).await
        }
        Command::Unclaim { id } => {
            session.load().await?;
            let scheduled = session.controller.unclaim(&TaskId::new(id))?;
            wait_or_undo(session, scheduled).await
        }
        Command::Resolve { id, note, complete } => {
            session.load().await?;
            let id = TaskId::new(id);
            let scheduled = if complete {
                session.controller.resolve_and_complete(&id, &note)?
            } else {
                session.controller.resolve_flag(&id, &note)?
            };
            wait_or_undo(session, scheduled).await
        }
        Command::Flag { id, reason } => cmd_flag(session, TaskId::new(id), &reason.join(" ")).await,
        Command::Edit(args) => cmd_edit(session, args).await,
        Command::Slot(args) => cmd_slot(session, args).await,
        Command::Check { id, add, remove } => cmd_check(session, TaskId::new(id), add, remove),
        Command::SnoozeBanner { hours } => {
            let now = Utc::now();
            let until = now + ChronoDuration::hours(i64::from(hours));
            session.open_facts()?.snooze_banner(until, now)?;
            println!("Banner hidden until {}.", until.with_timezone(&session.tz).format("%Y-%m-%d %H:%M"));
            Ok(())
        }
    }
}

#[instrument(skip(session, args))]
async fn cmd_tasks(session: &Session, args: TasksArgs) -> anyhow::Result<()> {
    info!("command tasks");
    let only = match args.bucket.as_deref() {
        Some(raw) => Some(
            Bucket::ALL
                .into_iter()
                .find(|bucket| bucket.label().eq_ignore_ascii_case(raw.trim()))
                .ok_or_else(|| anyhow!("unknown bucket {raw:?}; use upcoming, overdue or flagged"))?,
        ),
        None => None,
    };
    let actor = if args.mine {
        Some(StaffId::new(
            session
                .cfg
                .actor()
                .ok_or_else(|| anyhow!("--mine needs `actor` set in the rosterrc"))?,
        ))
    } else {
        None
    };

    session.load().await?;
    let now = Utc::now();
    let facts = session.open_facts()?;
    let staff = session.controller.staff();
    let store = session.controller.store().lock();

    let counts = store.counts();
    if !facts.banner_snoozed(now) && counts.overdue + counts.flagged > 0 {
        println!(
            "{} overdue and {} flagged tasks need attention (`roster snooze-banner` hides this).\n",
            counts.overdue, counts.flagged
        );
    }

    let today = local_date_in(now, &session.tz);
    session.renderer.print_buckets(&store, &staff, today, |task| {
        only.is_none_or(|bucket| task.bucket() == Some(bucket))
            && actor.as_ref().is_none_or(|me| task.is_assigned_to(me))
            && (!args.global || task.is_global())
    })?;
    Ok(())
}

#[instrument(skip(session))]
async fn cmd_show(session: &Session, id: TaskId) -> anyhow::Result<()> {
    session.load().await?;
    let task = session.task(&id)?;
    let now = Utc::now();
    let mut facts = session.open_facts()?;
    let first_seen = facts.first_seen(&id, now)?;

    session.renderer.print_task(&task, &session.controller.staff())?;
    println!(
        "first seen {}",
        first_seen.with_timezone(&session.tz).format("%Y-%m-%d %H:%M")
    );
    let checklist = facts.checklist(&id, now);
    if !checklist.is_empty() {
        let items: Vec<&str> = checklist.iter().map(String::as_str).collect();
        println!("checked   {}", items.join(", "));
    }
    if task.open_mode() == OpenMode::Appraisal {
        println!("book with `roster slot {id} --date YYYY-MM-DD --start HH:MM --end HH:MM`");
    }
    Ok(())
}

#[instrument(skip(session))]
async fn cmd_claim(session: &Session, id: TaskId) -> anyhow::Result<()> {
    session.load().await?;
    if !session.controller.claims().can_claim(&id) {
        bail!("task {id} is not an unclaimed task");
    }
    let outcome = session.controller.claim(&id).await;
    session.flush_notices()?;
    match outcome {
        ClaimOutcome::Failed(message) => Err(anyhow!("claim failed: {message}")),
        _ => Ok(()),
    }
}

#[instrument(skip(session))]
async fn cmd_claim_all(session: &Session, group: &str) -> anyhow::Result<()> {
    session.load().await?;
    let outcome = session.controller.claim_all(group).await;
    session.flush_notices()?;
    match outcome {
        ClaimAllOutcome::Completed { .. } => Ok(()),
        ClaimAllOutcome::Failed(message) => Err(anyhow!("claim-all failed: {message}")),
    }
}

#[instrument(skip(session, reason))]
async fn cmd_flag(session: &Session, id: TaskId, reason: &str) -> anyhow::Result<()> {
    session.load().await?;
    let outcome = session.controller.flag(&id, reason).await?;
    session.flush_notices()?;
    match outcome {
        CommitOutcome::Committed => Ok(()),
        CommitOutcome::Failed(message) => Err(anyhow!("flag failed: {message}")),
    }
}

#[instrument(skip(session, args), fields(task = %args.id))]
async fn cmd_edit(session: &Session, args: EditArgs) -> anyhow::Result<()> {
    session.load().await?;
    let original = session.task(&TaskId::new(args.id.as_str()))?;

    let mut draft = TaskDraft::from_task(&original);
    let edits = [
        (args.title, &mut draft.title),
        (args.description, &mut draft.description),
        (args.status, &mut draft.status),
        (args.priority, &mut draft.priority),
        (args.assignee, &mut draft.assignee),
        (args.due, &mut draft.due_date),
        (args.reason, &mut draft.flagged_reason),
    ];
    for (value, field) in edits {
        if let Some(value) = value {
            *field = value;
        }
    }

    let outcome = session.controller.save_edit(&original, &draft).await?;
    session.flush_notices()?;
    match outcome {
        EditOutcome::Unchanged => {
            println!("Nothing changed.");
            Ok(())
        }
        EditOutcome::Saved => Ok(()),
        EditOutcome::Failed(message) => Err(anyhow!("save failed: {message}")),
    }
}

#[instrument(skip(session, args), fields(task = %args.id))]
async fn cmd_slot(session: &Session, args: SlotArgs) -> anyhow::Result<()> {
    session.load().await?;
    let task = session.task(&TaskId::new(args.id.as_str()))?;
    if task.open_mode() != OpenMode::Appraisal {
        bail!("task {} is not an appraisal task", task.id);
    }

    let date = parse_input_date(&args.date).ok_or_else(|| anyhow!("unrecognized date {:?}", args.date))?;
    let start =
        parse_clock_time(&args.start).ok_or_else(|| anyhow!("unrecognized time {:?}", args.start))?;
    let end = parse_clock_time(&args.end).ok_or_else(|| anyhow!("unrecognized time {:?}", args.end))?;
    let draft = AppointmentDraft::new(date, start, end);

    let mut scheduler = AppraisalScheduler::new(
        Arc::clone(&session.backend),
        session.tz,
        session.controller.notices().clone(),
    );
    let outcome = scheduler.book(&task, &draft).await?;
    session.flush_notices()?;
    match outcome {
        CommitOutcome::Committed => Ok(()),
        CommitOutcome::Failed(message) => Err(anyhow!("booking failed: {message}")),
    }
}

#[instrument(skip(session, add, remove))]
fn cmd_check(
    session: &Session,
    id: TaskId,
    add: Vec<String>,
    remove: Vec<String>,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let mut facts = session.open_facts()?;
    let mut items: BTreeSet<String> = facts.checklist(&id, now);
    items.extend(add.into_iter().map(|item| item.trim().to_string()).filter(|item| !item.is_empty()));
    for item in &remove {
        items.remove(item.trim());
    }
    facts.set_checklist(&id, &items, now)?;

    if items.is_empty() {
        println!("Nothing checked for task {id}.");
    } else {
        let listed: Vec<&str> = items.iter().map(String::as_str).collect();
        println!("Checked for task {id}: {}", listed.join(", "));
    }
    Ok(())
}

/// Waits out the undo window. Ctrl-C undoes the action instead.
async fn wait_or_undo(session: &Session, scheduled: Scheduled) -> anyhow::Result<()> {
    let ticket = match scheduled {
        Scheduled::Pending(ticket) => ticket,
        Scheduled::AlreadyPending => {
            println!("That action is already waiting to be saved.");
            return Ok(());
        }
    };
    session.flush_notices()?;
    println!("Press Ctrl-C to undo.");

    let key = ticket.key.clone();
    let wait = ticket.wait();
    tokio::pin!(wait);

    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            if !session.controller.undo(&key).await {
                info!(%key, "undo arrived after the commit started");
            }
            wait.await
        }
    };
    session.flush_notices()?;

    match outcome {
        DeferredOutcome::Committed | DeferredOutcome::Cancelled => Ok(()),
        DeferredOutcome::Failed(message) => Err(anyhow!("{} failed: {message}", key.kind.noun())),
    }
}
