use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;

use cadence::config::Config;
use cadence::core::{Plan, TaskGraph, TaskId};
use cadence::orchestration::scheduler::{assign_tracks, group_resources, SprintScheduler};
use cadence::orchestration::task_loop::TaskSnapshot;
use cadence::orchestration::TrackId;
use cadence::state::{Event, EventPayload, NewEvent, PauseReason, SessionProjection, StateStore};
use cadence::{clog, Collaborators, Error, Result, Session, SessionId, SessionReport};

/// Cadence - plan-driven task orchestration with validation and escalation
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADENCE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.cadence/cadence.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (defaults to ~/.cadence/cadence.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the sprints and tracks a plan would run as
    Plan {
        /// Plan file (TOML)
        file: PathBuf,
    },

    /// Start a session for a plan and run it
    Run {
        /// Plan file (TOML)
        file: PathBuf,

        /// Print events as they are logged
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Continue a session, lifting any pause
    Resume {
        /// Session id or unique prefix
        session: String,

        /// Print events as they are logged
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Show task and track state of a session
    Status {
        /// Session id or unique prefix
        session: String,
    },

    /// Print a session's event log
    Log {
        /// Session id or unique prefix
        session: String,

        /// Only events for this task
        #[arg(long)]
        task: Option<String>,

        /// Only events after this sequence number
        #[arg(long)]
        since: Option<u64>,
    },

    /// Pause a session that is not running
    Pause {
        /// Session id or unique prefix
        session: String,

        #[arg(long, default_value = "")]
        note: String,
    },

    /// Discard every live track and close the session
    Abandon {
        /// Session id or unique prefix
        session: String,
    },

    /// Discard one track's workspace
    TrackCleanup {
        /// Session id or unique prefix
        session: String,

        /// Track id
        track: String,

        /// Discard uncommitted work too
        #[arg(long)]
        force: bool,
    },

    /// Merge a conflicted track after fixing it in its workspace
    Merge {
        /// Session id or unique prefix
        session: String,

        /// Track id
        track: String,
    },

    /// Accept or reject a weak council verdict
    Confirm {
        /// Session id or unique prefix
        session: String,

        /// Task name
        task: String,

        #[arg(long)]
        reject: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cadence::log::init(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let result = match cli.command {
        Command::Plan { file } => run_plan(&file, &config),
        Command::Run { file, follow } => run_session(&file, follow, &config),
        Command::Resume { session, follow } => run_resume(&session, follow, &config),
        Command::Status { session } => run_status(&session),
        Command::Log {
            session,
            task,
            since,
        } => run_log(&session, task.as_deref(), since),
        Command::Pause { session, note } => run_pause(&session, &note),
        Command::Abandon { session } => run_abandon(&session, &config),
        Command::TrackCleanup {
            session,
            track,
            force,
        } => run_track_cleanup(&session, &track, force, &config),
        Command::Merge { session, track } => run_merge(&session, &track, &config),
        Command::Confirm {
            session,
            task,
            reject,
        } => run_confirm(&session, &task, !reject, &config),
    };

    if let Err(e) = &result {
        clog!("Command failed: {}", e);
    }
    result
}

/// Resolve a session id or unique prefix to its store directory.
fn find_session(query: &str) -> Result<PathBuf> {
    let dir = Config::sessions_dir()?;
    if !dir.exists() {
        return Err(Error::Validation(format!("no session matches '{}'", query)));
    }

    let mut matches = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(query) && name.parse::<SessionId>().is_ok() {
            matches.push(entry.path());
        }
    }

    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(Error::Validation(format!("no session matches '{}'", query))),
        n => Err(Error::Validation(format!("'{}' matches {} sessions", query, n))),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

/// One log line: sequence, time, kind, subject, and any transition.
fn format_event(event: &Event, names: &HashMap<TaskId, String>) -> String {
    let subject = event
        .task_id
        .and_then(|id| names.get(&id).cloned())
        .or_else(|| event.track_id.map(|id| format!("track {}", id.short())))
        .unwrap_or_else(|| "session".to_string());
    let transition = match (event.from, event.to) {
        (Some(from), Some(to)) => format!(" {} -> {}", from, to),
        (None, Some(to)) => format!(" -> {}", to),
        _ => String::new(),
    };
    format!(
        "{:>5} {} {:<20} {}{}",
        event.seq,
        event.timestamp.format("%H:%M:%S"),
        event.kind(),
        subject,
        transition
    )
}

/// Print events from `events` until the store that feeds it is dropped.
///
/// Task names are learned from `TaskAdded` events as they arrive.
fn follow(events: Receiver<Event>, mut names: HashMap<TaskId, String>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in events {
            if let EventPayload::TaskAdded { task } = &event.payload {
                names.insert(task.id, task.name.clone());
            }
            println!("{}", format_event(&event, &names));
        }
    })
}

fn finish_follow(follower: Option<JoinHandle<()>>) {
    if let Some(handle) = follower {
        if handle.join().is_err() {
            clog!("Event follower panicked");
        }
    }
}

fn print_report(report: &SessionReport) {
    println!();
    print!("{}", report);
    if let Some(PauseReason::CircuitBreaker { .. }) = report.pause {
        println!();
        println!("Resume with: cadence resume {}", report.session_id.short());
    }
    for audit in &report.awaiting_confirmation {
        println!(
            "Confirm with: cadence confirm {} {} [--reject]",
            report.session_id.short(),
            audit.name
        );
    }
    for conflict in &report.conflicts {
        println!(
            "Fix and merge with: cadence merge {} {}",
            report.session_id.short(),
            conflict.track
        );
    }
}

fn run_plan(file: &Path, config: &Config) -> Result<()> {
    let plan = Plan::load(file)?;
    let graph = TaskGraph::from_plan(&plan)?;
    let sprints = SprintScheduler::new(config.scheduler.sprint_budget_hours).plan(&graph)?;

    println!(
        "{} task(s), {} dependency edge(s), {} sprint(s)",
        graph.task_count(),
        graph.dependency_count(),
        sprints.len()
    );
    for sprint in &sprints {
        println!();
        println!("Sprint {} ({}h)", sprint.number, sprint.effort_hours);
        for (i, batch) in sprint.batches.iter().enumerate() {
            println!("  batch {}", i + 1);
            for group in assign_tracks(&graph, batch)? {
                let names: Vec<&str> = group
                    .iter()
                    .filter_map(|id| graph.get_task(id))
                    .map(|t| t.name.as_str())
                    .collect();
                let resources = group_resources(&graph, &group);
                if resources.is_empty() {
                    println!("    track: {}", names.join(" -> "));
                } else {
                    let resources: Vec<String> = resources.into_iter().collect();
                    println!(
                        "    track: {} (shares {})",
                        names.join(" -> "),
                        resources.join(", ")
                    );
                }
            }
        }
    }
    Ok(())
}

fn run_session(file: &Path, follow_events: bool, config: &Config) -> Result<()> {
    let plan = Plan::load(file)?;
    let id = SessionId::new();
    let dir = Config::sessions_dir()?.join(id.to_string());
    let store = StateStore::open(&dir)?;
    cadence::log::attach_session(&id, &dir);
    let collaborators = Collaborators::from_config(config)?;
    clog!("Run command: plan={}, session={}", file.display(), id);
    println!("Session {}", id);

    let follower = if follow_events {
        Some(follow(store.subscribe()?, HashMap::new()))
    } else {
        None
    };
    let report = runtime()?.block_on(async {
        let mut session = Session::start(id, &plan, collaborators, config, store)
            .await?
            .with_archive_dir(&Config::archive_dir()?);
        session.run().await
    });
    finish_follow(follower);
    print_report(&report?);
    Ok(())
}

fn run_resume(query: &str, follow_events: bool, config: &Config) -> Result<()> {
    let (store, projection) = replay(query)?;
    if let (Some(id), Some(dir)) = (projection.session.session_id, store.dir()) {
        cadence::log::attach_session(&id, dir);
    }
    let collaborators = Collaborators::from_config(config)?;

    let follower = if follow_events {
        let names = projection
            .tasks
            .values()
            .map(|t| (t.id, t.name.clone()))
            .collect();
        Some(follow(store.subscribe()?, names))
    } else {
        None
    };
    let report = runtime()?.block_on(async {
        let mut session = Session::resume(store, collaborators, config)
            .await?
            .with_archive_dir(&Config::archive_dir()?);
        session.resume_dispatch()?;
        session.run().await
    });
    finish_follow(follower);
    print_report(&report?);
    Ok(())
}

fn replay(query: &str) -> Result<(StateStore, SessionProjection)> {
    let store = StateStore::open(&find_session(query)?)?;
    let events = store.events()?;
    let projection = SessionProjection::resume(store.load_checkpoint()?, &events);
    Ok((store, projection))
}

fn run_status(query: &str) -> Result<()> {
    let (store, projection) = replay(query)?;
    let id = projection
        .session
        .session_id
        .map(|id| id.to_string())
        .unwrap_or_default();

    println!("Session {} is {}", id, projection.session.status);
    if let Some(reason) = &projection.session.pause_reason {
        println!("  {}", reason);
    }
    println!();

    let updated: HashMap<String, String> = store
        .entries("task.")?
        .into_iter()
        .map(|(key, entry)| (key, entry.updated_at.format("%H:%M:%S").to_string()))
        .collect();
    let mut tasks: Vec<_> = projection.tasks.values().collect();
    tasks.sort_by(|a, b| a.name.cmp(&b.name));
    println!(
        "{:<24} {:<12} {:<10} {:>5}  {}",
        "TASK", "STATUS", "TIER", "ITER", "UPDATED"
    );
    for task in tasks {
        let tier = task.tier.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
        let mut status = task.status.to_string();
        if task.awaiting_confirmation {
            status.push('*');
        }
        let at = updated
            .get(&TaskSnapshot::key(&task.id))
            .map_or("-", String::as_str);
        println!(
            "{:<24} {:<12} {:<10} {:>5}  {}",
            task.name, status, tier, task.iteration, at
        );
    }

    if !projection.tracks.is_empty() {
        println!();
        println!("{:<10} {:<32} {:<12}", "TRACK", "NAME", "STATE");
        for track in &projection.tracks {
            println!(
                "{:<10} {:<32} {:<12}",
                track.id.short(),
                track.name,
                track.state.to_string()
            );
        }
    }
    Ok(())
}

fn run_log(query: &str, task: Option<&str>, since: Option<u64>) -> Result<()> {
    let (store, projection) = replay(query)?;
    let since = since.unwrap_or(0);
    let events = match task {
        Some(name) => {
            let task = projection
                .tasks
                .values()
                .find(|t| t.name == name)
                .ok_or_else(|| Error::TaskNotFound(name.to_string()))?;
            let mut log = store.task_log(&task.id)?;
            log.retain(|e| e.seq > since);
            log
        }
        None => store.events_after(since)?,
    };

    let names: HashMap<TaskId, String> = projection
        .tasks
        .values()
        .map(|t| (t.id, t.name.clone()))
        .collect();
    for event in events {
        println!("{}", format_event(&event, &names));
    }
    Ok(())
}

fn run_pause(query: &str, note: &str) -> Result<()> {
    let (store, projection) = replay(query)?;
    let status = projection.session.status;
    if status.is_closed() {
        return Err(Error::SessionClosed(format!("session is {}", status)));
    }
    if projection.session.pause_reason.is_some() {
        println!("Session is already paused");
        return Ok(());
    }
    store.append(NewEvent::session(EventPayload::SessionPaused {
        reason: PauseReason::Operator {
            note: note.to_string(),
        },
    }))?;
    println!("Session paused");
    Ok(())
}

fn run_abandon(query: &str, config: &Config) -> Result<()> {
    let store = StateStore::open(&find_session(query)?)?;
    let collaborators = Collaborators::from_config(config)?;
    runtime()?.block_on(async {
        let mut session = Session::resume(store, collaborators, config)
            .await?
            .with_archive_dir(&Config::archive_dir()?);
        session.abandon().await
    })?;
    println!("Session abandoned");
    Ok(())
}

fn run_track_cleanup(query: &str, track: &str, force: bool, config: &Config) -> Result<()> {
    let track: TrackId = track.parse()?;
    let store = StateStore::open(&find_session(query)?)?;
    let collaborators = Collaborators::from_config(config)?;
    let items = runtime()?.block_on(async {
        let session = Session::resume(store, collaborators, config).await?;
        let items = session.cleanup_track(&track, force).await?;
        session.checkpoint().await?;
        Ok::<_, Error>(items)
    })?;
    println!("Discarded track {} ({} uncommitted item(s))", track.short(), items.len());
    Ok(())
}

fn run_merge(query: &str, track: &str, config: &Config) -> Result<()> {
    let track: TrackId = track.parse()?;
    let store = StateStore::open(&find_session(query)?)?;
    let collaborators = Collaborators::from_config(config)?;
    let revision = runtime()?.block_on(async {
        let session = Session::resume(store, collaborators, config).await?;
        let revision = session.merge_track(&track).await?;
        session.checkpoint().await?;
        Ok::<_, Error>(revision)
    })?;
    println!(
        "Merged track {} at {}; run `cadence resume` to continue",
        track.short(),
        revision
    );
    Ok(())
}

fn run_confirm(query: &str, task: &str, accept: bool, config: &Config) -> Result<()> {
    let store = StateStore::open(&find_session(query)?)?;
    let collaborators = Collaborators::from_config(config)?;
    runtime()?.block_on(async {
        let mut session = Session::resume(store, collaborators, config).await?;
        let id = session
            .graph()
            .read()
            .await
            .find_by_name(task)
            .map(|t| t.id)
            .ok_or_else(|| Error::TaskNotFound(task.to_string()))?;
        session.confirm_consensus(&id, accept).await?;
        session.checkpoint().await
    })?;
    println!(
        "Verdict for {} {}; run `cadence resume` to continue",
        task,
        if accept { "accepted" } else { "rejected" }
    );
    Ok(())
}
