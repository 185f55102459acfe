use anyhow::{bail, Context, Result};
use shepherd_conductor::agent::AgentController;
use shepherd_conductor::config::ShepherdConfig;
use shepherd_conductor::git::GitOps;
use shepherd_conductor::hosting::github::GhCli;
use shepherd_conductor::runner::notify::TracingNotifier;
use shepherd_conductor::scheduler::Scheduler;
use shepherd_conductor::session::{SessionDeps, SessionReport, SessionStatus};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Execute `shepherd watch <PR>...`
pub fn execute(
    config: ShepherdConfig,
    prs: &[String],
    squash_message: Option<&str>,
    journal: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    ctrlc_cancel(cancel.clone());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(watch(config, prs, squash_message, journal, cancel))
}

async fn watch(
    config: ShepherdConfig,
    prs: &[String],
    squash_message: Option<&str>,
    journal: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let hosting = GhCli::new(config.hosting.gh_bin.clone(), config.hosting.host.clone());
    hosting.verify_available().await?;
    let git = GitOps::from_config(&config);
    git.verify_available().await?;
    let agent = AgentController::from_config(&config.agent);
    agent.cli().verify_available().await?;

    let poll = config.poll_interval();
    let deps = SessionDeps {
        config: Arc::new(config),
        hosting: Arc::new(hosting),
        agent: Arc::new(agent),
        git: Arc::new(git),
        notifier: Arc::new(TracingNotifier),
    };
    let scheduler = if journal {
        Scheduler::new(deps)
    } else {
        Scheduler::new(deps).without_journal()
    };

    for pr in prs {
        match scheduler.start_watching(pr).await {
            Ok(id) => println!("[{id}] watching {pr}"),
            Err(e) => warn!(pr = %pr, error = %e, "could not watch"),
        }
    }
    if scheduler.is_empty() {
        bail!("no pull request could be watched");
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(poll);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                println!("Interrupted.");
                break;
            }
            _ = ticker.tick() => {
                print_status(&scheduler.status());
                settle(&scheduler, squash_message).await;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => run_command(&scheduler, &line).await,
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
        if scheduler.is_empty() {
            println!("No sessions left.");
            break;
        }
    }

    info!(sessions = scheduler.session_ids().len(), "shutting down");
    for s in scheduler.shutdown().await {
        println!(
            "[{}] {} stopped ({}, {} attempts, {} skipped{})",
            s.session_id,
            s.pr,
            s.previous_status,
            s.fix_attempts,
            s.skipped_attempts,
            if s.killed_agent { ", agent killed" } else { "" }
        );
    }
    Ok(())
}

/// Squash (when asked to) and stop every session whose CI went green.
async fn settle(scheduler: &Scheduler, squash_message: Option<&str>) {
    let done: Vec<String> = scheduler
        .status()
        .into_iter()
        .filter(|r| r.status == SessionStatus::Success)
        .map(|r| r.session_id)
        .collect();

    for id in done {
        if let Some(message) = squash_message {
            match scheduler.squash(&id, message).await {
                Ok(out) => println!(
                    "[{id}] squashed into {} ({} commit(s) removed)",
                    short(&out.new_sha),
                    out.commits_removed
                ),
                Err(e) => warn!(session = %id, error = %e, "squash failed"),
            }
        }
        if let Err(e) = scheduler.stop(Some(&id)).await {
            warn!(session = %id, error = %e, "stop failed");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WatchCommand {
    Status,
    Logs { session: String, file: String },
    Squash { session: String, message: String },
    Stop { session: Option<String> },
    Help,
}

const DEFAULT_SQUASH_MESSAGE: &str = "Fix CI";
const HELP: &str =
    "Commands: status | logs <session> <file> | squash <session> [message] | stop [session]";

fn parse_command(line: &str) -> Option<WatchCommand> {
    let mut words = line.split_whitespace();
    let cmd = match words.next()? {
        "status" | "s" => WatchCommand::Status,
        "logs" => WatchCommand::Logs {
            session: words.next()?.to_string(),
            file: words.next()?.to_string(),
        },
        "squash" => {
            let session = words.next()?.to_string();
            let rest: Vec<&str> = words.collect();
            let message = if rest.is_empty() {
                DEFAULT_SQUASH_MESSAGE.to_string()
            } else {
                rest.join(" ")
            };
            WatchCommand::Squash { session, message }
        }
        "stop" => WatchCommand::Stop {
            session: words.next().map(String::from),
        },
        _ => WatchCommand::Help,
    };
    Some(cmd)
}

async fn run_command(scheduler: &Scheduler, line: &str) {
    let Some(cmd) = parse_command(line) else {
        return;
    };
    let result: Result<()> = match cmd {
        WatchCommand::Status => {
            print_status(&scheduler.status());
            Ok(())
        }
        WatchCommand::Logs { session, file } => match read_logs(&file) {
            Ok(text) => scheduler
                .provide_logs(&session, &text)
                .await
                .map(|()| println!("[{session}] logs accepted, fixing"))
                .map_err(Into::into),
            Err(e) => Err(e),
        },
        WatchCommand::Squash { session, message } => scheduler
            .squash(&session, &message)
            .await
            .map(|out| {
                println!(
                    "[{session}] squashed into {} ({} commit(s) removed)",
                    short(&out.new_sha),
                    out.commits_removed
                )
            })
            .map_err(Into::into),
        WatchCommand::Stop { session } => scheduler
            .stop(session.as_deref())
            .await
            .map(|stopped| {
                for s in stopped {
                    println!("[{}] {} stopped", s.session_id, s.pr);
                }
            })
            .map_err(Into::into),
        WatchCommand::Help => {
            println!("{HELP}");
            Ok(())
        }
    };
    if let Err(e) = result {
        eprintln!("{e:#}");
    }
}

fn read_logs(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading logs: {path}"))
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

fn print_status(reports: &[SessionReport]) {
    if reports.is_empty() {
        return;
    }
    println!(
        "{:<10} {:<28} {:<14} {:<20} {:>8} {:>7} {:>8}  LAST EVENT",
        "SESSION", "PR", "STATUS", "FAILING", "ATTEMPTS", "SKIPPED", "ELAPSED"
    );
    for r in reports {
        println!("{}", status_line(r));
        if let Some(reason) = &r.awaiting_reason {
            println!("{:<10} -> {reason} (logs {} <file>)", "", r.session_id);
        }
    }
}

fn status_line(r: &SessionReport) -> String {
    format!(
        "{:<10} {:<28} {:<14} {:<20} {:>8} {:>7} {:>8}  {}",
        r.session_id,
        r.pr,
        r.status.to_string(),
        r.current_failure.as_deref().unwrap_or("-"),
        r.fix_attempts,
        r.skipped_attempts,
        format_elapsed(r.elapsed_secs),
        r.last_event.as_deref().unwrap_or("")
    )
}

fn format_elapsed(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}

fn ctrlc_cancel(cancel: CancellationToken) {
    let _ = ctrlc::set_handler(move || {
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("status"), Some(WatchCommand::Status));
        assert_eq!(parse_command("   "), None);
        assert_eq!(
            parse_command("logs 1a2b3c4d /tmp/ci.log"),
            Some(WatchCommand::Logs {
                session: "1a2b3c4d".into(),
                file: "/tmp/ci.log".into()
            })
        );
        assert_eq!(parse_command("logs 1a2b3c4d"), None);
        assert_eq!(
            parse_command("squash 1a2b3c4d fix: unit tests"),
            Some(WatchCommand::Squash {
                session: "1a2b3c4d".into(),
                message: "fix: unit tests".into()
            })
        );
        assert_eq!(
            parse_command("squash 1a2b3c4d"),
            Some(WatchCommand::Squash {
                session: "1a2b3c4d".into(),
                message: DEFAULT_SQUASH_MESSAGE.into()
            })
        );
        assert_eq!(parse_command("stop"), Some(WatchCommand::Stop { session: None }));
        assert_eq!(parse_command("frobnicate"), Some(WatchCommand::Help));
    }

    #[test]
    fn elapsed_is_compact() {
        assert_eq!(format_elapsed(42), "42s");
        assert_eq!(format_elapsed(125), "2m05s");
        assert_eq!(format_elapsed(7260), "2h01m");
    }

    #[test]
    fn status_line_shows_failure_and_counts() {
        let report = SessionReport {
            session_id: "1a2b3c4d".into(),
            pr: "acme/widgets#42".into(),
            status: SessionStatus::AwaitingUser,
            current_failure: Some("unit-tests".into()),
            attempts_by_check: BTreeMap::from([("unit-tests".to_string(), 3)]),
            fix_attempts: 3,
            skipped_attempts: 1,
            elapsed_secs: 90,
            current_sha: "abc".into(),
            awaiting_reason: Some("3 attempts made".into()),
            last_event: Some("awaiting user".into()),
        };
        let line = status_line(&report);
        assert!(line.starts_with("1a2b3c4d"));
        assert!(line.contains("awaiting_user"));
        assert!(line.contains("unit-tests"));
        assert!(line.contains("1m30s"));
        assert!(line.ends_with("awaiting user"));
    }

    #[test]
    fn read_logs_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.log");
        assert!(read_logs(path.to_str().unwrap()).is_err());
        std::fs::write(&path, "error: boom\n").unwrap();
        assert_eq!(read_logs(path.to_str().unwrap()).unwrap(), "error: boom\n");
    }
}
