//! Command handlers behind the `tether` binary.
//!
//! Streamed turn text goes to stdout; status lines go to stderr.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tether_core::{RecoveryOutcome, SessionEvent, TerminalEvent, TerminalHandle, TetherError, TurnSession};
use tether_types::{Draft, SessionMode, SubmitOptions, TurnPhase};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

/// What Ctrl-C does while following turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnInterrupt {
    /// Ask the server to stop the turn.
    Cancel,
    /// Stop reading; the pending record stays for a later `turn recover`.
    Detach,
}

pub async fn turn_submit(session: &TurnSession, target: &str, message: &str, options: SubmitOptions) -> Result<()> {
    let events = session.subscribe();
    let turn_id = session.submit(target, message, options).await?;
    eprintln!("turn {} submitted for {}", turn_id, target);

    let mut following = HashMap::new();
    following.insert(target.to_string(), turn_id);
    follow(session, events, following, OnInterrupt::Cancel).await
}

pub async fn turn_recover(session: &TurnSession, target: Option<&str>) -> Result<()> {
    let events = session.subscribe();
    let outcomes = match target {
        Some(target) => vec![(target.to_string(), session.recover(target).await?)],
        None => session.recover_all().await?,
    };

    let mut following = HashMap::new();
    for (target, outcome) in outcomes {
        match outcome {
            RecoveryOutcome::NothingPending => eprintln!("{}: nothing to recover", target),
            RecoveryOutcome::Started { turn_id } | RecoveryOutcome::InProgress { turn_id } => {
                eprintln!("{}: recovering turn {}", target, turn_id);
                following.insert(target, turn_id);
            }
        }
    }
    if following.is_empty() {
        return Ok(());
    }
    follow(session, events, following, OnInterrupt::Detach).await
}

pub async fn turn_cancel(session: &TurnSession, target: &str) -> Result<()> {
    session.cancel(target).await?;
    eprintln!("{}: interrupted", target);
    Ok(())
}

pub async fn turn_reset(session: &TurnSession, key: &str) -> Result<()> {
    session.reset_thread(key).await?;
    eprintln!("thread {} reset", key);
    Ok(())
}

/// Print streamed tokens for the followed turns until each finishes.
async fn follow(
    session: &TurnSession,
    mut events: broadcast::Receiver<SessionEvent>,
    mut following: HashMap<String, String>,
    on_interrupt: OnInterrupt,
) -> Result<()> {
    let mut stdout = std::io::stdout();
    let mut failed = false;

    while !following.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                match on_interrupt {
                    OnInterrupt::Cancel => {
                        for target in following.keys() {
                            session.cancel(target).await?;
                        }
                        eprintln!("\ninterrupted");
                    }
                    OnInterrupt::Detach => {
                        session.detach();
                        eprintln!("\ndetached; run `tether turn recover` to resume");
                    }
                }
                return Ok(());
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "tether::turn", "Event output fell behind by {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            SessionEvent::Token { target, turn_id, delta } if is_followed(&following, &target, &turn_id) => {
                write!(stdout, "{}", delta)?;
                stdout.flush()?;
            }
            SessionEvent::Updated {
                target,
                status: Some(status),
                ..
            } if following.contains_key(&target) => {
                eprintln!("[{}] {}", target, status);
            }
            SessionEvent::Notice { target, message } if following.contains_key(&target) => {
                eprintln!("[{}] {}", target, message);
            }
            SessionEvent::Finished {
                target,
                turn_id,
                phase,
                error,
            } if is_followed(&following, &target, &turn_id) => {
                following.remove(&target);
                writeln!(stdout)?;
                match error {
                    Some(error) => eprintln!("[{}] {}: {}", target, phase, error),
                    None => eprintln!("[{}] {}", target, phase),
                }
                failed |= phase == TurnPhase::Error;
                if let Some(draft) = session.draft(&target).await {
                    eprintln!("{}", draft_summary(&target, &draft));
                }
            }
            // A newer submit from elsewhere replaced the followed turn.
            SessionEvent::Started { target, turn_id } if following.get(&target).is_some_and(|t| *t != turn_id) => {
                eprintln!("[{}] superseded by turn {}", target, turn_id);
                following.remove(&target);
            }
            _ => {}
        }
    }

    if failed {
        anyhow::bail!("turn failed");
    }
    Ok(())
}

fn is_followed(following: &HashMap<String, String>, target: &str, turn_id: &str) -> bool {
    following.get(target).is_some_and(|t| t == turn_id)
}

fn draft_summary(target: &str, draft: &Draft) -> String {
    let (added, removed) = draft.line_stats();
    let mut summary = format!("[{}] draft ready: +{} -{}", target, added, removed);
    if !draft.drafts.is_empty() {
        summary.push_str(&format!(" across {} files", draft.drafts.len()));
    }
    if draft.is_stale {
        summary.push_str(" (stale)");
    }
    summary
}

fn read_document(path: Option<&Path>) -> Result<Option<String>> {
    path.map(|p| std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display())))
        .transpose()
}

pub async fn draft_show(session: &TurnSession, target: &str, document: Option<&Path>) -> Result<()> {
    if session.fetch_draft(target).await?.is_none() {
        eprintln!("{}: no draft", target);
        return Ok(());
    }
    let draft = match read_document(document)? {
        Some(document) => session.draft_against(target, &document).await,
        None => session.draft(target).await,
    };
    let Some(draft) = draft.filter(Draft::has_changes) else {
        eprintln!("{}: draft has no changes", target);
        return Ok(());
    };

    eprintln!("{}", draft_summary(target, &draft));
    if let Some(message) = &draft.agent_message {
        eprintln!("{}", message);
    }
    print!("{}", draft.patch);
    for (path, content) in &draft.drafts {
        println!("--- {} ({} bytes)", path, content.len());
    }
    Ok(())
}

pub async fn draft_apply(session: &TurnSession, target: &str, document: Option<&Path>, force: bool) -> Result<()> {
    let document = read_document(document)?;
    session.apply_draft(target, document.as_deref(), force).await.map_err(|e| match e {
        TetherError::StaleDraft { .. } => {
            anyhow::anyhow!("{}; the document changed since the draft was made, pass --force to apply anyway", e)
        }
        e => e.into(),
    })?;
    eprintln!("{}: draft applied", target);
    Ok(())
}

pub async fn draft_discard(session: &TurnSession, target: &str) -> Result<()> {
    session.discard_draft(target).await?;
    eprintln!("{}: draft discarded", target);
    Ok(())
}

/// Line-oriented terminal loop.
///
/// Each line is sent as ack-tracked input. `/retry`, `/reconnect`,
/// `/disconnect` and `/quit` control the session; Ctrl-C is forwarded to the
/// remote process. Connects run in the background.
pub async fn terminal(handle: TerminalHandle, mode: SessionMode) -> Result<()> {
    let mut events = handle.subscribe();
    spawn_connect(&handle, mode);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "/quit" => break,
                    "/retry" => {
                        if let Err(e) = handle.retry_input().await {
                            eprintln!("[tether] {}", e);
                        }
                    }
                    "/reconnect" => {
                        let snapshot = handle.snapshot().await?;
                        let mode = if snapshot.session_id.is_some() { SessionMode::Attach } else { SessionMode::New };
                        spawn_connect(&handle, mode);
                    }
                    "/disconnect" => handle.disconnect().await?,
                    _ => {
                        handle.send_input(&line).await?;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.send_keys(vec![0x03]).await?;
            }
            event = events.recv() => match event {
                Ok(TerminalEvent::Output(bytes)) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                Ok(TerminalEvent::Notice(text)) => eprintln!("[tether] {}", text),
                Ok(TerminalEvent::Reconnecting { attempt, delay }) => {
                    eprintln!("[tether] reconnecting in {:?} (attempt {})", delay, attempt);
                }
                Ok(TerminalEvent::InputFailed { message, .. }) => {
                    eprintln!("[tether] input failed: {} (/retry to resend)", message);
                }
                Ok(TerminalEvent::InputDiscarded { id }) => eprintln!("[tether] discarded stale input {}", id),
                Ok(TerminalEvent::Exited { code }) => {
                    eprintln!("[tether] process exited ({})", code.map_or("unknown".to_string(), |c| c.to_string()));
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "tether::terminal", "Terminal output fell behind by {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

fn spawn_connect(handle: &TerminalHandle, mode: SessionMode) {
    let handle = handle.clone();
    tokio::spawn(async move {
        match handle.connect(mode).await {
            Ok(()) | Err(TetherError::Aborted) => {}
            Err(e) => eprintln!("[tether] connect failed: {}", e),
        }
    });
}
