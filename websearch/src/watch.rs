//! Following a live run in the terminal
//!
//! Renders progress with a single indicatif bar. The first Ctrl-C asks the
//! platform to cancel the run and keeps waiting for the terminal event; a
//! second Ctrl-C detaches and leaves the run processing.
//!
//! Another process (say `websearch recover` in a second terminal) may finalize
//! the run first. The stored history is polled for such writes, and the
//! recorded outcome is shown as soon as one settles the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use websearch_core::history::HistoryChange;
use websearch_core::{AppState, History, HistoryEntry, LiveMonitor, Stage};

use crate::output;

const EXTERNAL_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Follow the monitored run until it settles, then print the outcome.
pub async fn follow(monitor: &mut LiveMonitor, history: &Arc<History>) -> Result<()> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let _external = history.watch_external(EXTERNAL_CHECK_INTERVAL);
    let mut changes = history.subscribe();

    let mut printed_actions = 0;
    let mut cancel_requested = false;
    render(&pb, monitor.state(), &mut printed_actions);

    while monitor.state().stage == Stage::Processing {
        tokio::select! {
            effect = monitor.next_event() => {
                if effect.is_none() {
                    pb.abandon();
                    let state = monitor.state();
                    let run_id = state.run_id.clone().unwrap_or_default();
                    if let Some(error) = &state.error {
                        eprintln!("{}", error);
                    }
                    bail!(
                        "Lost the event stream for {}. Run `websearch resume {}` to reattach.",
                        run_id,
                        run_id
                    );
                }
                render(&pb, monitor.state(), &mut printed_actions);
            }
            change = changes.recv() => {
                match change {
                    Ok(HistoryChange::External) | Err(RecvError::Lagged(_)) => {
                        if let Some(entry) = settled_elsewhere(history, monitor.state()) {
                            pb.finish_and_clear();
                            println!(
                                "Run {} was finished by another websearch process ({}).",
                                entry.run_id, entry.status
                            );
                            println!();
                            output::print_entry_detail(&entry);
                            return Ok(());
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Closed) => bail!("History closed while following the run"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if cancel_requested {
                    pb.abandon();
                    let run_id = monitor.state().run_id.clone().unwrap_or_default();
                    println!("Detached. The run is still recorded as processing.");
                    println!("Reattach with: websearch resume {}", run_id);
                    return Ok(());
                }
                cancel_requested = true;
                match monitor.cancel_task().await {
                    Ok(_) => pb.println("Cancellation requested; waiting for the run to stop (Ctrl-C again to detach)"),
                    Err(e) => pb.println(format!("Cancel failed: {}", e.user_message())),
                }
            }
        }
    }

    pb.finish_and_clear();

    let state = monitor.state();
    match state.stage {
        Stage::Complete => {
            if let Some(result) = &state.result {
                output::print_result(result);
            }
            Ok(())
        }
        Stage::Error => {
            let message = state.error.clone().unwrap_or_else(|| "Task failed".to_string());
            bail!("{}", message)
        }
        Stage::Idle | Stage::Processing => Ok(()),
    }
}

/// The tracked run's history entry, if another writer already made it terminal
fn settled_elsewhere(history: &History, state: &AppState) -> Option<HistoryEntry> {
    let run_id = state.run_id.as_deref()?;
    history
        .find_by_run_id(run_id)
        .filter(|entry| entry.status.is_terminal())
}

fn render(pb: &ProgressBar, state: &AppState, printed_actions: &mut usize) {
    let progress = &state.progress;

    for action in progress.action_history.iter().skip(*printed_actions) {
        pb.println(format!("  · {}", action));
    }
    *printed_actions = progress.action_history.len().max(*printed_actions);

    pb.set_position(progress.progress.round().clamp(0.0, 100.0) as u64);

    let mut msg = format!(
        "iteration {}/{}",
        progress.current_iteration, progress.total_iterations
    );
    if let Some(action) = &progress.current_action {
        msg.push_str(" - ");
        msg.push_str(&output::truncate(action, 50));
    }
    if let Some(error) = &state.error {
        msg.push_str(" [");
        msg.push_str(&output::truncate(error, 40));
        msg.push(']');
    }
    pb.set_message(msg);
}
