//! Plain-text rendering of history entries and run snapshots

use websearch_core::format::{format_clock_time, format_elapsed, format_relative_time, truncate_text};
use websearch_core::monitor::ProgressMetadata;
use websearch_core::{HistoryEntry, HistoryStatus, RemoteRunStatus, SearchOutput};

pub fn status_icon(status: HistoryStatus) -> &'static str {
    match status {
        HistoryStatus::Processing => "…",
        HistoryStatus::Complete => "✓",
        HistoryStatus::Failed => "✗",
        HistoryStatus::Canceled => "-",
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    truncate_text(text, max_chars)
}

/// One-line summary used by `history`
pub fn print_entry_line(entry: &HistoryEntry) {
    println!(
        "{} {:<24} {:>10}  {}",
        status_icon(entry.status),
        entry.id,
        format_relative_time(entry.timestamp),
        truncate(&entry.query, 60)
    );
}

/// Full entry, including the answer or error
pub fn print_entry_detail(entry: &HistoryEntry) {
    println!("Query:     {}", entry.query);
    println!("Status:    {}", entry.status);
    println!("Run:       {}", entry.run_id);
    println!(
        "Started:   {} ({})",
        format_clock_time(entry.timestamp),
        format_relative_time(entry.timestamp)
    );
    if let Some(completed) = entry.completed_at {
        println!("Took:      {}", format_elapsed(entry.timestamp, completed));
    }
    if let Some(model) = &entry.model {
        println!("Model:     {}", model);
    }
    if let Some(model) = &entry.write_model {
        println!("Writer:    {}", model);
    }

    if let Some(error) = &entry.error {
        println!();
        println!("Error: {}", error);
    }
    if let Some(result) = &entry.result {
        println!();
        print_result(result);
    }
}

/// Answer text followed by a count of research steps
pub fn print_result(result: &SearchOutput) {
    match result.answer.as_deref().map(str::trim) {
        Some(answer) if !answer.is_empty() => println!("{}", answer),
        _ => println!("(no answer was produced)"),
    }

    let tool_calls: usize = result
        .conversation
        .iter()
        .filter_map(|m| m.tool_calls.as_ref())
        .map(Vec::len)
        .sum();
    if tool_calls > 0 {
        println!();
        println!(
            "({} tool call{} across {} messages)",
            tool_calls,
            if tool_calls == 1 { "" } else { "s" },
            result.conversation.len()
        );
    }
}

/// Remote snapshot used by `status`
pub fn print_remote_status(status: &RemoteRunStatus) {
    println!("Run:             {}", status.run_id);
    println!("Remote status:   {}", status.state);
    if let Some(created) = status.created_at {
        println!("Created:         {}", format_relative_time(created.timestamp_millis()));
    }
    if let Some(updated) = status.updated_at {
        println!("Updated:         {}", format_relative_time(updated.timestamp_millis()));
    }

    if let Some(metadata) = &status.metadata {
        let progress = ProgressMetadata::from_value(metadata);
        println!(
            "Progress:        {:.0}% (iteration {}/{})",
            progress.progress, progress.current_iteration, progress.total_iterations
        );
        if let Some(action) = &progress.current_action {
            println!("Current action:  {}", action);
        }
    }
    if let Some(error) = &status.error {
        println!("Error:           {}", error);
    }
}
