//! Plain-text board rendering for the terminal.

use std::fmt::Write;

use board_core::{BoardNotice, Column, MoveOutcome, StageRegistry};

pub fn render_columns(registry: &StageRegistry, columns: &[Column]) -> String {
    let mut out = String::new();
    for column in columns {
        let title = column
            .stage
            .as_ref()
            .and_then(|stage_id| registry.get(stage_id))
            .map(|stage| stage.display_name.as_str())
            .unwrap_or("Records");
        let _ = writeln!(out, "{title} ({})", column.len());
        for card in &column.cards {
            let record = &card.record;
            let _ = write!(out, "  - {} [{}]", record.label(), record.id);
            if let Some(contacted) = record.last_contact_at {
                let _ = write!(out, " last contact {}", contacted.format("%Y-%m-%d"));
            }
            out.push('\n');
        }
    }
    out
}

pub fn describe_outcome(outcome: &MoveOutcome) -> String {
    match outcome {
        MoveOutcome::Noop => "nothing to do".into(),
        MoveOutcome::Reordered => "reordered within stage".into(),
        MoveOutcome::Confirmed => "move saved".into(),
        MoveOutcome::RolledBack(err) => format!("move rolled back: {err}"),
        MoveOutcome::Rejected(err) => format!("move rejected: {err}"),
    }
}

pub fn describe_notice(notice: &BoardNotice) -> String {
    match notice {
        BoardNotice::MoveConfirmed {
            label, stage_name, ..
        } => format!("{label} moved to {stage_name}"),
        BoardNotice::MoveFailed { label, error, .. } => {
            format!("could not move {label}: {error}")
        }
        BoardNotice::Refreshed { records } => format!("board refreshed ({records} records)"),
        BoardNotice::RefreshFailed(err) => format!("refresh failed: {err}"),
        BoardNotice::FeedUnavailable(err) => format!("live updates unavailable: {err}"),
    }
}

#[cfg(test)]
#[path = "tests/render_tests.rs"]
mod tests;
