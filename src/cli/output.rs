//! Terminal output for schedules and run reports
//!
//! `colored` honours NO_COLOR and CLICOLOR_FORCE. Data meant for piping
//! (DOT, TOML, the tree) goes through [`data`] uncoloured.

use std::fmt::Display;

use colored::Colorize;

use crate::application::{Action, ActionKind, OutputOutcome};

pub fn warning(msg: &(impl Display + ?Sized)) {
    eprintln!("{}: {}", "warning".yellow(), msg);
}

/// `label: value` with a green label, e.g. the fingerprint or a written file.
pub fn field(label: &str, value: &(impl Display + ?Sized)) {
    println!("{}: {}", label.green(), value);
}

pub fn section(title: &(impl Display + ?Sized)) {
    println!("{}", title.to_string().cyan().bold());
}

/// One line of `cutgraph plan`; filters stand out since they prune events.
pub fn planned(action: &Action) {
    let kind = format!("{:<6}", action.kind().to_string());
    let kind = match action.kind() {
        ActionKind::FilterApply => kind.magenta(),
        _ => kind.normal(),
    };
    println!(
        "  {:>5} {} cost={:<8} {}",
        action.id().to_string(),
        kind,
        action.cost(),
        action.label()
    );
}

/// One writer invocation of `cutgraph run`.
pub fn outcome(outcome: &OutputOutcome) {
    let what = format!(
        "{} [{}]",
        outcome.writer.as_deref().unwrap_or("-"),
        outcome.systematic
    );
    match &outcome.result {
        Ok(()) => println!(
            "  {} {what}: {} event(s)",
            "✓".green(),
            outcome.events.unwrap_or_default()
        ),
        Err(e) => println!("  {} {what}: {e}", "✗".red()),
    }
}

pub fn data(text: &(impl Display + ?Sized)) {
    println!("{}", text);
}
