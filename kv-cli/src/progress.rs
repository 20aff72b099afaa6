//! Spinner progress for the two operations a node blocks on for an
//! unpredictable amount of time: the initial persistence `warm()` and a
//! membership `rebalance()`. Neither reports incremental counts back to the
//! caller, so this only ever shows a spinner plus an elapsed clock rather
//! than a bar with a known total.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
            .unwrap()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

pub fn finish(bar: ProgressBar, message: impl Into<String>) {
    bar.finish_with_message(message.into());
}
