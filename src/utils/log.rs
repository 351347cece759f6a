// src/utils/log.rs

//! Operator report formatting on top of the `log` facade.
//!
//! Level filtering and timestamps belong to whichever logger the binary
//! installs; these helpers only shape the banner and summary lines.

const RULE_WIDTH: usize = 60;

/// Render a step line.
pub fn step_line(step_num: usize, total: usize, message: &str) -> String {
    format!("[STEP {}/{}] {}", step_num, total, message)
}

/// Render the lines of a summary block.
pub fn summary_lines(title: &str, items: &[(&str, String)]) -> Vec<String> {
    let mut lines = Vec::with_capacity(items.len() + 1);
    lines.push(format!("[SUMMARY] {}", title));
    lines.extend(items.iter().map(|(key, value)| format!("    {}: {}", key, value)));
    lines
}

/// Log a step in a process
pub fn step(step_num: usize, total: usize, message: &str) {
    log::info!("{}", step_line(step_num, total, message));
}

/// Log a header
pub fn header(title: &str) {
    let border = "═".repeat(RULE_WIDTH);
    log::info!("{}", border);
    log::info!("  {}", title);
    log::info!("{}", border);
}

/// Log a sub-item (indented)
pub fn sub_item(message: &str) {
    log::info!("    {}", message);
}

/// Log a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    for line in summary_lines(title, items) {
        log::info!("{}", line);
    }
}
