//! # Formatting and Display Helpers
//!
//! Human-readable formatting of durations, byte counts and rates, plus the
//! plain-text table primitives the live view is drawn with.
//!
//! ## Usage Examples
//!
//! ```rust
//! use live_load_metrics::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_rate(1048576.0), "1.00 MB/s");
//! assert_eq!(format_millis(2_500), "2.50s");
//! ```

use crate::rate::RequestRate;
use std::time::Duration;

/// Format a duration with the most readable unit
///
/// - Sub-second units use 2 decimal places
/// - Durations over a minute use compound units
///
/// ## Examples
///
/// ```rust
/// # use live_load_metrics::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a whole-millisecond latency reading
pub fn format_millis(millis: u64) -> String {
    format_duration(Duration::from_millis(millis))
}

/// Format bytes using binary (1024-based) units
///
/// ```rust
/// # use live_load_metrics::utils::format_bytes;
/// assert_eq!(format_bytes(512.0), "512 B");
/// assert_eq!(format_bytes(1536.0), "1.50 KB");
/// assert_eq!(format_bytes(2621440.0), "2.50 MB");
/// ```
pub fn format_bytes(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a transfer rate in bytes per second
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format a request rate, scaling large values with decimal units
///
/// The window label is kept, so a cooldown-window rate reads as e.g.
/// `25.0 req/5s`.
///
/// ```rust
/// # use live_load_metrics::{rate::RequestRate, utils::format_request_rate};
/// let rate = RequestRate { value: 15_500.0, window_ms: 1000 };
/// assert_eq!(format_request_rate(&rate), "15.50K req/1s");
/// ```
pub fn format_request_rate(rate: &RequestRate) -> String {
    let value = rate.value;
    let scaled = if value < 1000.0 {
        format!("{:.1}", value)
    } else if value < 1_000_000.0 {
        format!("{:.2}K", value / 1000.0)
    } else {
        format!("{:.2}M", value / 1_000_000.0)
    };
    format!("{} req/{}", scaled, rate.label())
}

/// Format a ratio in `[0, 1]` as a percentage
pub fn format_percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Print one table row with fixed column widths
///
/// ```rust
/// # use live_load_metrics::utils::{print_table_row, print_table_separator};
/// let widths = [15, 10, 12];
/// print_table_separator(&widths);
/// print_table_row(&["Iteration", "p95", "Rate"], &widths);
/// print_table_separator(&widths);
/// ```
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    println!("{}", table_row(columns, widths));
}

/// Print a table separator matching `widths`
pub fn print_table_separator(widths: &[usize]) {
    println!("{}", table_separator(widths));
}

/// Render a table row; columns longer than their width are truncated.
pub fn table_row(columns: &[&str], widths: &[usize]) -> String {
    let cells: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, column)| fit_cell(column, widths.get(i).copied().unwrap_or(10)))
        .collect();
    join_cells(&cells)
}

/// Truncate or pad plain text to exactly `width` characters.
///
/// Styling must be applied after fitting, so escape sequences are neither
/// counted as width nor cut off.
pub fn fit_cell(text: &str, width: usize) -> String {
    let cell: String = text.chars().take(width).collect();
    format!("{:width$}", cell, width = width)
}

/// Join cells that are already fitted to their column widths
pub fn join_cells(cells: &[String]) -> String {
    let mut line = String::from("|");
    for cell in cells {
        line.push(' ');
        line.push_str(cell);
        line.push_str(" |");
    }
    line
}

/// Print a row of pre-fitted, possibly styled cells
pub fn print_cells(cells: &[String]) {
    println!("{}", join_cells(cells));
}

pub fn table_separator(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for &width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    line
}

/// Create a progress bar-like indicator
///
/// ```rust
/// # use live_load_metrics::utils::create_progress_indicator;
/// assert_eq!(create_progress_indicator(0, 100, 10), "░░░░░░░░░░");
/// assert_eq!(create_progress_indicator(50, 100, 10), "█████░░░░░");
/// ```
pub fn create_progress_indicator(current: usize, total: usize, width: usize) -> String {
    if total == 0 {
        return "█".repeat(width);
    }

    let progress = (current as f64 / total as f64).min(1.0);
    let filled = ((progress * width as f64) as usize).min(width);
    let empty = width - filled;

    format!("{}{}", "█".repeat(filled), "░".repeat(empty))
}
