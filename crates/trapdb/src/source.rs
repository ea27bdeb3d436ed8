//! Source listing around a stop location.

use std::fs;

use libtrapdb::symbols::SourceLocation;
use log::debug;

/// Lines shown on each side of the current one.
pub const CONTEXT_LINES: u32 = 2;

/// Renders the lines around `line` (1-based), marking it with `> `.
///
/// Near the top of the file the window extends downwards so the same number of lines
/// is shown.
pub fn context(text: &str, line: u32, radius: u32) -> Vec<String> {
    let start = line.saturating_sub(radius).max(1);
    let end = line + radius + radius.saturating_sub(line.saturating_sub(1));

    (1u32..)
        .zip(text.lines())
        .skip_while(|(n, _)| *n < start)
        .take_while(|(n, _)| *n <= end)
        .map(|(n, text)| {
            let marker = if n == line { ">" } else { " " };
            format!("{marker} {n:>4}  {text}")
        })
        .collect()
}

/// Prints the source around `location`. An unreadable file prints nothing.
pub fn print(location: &SourceLocation) {
    let text = match fs::read_to_string(&location.file) {
        Ok(text) => text,
        Err(e) => {
            debug!("no source for {location}: {e}");
            return;
        }
    };
    for line in context(&text, location.line, CONTEXT_LINES) {
        println!("{line}");
    }
}
