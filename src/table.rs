//! Plain-text tables for run summaries and previews.

use std::borrow::Cow;
use std::fmt::Write as _;

/// Cells longer than this are cut with an ellipsis.
pub const MAX_CELL_WIDTH: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
}

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let column_count = headers.len();
    let mut widths = headers.iter().map(|h| char_width(h)).collect::<Vec<_>>();
    let mut numeric = vec![true; column_count];

    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            let cell = fit_cell(cell);
            widths[idx] = widths[idx].max(char_width(&cell));
            if !cell.is_empty() && !looks_numeric(&cell) {
                numeric[idx] = false;
            }
        }
    }
    let aligns = numeric
        .into_iter()
        .map(|n| if n && !rows.is_empty() { Align::Right } else { Align::Left })
        .collect::<Vec<_>>();

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths, &aligns));
    let rule = widths.iter().map(|w| "-".repeat((*w).max(1))).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&rule, &widths, &aligns));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths, &aligns));
    }
    output
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn format_row(values: &[String], widths: &[usize], aligns: &[Align]) -> String {
    let cells = values
        .iter()
        .zip(widths.iter().zip(aligns))
        .map(|(value, (width, align))| {
            let cell = fit_cell(value);
            let padding = " ".repeat(width.saturating_sub(char_width(&cell)));
            match align {
                Align::Left => format!("{cell}{padding}"),
                Align::Right => format!("{padding}{cell}"),
            }
        })
        .collect::<Vec<_>>();
    cells.join("  ").trim_end().to_string()
}

fn char_width(value: &str) -> usize {
    value.chars().count()
}

fn looks_numeric(value: &str) -> bool {
    value.parse::<f64>().is_ok()
}

/// Flattens control whitespace and truncates to [`MAX_CELL_WIDTH`].
fn fit_cell(value: &str) -> Cow<'_, str> {
    let needs_flatten = value.contains(['\n', '\r', '\t']);
    let too_wide = char_width(value) > MAX_CELL_WIDTH;
    if !needs_flatten && !too_wide {
        return Cow::Borrowed(value);
    }
    let mut fitted = value
        .chars()
        .map(|ch| if matches!(ch, '\n' | '\r' | '\t') { ' ' } else { ch })
        .take(if too_wide { MAX_CELL_WIDTH - 1 } else { usize::MAX })
        .collect::<String>();
    if too_wide {
        fitted.push('…');
    }
    Cow::Owned(fitted)
}
