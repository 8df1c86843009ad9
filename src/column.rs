//! Dated column labels and the header-row placement scan.

use chrono::{Datelike, Duration, NaiveDate, Utc};

use crate::editor::WorkbookEditor;
use crate::{PatchError, Result};

/// Every report-period column starts with this prefix; the date part varies.
pub const FAMILY_PREFIX: &str = "Net RTR";

/// Row 1 is the portfolio banner; row 2 carries the column headers.
pub const HEADER_ROW: u32 = 2;
/// First row of advance data.
pub const DATA_START_ROW: u32 = 3;

/// Accepted report-date shapes, tried in order.
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y"];

/// Controls the year-suffix rule for column labels.
///
/// Labels for the reference year (and any later year) carry a `/YY` suffix;
/// labels for earlier full years omit it, which keeps the dominant-case
/// header short. The reference defaults to the calendar year at run time.
#[derive(Debug, Clone, Copy)]
pub struct LabelOptions {
    pub current_year: i32,
}

impl Default for LabelOptions {
    fn default() -> Self {
        Self {
            current_year: Utc::now().year(),
        }
    }
}

/// Parses a report date from the shapes the upload UI produces.
pub fn parse_report_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Ok(date);
        }
    }
    Err(PatchError::InvalidDateFormat(raw.to_owned()))
}

/// Canonical header label for one report date, e.g. `Net RTR 3/14/25`.
///
/// A year below 100 means the input itself was a two-digit year; it always
/// keeps the suffix.
pub fn column_label(date: NaiveDate, opts: LabelOptions) -> String {
    let year = date.year();
    let two_digit_input = year < 100;
    if two_digit_input || year >= opts.current_year {
        format!(
            "{} {}/{}/{:02}",
            FAMILY_PREFIX,
            date.month(),
            date.day(),
            year.rem_euclid(100)
        )
    } else {
        format!("{} {}/{}", FAMILY_PREFIX, date.month(), date.day())
    }
}

/// Label of the report period one week before `date`.
pub fn prior_period_label(date: NaiveDate, opts: LabelOptions) -> String {
    column_label(date - Duration::days(7), opts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementMode {
    /// The label already exists; its data rows are cleared and rewritten.
    Replace,
    /// Placed directly right of the previous period's column.
    InsertAfterPrior,
    /// Placed right of the right-most report-period column.
    AppendAfterFamily,
    /// No report-period columns yet; placed after the last populated header.
    AppendAfterData,
}

/// Where the dated column goes on the current sheet (0-based column index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnPlacement {
    pub column: u32,
    pub mode: PlacementMode,
}

impl WorkbookEditor {
    /// Scans header row 2 once and decides where `target_label` belongs.
    ///
    /// Placement never shifts existing columns; it only picks an index
    /// relative to a reference column, so two periods that converge on the
    /// same index overwrite each other. That behavior is intentional and
    /// covered by a test.
    pub fn locate_column(&self, target_label: &str, prior_label: &str) -> Result<ColumnPlacement> {
        let mut exact: Option<u32> = None;
        let mut prior: Option<u32> = None;
        let mut last_family: Option<u32> = None;
        let mut last_data: Option<u32> = None;

        for (col, text) in self.row_cells(HEADER_ROW)? {
            let label = text.trim();
            if label.is_empty() {
                continue;
            }
            last_data = Some(last_data.map_or(col, |m: u32| m.max(col)));
            if label == target_label {
                exact = Some(col);
            }
            if label.starts_with(FAMILY_PREFIX) {
                last_family = Some(last_family.map_or(col, |m: u32| m.max(col)));
                if label == prior_label {
                    prior = Some(col);
                }
            }
        }

        let placement = if let Some(col) = exact {
            ColumnPlacement {
                column: col,
                mode: PlacementMode::Replace,
            }
        } else if let Some(col) = prior {
            ColumnPlacement {
                column: col + 1,
                mode: PlacementMode::InsertAfterPrior,
            }
        } else if let Some(col) = last_family {
            ColumnPlacement {
                column: col + 1,
                mode: PlacementMode::AppendAfterFamily,
            }
        } else {
            ColumnPlacement {
                column: last_data.map_or(0, |c| c + 1),
                mode: PlacementMode::AppendAfterData,
            }
        };
        Ok(placement)
    }
}
