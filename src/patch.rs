//! The per-funder patch pass and the invocation-level orchestration.
//!
//! One invocation owns one workbook: for every funder, in the order
//! supplied, the dated column is located, styled and populated; the patched
//! container is then re-serialized, sanity-checked and handed back with a
//! suggested output filename.

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::column::{
    column_label, parse_report_date, prior_period_label, ColumnPlacement, PlacementMode,
    DATA_START_ROW, HEADER_ROW,
};
use crate::editor::{verify_container, CellValue, WorkbookEditor};
use crate::engine::{EngineProvisioner, PatchEngine};
use crate::pivot::FunderPivotData;
use crate::style::FINANCIAL_STYLE_COL;
use crate::{PatchError, Result};

/// Header fragment that marks the advance-id key column. Funder templates
/// drift ("Funder Advance ID", "Funder Advance ID #"), so matching is by
/// substring rather than equality.
pub const KEY_HEADER_FRAGMENT: &str = "Funder Advance ID";

/// Column A holds the advance id in templates whose header never matched.
pub const DEFAULT_KEY_COL: u32 = 0;

/// One "update Net RTR" invocation.
#[derive(Debug, Clone)]
pub struct PortfolioUpdateRequest {
    pub portfolio_name: String,
    /// `YYYY-MM-DD` or `MM/DD/YYYY`, as produced by the report-date picker.
    pub report_date: String,
    pub workbook_bytes: Vec<u8>,
    pub funder_pivots: Vec<FunderPivotData>,
}

/// Per-funder diagnostics surfaced to the caller.
#[derive(Debug, Clone)]
pub struct FunderPatchSummary {
    pub funder_name: String,
    pub sheet_name: String,
    pub updated_rows: u32,
    /// The funder's sheet was absent; the rest of the batch continued.
    pub skipped_missing_sheet: bool,
}

/// Result of a successful invocation.
#[derive(Debug)]
pub struct PortfolioUpdateOutcome {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub byte_count: usize,
    pub funders: Vec<FunderPatchSummary>,
}

/// Suggested name for the updated workbook file.
pub fn resolve_filename(portfolio_name: &str, report_date: NaiveDate) -> String {
    format!(
        "{portfolio_name}_Portfolio_Updated_{}.xlsx",
        report_date.format("%m-%d-%Y")
    )
}

/// Ensures the engine is ready, then runs the patch. This is the entry point
/// the surrounding application calls after the user picks a report date.
pub async fn update_net_rtr(
    provisioner: &EngineProvisioner,
    request: PortfolioUpdateRequest,
) -> Result<PortfolioUpdateOutcome> {
    let engine = provisioner.initialize().await?;
    engine.update_portfolio_workbook(request).await
}

impl PatchEngine {
    /// Patches every funder's sheet and re-serializes the workbook.
    ///
    /// Funders are processed strictly in the supplied order; a missing sheet
    /// skips that funder with a warning and the batch continues.
    pub async fn update_portfolio_workbook(
        &self,
        request: PortfolioUpdateRequest,
    ) -> Result<PortfolioUpdateOutcome> {
        let report_date = parse_report_date(&request.report_date)?;
        let target_label = column_label(report_date, self.labels);
        let prior_label = prior_period_label(report_date, self.labels);
        info!(
            portfolio = %request.portfolio_name,
            %target_label,
            funders = request.funder_pivots.len(),
            "updating portfolio workbook"
        );

        let mut editor = WorkbookEditor::from_bytes(request.workbook_bytes)?;
        let mut funders = Vec::with_capacity(request.funder_pivots.len());

        for funder in &request.funder_pivots {
            match editor.select_sheet(&funder.sheet_name) {
                Ok(()) => {}
                Err(PatchError::MissingSheet(name)) => {
                    warn!(
                        funder = %funder.funder_name,
                        sheet = %name,
                        "sheet not found; skipping funder"
                    );
                    funders.push(FunderPatchSummary {
                        funder_name: funder.funder_name.clone(),
                        sheet_name: funder.sheet_name.clone(),
                        updated_rows: 0,
                        skipped_missing_sheet: true,
                    });
                    continue;
                }
                Err(err) => return Err(err),
            }

            let placement = editor.locate_column(&target_label, &prior_label)?;
            let updated_rows = apply_funder_column(&mut editor, funder, &target_label, placement)?;
            info!(
                funder = %funder.funder_name,
                column = placement.column,
                mode = ?placement.mode,
                updated_rows,
                "funder sheet patched"
            );
            funders.push(FunderPatchSummary {
                funder_name: funder.funder_name.clone(),
                sheet_name: funder.sheet_name.clone(),
                updated_rows,
                skipped_missing_sheet: false,
            });

            // suspension point so callers can cancel between funder passes
            tokio::task::yield_now().await;
        }

        let bytes = editor.into_bytes()?;
        if !verify_container(&bytes) {
            return Err(PatchError::CorruptOutput);
        }
        let file_name = resolve_filename(&request.portfolio_name, report_date);
        debug!(bytes = bytes.len(), %file_name, "workbook serialized");

        Ok(PortfolioUpdateOutcome {
            byte_count: bytes.len(),
            file_name,
            funders,
            bytes,
        })
    }
}

/// Writes one funder's net amounts into the placed column of the currently
/// selected sheet. Returns how many workbook rows were updated.
fn apply_funder_column(
    editor: &mut WorkbookEditor,
    funder: &FunderPivotData,
    target_label: &str,
    placement: ColumnPlacement,
) -> Result<u32> {
    let col = placement.column;

    match placement.mode {
        PlacementMode::Replace => {
            // rerun of the same report date: rewrite, never accumulate
            let cleared = editor.clear_column_below(col, DATA_START_ROW)?;
            debug!(cleared, column = col, "cleared prior period values");
        }
        _ => {
            editor.set_cell(HEADER_ROW, col, CellValue::text(target_label), None)?;
            editor.propagate_header_style(col)?;
        }
    }

    let key_col = find_key_column(editor)?;
    let style_ref_col = style_reference_col(editor, col)?;
    let net_by_id = funder.net_by_advance_id();

    let mut updated_rows = 0;
    for (row, advance_id) in editor.column_values(key_col, DATA_START_ROW)? {
        let Some(net) = net_by_id.get(advance_id.as_str()) else {
            continue;
        };
        let ref_style = editor.cell_style_id(row, style_ref_col)?;
        let style = editor.currency_style_from(ref_style)?;
        editor.set_cell(row, col, CellValue::Number(*net), Some(style))?;
        updated_rows += 1;
    }
    Ok(updated_rows)
}

/// Finds the advance-id column on the current sheet, falling back to the
/// documented default when no header matches.
fn find_key_column(editor: &WorkbookEditor) -> Result<u32> {
    Ok(editor
        .row_cells(HEADER_ROW)?
        .iter()
        .find(|(_, text)| text.contains(KEY_HEADER_FRAGMENT))
        .map(|(col, _)| *col)
        .unwrap_or(DEFAULT_KEY_COL))
}

/// Reference column for data-cell styling: the fixed financial column when
/// its header is populated, else the column left of the new one.
fn style_reference_col(editor: &WorkbookEditor, new_col: u32) -> Result<u32> {
    let has_financial = editor
        .row_cells(HEADER_ROW)?
        .iter()
        .any(|(col, text)| *col == FINANCIAL_STYLE_COL && !text.trim().is_empty());
    if has_financial {
        Ok(FINANCIAL_STYLE_COL)
    } else {
        Ok(new_col.saturating_sub(1))
    }
}
