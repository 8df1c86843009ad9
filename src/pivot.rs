//! Per-funder pivot aggregates handed over by the upload/aggregation layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Grand-total row appended by the aggregation step. It is not an advance
/// and must never be matched against workbook rows.
pub const TOTALS_SENTINEL: &str = "Totals";

/// One aggregated advance: gross collected, servicing fee, net remittance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotTableData {
    pub advance_id: String,
    pub merchant_name: String,
    pub gross_amount: f64,
    pub management_fee: f64,
    pub net_amount: f64,
}

/// Everything needed to patch one funder's sheet for one report date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunderPivotData {
    pub funder_name: String,
    pub sheet_name: String,
    pub pivot_data: Vec<PivotTableData>,
    pub file_path: String,
}

impl FunderPivotData {
    /// Net amount keyed by advance id, with the totals sentinel dropped.
    pub fn net_by_advance_id(&self) -> HashMap<&str, f64> {
        self.pivot_data
            .iter()
            .filter(|row| row.advance_id != TOTALS_SENTINEL)
            .map(|row| (row.advance_id.as_str(), row.net_amount))
            .collect()
    }
}
