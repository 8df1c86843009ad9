//! lib.rs — core of xlsx-rtr-patch.
//!
//! Patches per-funder "Net RTR" pivot aggregates into an existing portfolio
//! workbook as a dated column, leaving every other part of the OOXML
//! container byte-identical. The workbook is edited in memory: sheet XML is
//! spliced directly, untouched archive entries are copied raw on save.

pub mod column;
pub mod editor;
pub mod engine;
pub mod minimal;
pub mod patch;
pub mod pivot;
pub mod style;
#[cfg(test)]
mod test;

use thiserror::Error;

pub use column::{
    column_label, parse_report_date, prior_period_label, ColumnPlacement, LabelOptions,
    PlacementMode,
};
pub use editor::{verify_container, WorkbookEditor};
pub use engine::{BootstrapFn, EngineProvisioner, PatchEngine};
pub use patch::{
    resolve_filename, update_net_rtr, FunderPatchSummary, PortfolioUpdateOutcome,
    PortfolioUpdateRequest,
};
pub use pivot::{FunderPivotData, PivotTableData};

/// Failure modes of a portfolio patch run.
///
/// `MissingSheet` is recovered per funder (the batch continues); every other
/// variant aborts the whole invocation and is shown to the user.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("invalid report date '{0}': expected YYYY-MM-DD or MM/DD/YYYY")]
    InvalidDateFormat(String),

    #[error("sheet '{0}' not found in workbook")]
    MissingSheet(String),

    #[error("patch engine bootstrap failed: {0}")]
    RuntimeBootstrap(String),

    #[error("updated workbook does not start with the ZIP container magic")]
    CorruptOutput,

    #[error("workbook container: {0}")]
    Container(#[from] zip::result::ZipError),

    #[error("workbook xml: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed workbook: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;
