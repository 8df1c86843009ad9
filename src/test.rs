use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::FutureExt;
use tracing_subscriber::EnvFilter;

use crate::column::{
    column_label, parse_report_date, prior_period_label, LabelOptions, PlacementMode, HEADER_ROW,
};
use crate::editor::{verify_container, WorkbookEditor};
use crate::engine::{EngineProvisioner, PatchEngine};
use crate::minimal::{minimal_workbook, SheetSpec};
use crate::patch::{
    resolve_filename, update_net_rtr, PortfolioUpdateOutcome, PortfolioUpdateRequest,
};
use crate::pivot::{FunderPivotData, PivotTableData};
use crate::PatchError;

fn init_tracing() {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env).try_init();
}

fn labels_2025() -> LabelOptions {
    LabelOptions { current_year: 2025 }
}

fn engine_2025() -> PatchEngine {
    PatchEngine::with_label_options(labels_2025())
}

fn pivot_row(id: &str, net: f64) -> PivotTableData {
    PivotTableData {
        advance_id: id.to_owned(),
        merchant_name: format!("{id} Merchant"),
        gross_amount: net + 50.0,
        management_fee: 50.0,
        net_amount: net,
    }
}

fn funder(sheet: &str, rows: Vec<PivotTableData>) -> FunderPivotData {
    FunderPivotData {
        funder_name: sheet.to_owned(),
        sheet_name: sheet.to_owned(),
        pivot_data: rows,
        file_path: format!("uploads/{sheet}.csv"),
    }
}

fn portfolio_workbook() -> Vec<u8> {
    minimal_workbook(&[SheetSpec {
        name: "FunderX",
        banner: "Alder Portfolio Weekly Report",
        header: &["ID", "Name", "Amt"],
        rows: &[
            &["A1", "Acme Supply", "100.5"],
            &["B2", "Bright Labs", "200"],
            &["Totals", "", "300.5"],
        ],
    }])
    .unwrap()
}

async fn run_patch(
    bytes: Vec<u8>,
    date: &str,
    funders: Vec<FunderPivotData>,
) -> crate::Result<PortfolioUpdateOutcome> {
    init_tracing();
    engine_2025()
        .update_portfolio_workbook(PortfolioUpdateRequest {
            portfolio_name: "Alder".to_owned(),
            report_date: date.to_owned(),
            workbook_bytes: bytes,
            funder_pivots: funders,
        })
        .await
}

fn open_sheet(bytes: &[u8], sheet: &str) -> Result<WorkbookEditor> {
    let mut editor = WorkbookEditor::from_bytes(bytes.to_vec())?;
    editor.select_sheet(sheet)?;
    Ok(editor)
}

fn cell_text(editor: &WorkbookEditor, row: u32, col: u32) -> Option<String> {
    editor
        .row_cells(row)
        .unwrap()
        .into_iter()
        .find(|(c, _)| *c == col)
        .map(|(_, text)| text)
}

/* ---------------- column naming ---------------- */

#[test]
fn label_carries_year_suffix_for_current_year() {
    let date = parse_report_date("2025-01-17").unwrap();
    assert_eq!(column_label(date, labels_2025()), "Net RTR 1/17/25");
}

#[test]
fn label_omits_year_suffix_for_past_years() {
    let date = parse_report_date("2023-06-02").unwrap();
    assert_eq!(column_label(date, labels_2025()), "Net RTR 6/2");
}

#[test]
fn label_keeps_suffix_for_future_and_two_digit_years() {
    let future = parse_report_date("2026-02-06").unwrap();
    assert_eq!(column_label(future, labels_2025()), "Net RTR 2/6/26");

    // a two-digit year in the input stays a two-digit suffix
    let short = parse_report_date("1/17/25").unwrap();
    assert_eq!(column_label(short, labels_2025()), "Net RTR 1/17/25");
}

#[test]
fn report_date_accepts_both_ui_shapes() {
    let iso = parse_report_date("2025-03-14").unwrap();
    let us = parse_report_date("3/14/2025").unwrap();
    let dashed = parse_report_date("03-14-2025").unwrap();
    assert_eq!(iso, us);
    assert_eq!(iso, dashed);
}

#[test]
fn unparseable_report_date_is_rejected() {
    let err = parse_report_date("next friday").unwrap_err();
    assert!(matches!(err, PatchError::InvalidDateFormat(_)));
}

#[test]
fn prior_period_is_one_week_back() {
    let date = parse_report_date("2025-03-14").unwrap();
    assert_eq!(prior_period_label(date, labels_2025()), "Net RTR 3/7/25");
}

#[test]
fn output_filename_uses_dashed_date() {
    let date = parse_report_date("2025-03-14").unwrap();
    assert_eq!(
        resolve_filename("Alder", date),
        "Alder_Portfolio_Updated_03-14-2025.xlsx"
    );
}

/* ---------------- column placement ---------------- */

fn workbook_with_header(header: &[&str]) -> Vec<u8> {
    minimal_workbook(&[SheetSpec {
        name: "S",
        banner: "banner",
        header,
        rows: &[&["A1", "x", "1"]],
    }])
    .unwrap()
}

#[test]
fn exact_header_match_replaces() -> Result<()> {
    let editor = open_sheet(
        &workbook_with_header(&["ID", "Name", "Net RTR 3/14/25"]),
        "S",
    )?;
    let placement = editor.locate_column("Net RTR 3/14/25", "Net RTR 3/7/25")?;
    assert_eq!(placement.mode, PlacementMode::Replace);
    assert_eq!(placement.column, 2);
    Ok(())
}

#[test]
fn prior_period_column_anchors_placement() -> Result<()> {
    let editor = open_sheet(
        &workbook_with_header(&["ID", "Net RTR 3/7/25", "Net RTR 2/28/25"]),
        "S",
    )?;
    let placement = editor.locate_column("Net RTR 3/14/25", "Net RTR 3/7/25")?;
    assert_eq!(placement.mode, PlacementMode::InsertAfterPrior);
    assert_eq!(placement.column, 2);
    Ok(())
}

#[test]
fn family_columns_anchor_placement_without_prior() -> Result<()> {
    let editor = open_sheet(
        &workbook_with_header(&["ID", "Net RTR 2/21/25", "Net RTR 2/28/25", "Memo"]),
        "S",
    )?;
    let placement = editor.locate_column("Net RTR 3/14/25", "Net RTR 3/7/25")?;
    assert_eq!(placement.mode, PlacementMode::AppendAfterFamily);
    assert_eq!(placement.column, 3);
    Ok(())
}

#[test]
fn first_period_appends_after_last_header() -> Result<()> {
    let editor = open_sheet(&workbook_with_header(&["ID", "Name", "Amt"]), "S")?;
    let placement = editor.locate_column("Net RTR 3/14/25", "Net RTR 3/7/25")?;
    assert_eq!(placement.mode, PlacementMode::AppendAfterData);
    assert_eq!(placement.column, 3);
    Ok(())
}

/* ---------------- end to end ---------------- */

#[tokio::test]
async fn patch_adds_dated_column() -> Result<()> {
    let out = run_patch(
        portfolio_workbook(),
        "2025-03-14",
        vec![funder("FunderX", vec![pivot_row("A1", 500.0)])],
    )
    .await?;

    assert!(verify_container(&out.bytes));
    assert_eq!(out.byte_count, out.bytes.len());
    assert_eq!(out.file_name, "Alder_Portfolio_Updated_03-14-2025.xlsx");
    assert_eq!(out.funders.len(), 1);
    assert_eq!(out.funders[0].updated_rows, 1);
    assert!(!out.funders[0].skipped_missing_sheet);

    let editor = open_sheet(&out.bytes, "FunderX")?;
    assert_eq!(
        cell_text(&editor, HEADER_ROW, 3).as_deref(),
        Some("Net RTR 3/14/25")
    );
    assert_eq!(cell_text(&editor, 3, 3).as_deref(), Some("500"));
    // unmatched workbook row stays blank in the new column
    assert_eq!(cell_text(&editor, 4, 3), None);
    Ok(())
}

#[tokio::test]
async fn rerun_for_same_date_is_idempotent() -> Result<()> {
    let funders = || vec![funder("FunderX", vec![pivot_row("A1", 500.0)])];
    let first = run_patch(portfolio_workbook(), "2025-03-14", funders()).await?;
    let second = run_patch(first.bytes.clone(), "2025-03-14", funders()).await?;

    assert_eq!(second.funders[0].updated_rows, 1);

    let before = open_sheet(&first.bytes, "FunderX")?;
    let after = open_sheet(&second.bytes, "FunderX")?;
    assert_eq!(before.row_cells(HEADER_ROW)?, after.row_cells(HEADER_ROW)?);
    assert_eq!(before.row_cells(3)?, after.row_cells(3)?);
    // no second dated column appeared
    assert_eq!(cell_text(&after, HEADER_ROW, 4), None);
    Ok(())
}

#[tokio::test]
async fn replace_clears_rows_dropped_from_the_pivot() -> Result<()> {
    let first = run_patch(
        portfolio_workbook(),
        "2025-03-14",
        vec![funder(
            "FunderX",
            vec![pivot_row("A1", 500.0), pivot_row("B2", 250.0)],
        )],
    )
    .await?;
    let editor = open_sheet(&first.bytes, "FunderX")?;
    assert_eq!(cell_text(&editor, 4, 3).as_deref(), Some("250"));

    let second = run_patch(
        first.bytes,
        "2025-03-14",
        vec![funder("FunderX", vec![pivot_row("A1", 111.0)])],
    )
    .await?;
    let editor = open_sheet(&second.bytes, "FunderX")?;
    assert_eq!(cell_text(&editor, 3, 3).as_deref(), Some("111"));
    assert_eq!(cell_text(&editor, 4, 3), None);
    Ok(())
}

#[tokio::test]
async fn missing_sheet_skips_funder_and_continues() -> Result<()> {
    let out = run_patch(
        portfolio_workbook(),
        "2025-03-14",
        vec![
            funder("Ghost", vec![pivot_row("A1", 42.0)]),
            funder("FunderX", vec![pivot_row("A1", 500.0)]),
        ],
    )
    .await?;

    assert!(out.funders[0].skipped_missing_sheet);
    assert_eq!(out.funders[0].updated_rows, 0);
    assert!(!out.funders[1].skipped_missing_sheet);
    assert_eq!(out.funders[1].updated_rows, 1);

    let editor = open_sheet(&out.bytes, "FunderX")?;
    assert_eq!(cell_text(&editor, 3, 3).as_deref(), Some("500"));
    Ok(())
}

#[tokio::test]
async fn totals_sentinel_is_never_written() -> Result<()> {
    let out = run_patch(
        portfolio_workbook(),
        "2025-03-14",
        vec![funder(
            "FunderX",
            vec![pivot_row("A1", 500.0), pivot_row("Totals", 999.0)],
        )],
    )
    .await?;

    assert_eq!(out.funders[0].updated_rows, 1);
    let editor = open_sheet(&out.bytes, "FunderX")?;
    // the workbook's own Totals row (row 5) gets no value either
    assert_eq!(cell_text(&editor, 5, 3), None);
    Ok(())
}

#[tokio::test]
async fn converging_periods_overwrite_the_occupying_column() -> Result<()> {
    // Placement never shifts columns: the period after 3/7 lands on the
    // Notes column and replaces its header. Inherited behavior, kept as is.
    let bytes = minimal_workbook(&[SheetSpec {
        name: "FunderX",
        banner: "banner",
        header: &["ID", "Name", "Net RTR 3/7/25", "Notes"],
        rows: &[&["A1", "Acme Supply", "90", "keep"]],
    }])
    .unwrap();

    let out = run_patch(
        bytes,
        "2025-03-14",
        vec![funder("FunderX", vec![pivot_row("A1", 500.0)])],
    )
    .await?;

    let editor = open_sheet(&out.bytes, "FunderX")?;
    assert_eq!(
        cell_text(&editor, HEADER_ROW, 3).as_deref(),
        Some("Net RTR 3/14/25")
    );
    assert_eq!(cell_text(&editor, 3, 3).as_deref(), Some("500"));
    Ok(())
}

#[tokio::test]
async fn key_column_found_by_header_fragment() -> Result<()> {
    let bytes = minimal_workbook(&[SheetSpec {
        name: "FunderX",
        banner: "banner",
        header: &["Row", "Funder Advance ID #", "Amt"],
        rows: &[&["1", "A1", "100"], &["2", "B2", "200"]],
    }])
    .unwrap();

    let out = run_patch(
        bytes,
        "2025-03-14",
        vec![funder("FunderX", vec![pivot_row("B2", 75.5)])],
    )
    .await?;

    assert_eq!(out.funders[0].updated_rows, 1);
    let editor = open_sheet(&out.bytes, "FunderX")?;
    assert_eq!(cell_text(&editor, 4, 3).as_deref(), Some("75.5"));
    assert_eq!(cell_text(&editor, 3, 3), None);
    Ok(())
}

#[tokio::test]
async fn new_cells_carry_currency_format_and_header_style() -> Result<()> {
    let out = run_patch(
        portfolio_workbook(),
        "2025-03-14",
        vec![funder("FunderX", vec![pivot_row("A1", 500.0)])],
    )
    .await?;

    let editor = open_sheet(&out.bytes, "FunderX")?;
    // header style copied from the left neighbor (bold header xf)
    assert_eq!(
        editor.cell_style_id(HEADER_ROW, 3)?,
        editor.cell_style_id(HEADER_ROW, 2)?
    );
    // data cell points at a freshly registered xf, not the default
    let data_style = editor.cell_style_id(3, 3)?;
    assert!(data_style.is_some());
    assert!(data_style.unwrap() > 1);

    let styles = String::from_utf8(editor.styles_xml.clone())?;
    assert!(styles.contains("formatCode=\"&quot;$&quot;#,##0.00\""));
    Ok(())
}

#[tokio::test]
async fn updated_workbook_survives_disk_round_trip() -> Result<()> {
    let out = run_patch(
        portfolio_workbook(),
        "2025-03-14",
        vec![funder("FunderX", vec![pivot_row("A1", 500.0)])],
    )
    .await?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join(&out.file_name);
    std::fs::write(&path, &out.bytes)?;
    let bytes = std::fs::read(&path)?;
    assert!(verify_container(&bytes));

    let editor = open_sheet(&bytes, "FunderX")?;
    assert_eq!(cell_text(&editor, 3, 3).as_deref(), Some("500"));
    Ok(())
}

#[tokio::test]
async fn invalid_report_date_aborts_before_editing() {
    let err = run_patch(
        portfolio_workbook(),
        "bogus",
        vec![funder("FunderX", vec![pivot_row("A1", 500.0)])],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PatchError::InvalidDateFormat(_)));
}

/* ---------------- fixtures & container ---------------- */

#[test]
fn generated_workbook_round_trips() -> Result<()> {
    let bytes = portfolio_workbook();
    assert!(verify_container(&bytes));

    let mut editor = WorkbookEditor::from_bytes(bytes)?;
    assert_eq!(editor.sheet_names(), vec!["FunderX"]);
    editor.select_sheet("FunderX")?;
    assert_eq!(editor.last_row()?, 5);

    let out = editor.into_bytes()?;
    assert!(verify_container(&out));
    Ok(())
}

#[tokio::test]
async fn shared_string_keys_resolve_through_the_table() -> Result<()> {
    // real templates store text via the shared-string table, not inline
    let bytes = workbook_with_shared_strings()?;
    let out = run_patch(
        bytes,
        "2025-03-14",
        vec![funder("FunderX", vec![pivot_row("A1", 500.0)])],
    )
    .await?;

    assert_eq!(out.funders[0].updated_rows, 1);
    let editor = open_sheet(&out.bytes, "FunderX")?;
    assert_eq!(
        cell_text(&editor, HEADER_ROW, 2).as_deref(),
        Some("Net RTR 3/14/25")
    );
    assert_eq!(cell_text(&editor, 3, 2).as_deref(), Some("500"));
    Ok(())
}

fn workbook_with_shared_strings() -> Result<Vec<u8>> {
    use std::io::{Cursor, Read, Write};

    const SHEET: &str = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
        r#"<row r="1"><c r="A1" s="1" t="s"><v>2</v></c></row>"#,
        r#"<row r="2"><c r="A2" s="1" t="s"><v>3</v></c><c r="B2" s="1" t="s"><v>4</v></c></row>"#,
        r#"<row r="3"><c r="A3" t="s"><v>0</v></c><c r="B3"><v>100.5</v></c></row>"#,
        r#"<row r="4"><c r="A4" t="s"><v>1</v></c><c r="B4"><v>200</v></c></row>"#,
        r#"</sheetData></worksheet>"#
    );
    const SHARED: &str = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="5" uniqueCount="5">"#,
        r#"<si><t>A1</t></si><si><t>B2</t></si><si><t>Banner</t></si>"#,
        r#"<si><t>ID</t></si><si><t>Amt</t></si></sst>"#
    );

    let base = portfolio_workbook();
    let mut zin = zip::ZipArchive::new(Cursor::new(base.as_slice()))?;
    let mut zout = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let opt: zip::write::FileOptions<'_, ()> = Default::default();

    for i in 0..zin.len() {
        let mut file = zin.by_index(i)?;
        let name = file.name().to_owned();
        zout.start_file(name.clone(), opt)?;
        if name == "xl/worksheets/sheet1.xml" {
            zout.write_all(SHEET.as_bytes())?;
        } else {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            zout.write_all(&buf)?;
        }
    }
    zout.start_file("xl/sharedStrings.xml", opt)?;
    zout.write_all(SHARED.as_bytes())?;
    Ok(zout.finish()?.into_inner())
}

/* ---------------- provisioner ---------------- */

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_initialization_coalesces_to_one_bootstrap() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let provisioner = Arc::new(EngineProvisioner::with_bootstrap(Arc::new(move || {
        let calls = counter.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(PatchEngine::new())
        }
        .boxed()
    })));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let provisioner = provisioner.clone();
        handles.push(tokio::spawn(async move { provisioner.initialize().await }));
    }
    let mut engines = Vec::new();
    for handle in handles {
        engines.push(handle.await.unwrap()?);
    }

    for engine in &engines[1..] {
        assert!(Arc::ptr_eq(&engines[0], engine));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(provisioner.bootstrap_attempts(), 1);
    assert!(provisioner.is_ready());
    Ok(())
}

#[tokio::test]
async fn failed_bootstrap_resets_state_and_allows_retry() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let provisioner = EngineProvisioner::with_bootstrap(Arc::new(move || {
        let calls = counter.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("dependency fetch failed");
            }
            Ok(PatchEngine::new())
        }
        .boxed()
    }));

    let err = provisioner.initialize().await.unwrap_err();
    assert!(matches!(err, PatchError::RuntimeBootstrap(_)));
    assert!(!provisioner.is_ready());
    assert!(!provisioner.is_initializing());

    provisioner.initialize().await?;
    assert!(provisioner.is_ready());
    assert_eq!(provisioner.bootstrap_attempts(), 2);
    Ok(())
}

#[tokio::test]
async fn preload_bootstraps_without_blocking() -> Result<()> {
    let provisioner = EngineProvisioner::with_bootstrap(Arc::new(|| {
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(PatchEngine::new())
        }
        .boxed()
    }));

    provisioner.preload();
    assert!(provisioner.is_initializing() || provisioner.is_ready());

    for _ in 0..100 {
        if provisioner.is_ready() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(provisioner.is_ready());
    assert_eq!(provisioner.bootstrap_attempts(), 1);

    // a later caller reuses the preloaded engine
    provisioner.initialize().await?;
    assert_eq!(provisioner.bootstrap_attempts(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_caller_does_not_cancel_bootstrap() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let provisioner = Arc::new(EngineProvisioner::with_bootstrap(Arc::new(move || {
        let calls = counter.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(PatchEngine::new())
        }
        .boxed()
    })));

    let first = {
        let provisioner = provisioner.clone();
        tokio::spawn(async move { provisioner.initialize().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.abort();

    // the in-flight bootstrap keeps running and is reused, not restarted
    provisioner.initialize().await?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(provisioner.bootstrap_attempts(), 1);
    Ok(())
}

#[tokio::test]
async fn default_bootstrap_self_check_passes() -> Result<()> {
    let provisioner = EngineProvisioner::new();
    provisioner.initialize().await?;
    assert!(provisioner.is_ready());
    Ok(())
}

#[tokio::test]
async fn update_net_rtr_drives_the_provisioner() -> Result<()> {
    let provisioner = EngineProvisioner::with_bootstrap(Arc::new(|| {
        async { Ok(PatchEngine::with_label_options(LabelOptions { current_year: 2025 })) }.boxed()
    }));

    let out = update_net_rtr(
        &provisioner,
        PortfolioUpdateRequest {
            portfolio_name: "Alder".to_owned(),
            report_date: "2025-03-14".to_owned(),
            workbook_bytes: portfolio_workbook(),
            funder_pivots: vec![funder("FunderX", vec![pivot_row("A1", 500.0)])],
        },
    )
    .await?;

    assert!(provisioner.is_ready());
    assert_eq!(out.funders[0].updated_rows, 1);
    Ok(())
}
