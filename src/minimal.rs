//! In-memory generation of a complete minimal workbook container.
//!
//! Used by the engine bootstrap to prove the zip/XML toolchain round-trips
//! cleanly before any real portfolio file is touched, and by the test suite
//! as its fixture factory. Sheets follow the weekly-report shape: banner in
//! row 1, headers in row 2, data from row 3.

use std::io::{Cursor, Write};

use quick_xml::escape::escape;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::style::col_letter;
use crate::Result;

/// One sheet of a generated workbook.
#[derive(Debug, Clone)]
pub struct SheetSpec<'a> {
    pub name: &'a str,
    pub banner: &'a str,
    pub header: &'a [&'a str],
    pub rows: &'a [&'a [&'a str]],
}

const STYLES_XML: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
    r#"<fonts count="2"><font><sz val="11"/><name val="Calibri"/></font>"#,
    r#"<font><b/><sz val="11"/><name val="Calibri"/></font></fonts>"#,
    r#"<fills count="2"><fill><patternFill patternType="none"/></fill>"#,
    r#"<fill><patternFill patternType="gray125"/></fill></fills>"#,
    r#"<borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders>"#,
    r#"<cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs>"#,
    r#"<cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/>"#,
    r#"<xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"/></cellXfs>"#,
    r#"<cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles>"#,
    r#"</styleSheet>"#
);

/// Builds a complete workbook with the given sheets and returns its bytes.
pub fn minimal_workbook(sheets: &[SheetSpec<'_>]) -> Result<Vec<u8>> {
    let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
    let opt: FileOptions<'_, ()> = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(1));

    let mut content_types = String::from(concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
        r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
        r#"<Default Extension="xml" ContentType="application/xml"/>"#,
        r#"<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#,
        r#"<Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>"#,
    ));
    for i in 1..=sheets.len() {
        content_types.push_str(&format!(
            r#"<Override PartName="/xl/worksheets/sheet{i}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#
        ));
    }
    content_types.push_str("</Types>");

    let mut workbook = String::from(concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" "#,
        r#"xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#,
    ));
    let mut workbook_rels = String::from(concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    ));
    for (i, sheet) in sheets.iter().enumerate() {
        let n = i + 1;
        workbook.push_str(&format!(
            r#"<sheet name="{}" sheetId="{n}" r:id="rId{n}"/>"#,
            escape(sheet.name)
        ));
        workbook_rels.push_str(&format!(
            r#"<Relationship Id="rId{n}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{n}.xml"/>"#
        ));
    }
    workbook.push_str("</sheets></workbook>");
    workbook_rels.push_str(&format!(
        r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#,
        sheets.len() + 1
    ));
    workbook_rels.push_str("</Relationships>");

    let root_rels = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>"#,
        r#"</Relationships>"#
    );

    zout.start_file("[Content_Types].xml", opt)?;
    zout.write_all(content_types.as_bytes())?;
    zout.start_file("_rels/.rels", opt)?;
    zout.write_all(root_rels.as_bytes())?;
    zout.start_file("xl/workbook.xml", opt)?;
    zout.write_all(workbook.as_bytes())?;
    zout.start_file("xl/_rels/workbook.xml.rels", opt)?;
    zout.write_all(workbook_rels.as_bytes())?;
    zout.start_file("xl/styles.xml", opt)?;
    zout.write_all(STYLES_XML.as_bytes())?;

    for (i, sheet) in sheets.iter().enumerate() {
        zout.start_file(format!("xl/worksheets/sheet{}.xml", i + 1), opt)?;
        zout.write_all(sheet_xml(sheet).as_bytes())?;
    }

    let cursor = zout.finish()?;
    Ok(cursor.into_inner())
}

fn sheet_xml(sheet: &SheetSpec<'_>) -> String {
    let mut xml = String::from(concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    ));

    xml.push_str(&format!(
        r#"<row r="1"><c r="A1" s="1" t="inlineStr"><is><t>{}</t></is></c></row>"#,
        escape(sheet.banner)
    ));

    xml.push_str(r#"<row r="2">"#);
    for (col, label) in sheet.header.iter().enumerate() {
        xml.push_str(&cell_xml(2, col as u32, label, Some(1)));
    }
    xml.push_str("</row>");

    for (r, row) in sheet.rows.iter().enumerate() {
        let row_num = r as u32 + 3;
        xml.push_str(&format!(r#"<row r="{row_num}">"#));
        for (col, value) in row.iter().enumerate() {
            xml.push_str(&cell_xml(row_num, col as u32, value, None));
        }
        xml.push_str("</row>");
    }

    xml.push_str("</sheetData></worksheet>");
    xml
}

fn cell_xml(row: u32, col: u32, value: &str, style: Option<u32>) -> String {
    let coord = format!("{}{row}", col_letter(col));
    let style_attr = style.map(|s| format!(" s=\"{s}\"")).unwrap_or_default();
    if value.parse::<f64>().is_ok() {
        format!(r#"<c r="{coord}"{style_attr}><v>{value}</v></c>"#)
    } else {
        format!(
            r#"<c r="{coord}"{style_attr} t="inlineStr"><is><t>{}</t></is></c>"#,
            escape(value)
        )
    }
}
