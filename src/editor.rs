//! In-memory workbook editor over the OOXML container.
//!
//! The source archive stays untouched as a byte buffer; only the parts this
//! run edits (sheet XML, styles.xml) are held as mutable buffers and swapped
//! in when the workbook is re-serialized. Everything else is copied raw, so
//! formulas, formatting and foreign parts survive byte-identical.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::style::{col_index, coord};
use crate::{PatchError, Result};

/// Decode and entity-unescape the content of a text event.
///
/// Replaces the `BytesText::unescape` convenience method removed in
/// quick-xml 0.38: decode the raw bytes, then resolve XML entity references.
fn unescape_text(t: &BytesText) -> Result<String> {
    let decoded = t.decode().map_err(quick_xml::Error::from)?;
    Ok(quick_xml::escape::unescape(&decoded)
        .map_err(quick_xml::Error::from)?
        .into_owned())
}

/// Leading bytes of every ZIP-based document ("PK").
pub const ZIP_MAGIC: [u8; 2] = [0x50, 0x4B];

/// Cheap sanity check that a workbook write did not corrupt the container.
pub fn verify_container(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[..2] == ZIP_MAGIC
}

static COORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z]+)([0-9]+)$").unwrap());

/// Splits `"D3"` into `(row 3, col 3)`; columns are 0-based.
pub(crate) fn parse_coord(raw: &str) -> Option<(u32, u32)> {
    let caps = COORD_RE.captures(raw)?;
    let col = col_index(caps.get(1)?.as_str()) as u32;
    let row = caps.get(2)?.as_str().parse().ok()?;
    Some((row, col))
}

/// A value being written into a cell.
#[derive(Debug, Clone)]
pub enum CellValue {
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

struct CurrentSheet {
    part_path: String,
    xml: Vec<u8>,
    last_row: u32,
}

/// Editor over one workbook's bytes. One patch run owns exactly one editor;
/// it is consumed by [`WorkbookEditor::into_bytes`].
pub struct WorkbookEditor {
    src_bytes: Vec<u8>,
    /// `(sheet name, part path)` in workbook order.
    sheets: Vec<(String, String)>,
    shared_strings: Vec<String>,
    pub(crate) styles_xml: Vec<u8>,
    /// Currency-style lookup keyed by the source cell's xf id.
    pub(crate) style_cache: HashMap<u32, u32>,
    cur: Option<CurrentSheet>,
    /// Sheet parts already patched this run, awaiting serialization.
    staged: Vec<(String, Vec<u8>)>,
}

impl WorkbookEditor {
    /// Decodes the container and loads the parts needed for patching:
    /// sheet name resolution, shared strings and the style sheet.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let (sheets, shared_strings, styles_xml) = {
            let mut zip = ZipArchive::new(Cursor::new(bytes.as_slice()))?;

            let workbook_xml = read_required(&mut zip, "xl/workbook.xml")?;
            let rels_xml = read_required(&mut zip, "xl/_rels/workbook.xml.rels")?;
            let styles_xml = read_required(&mut zip, "xl/styles.xml")?;

            let shared_strings = match read_optional(&mut zip, "xl/sharedStrings.xml")? {
                Some(xml) => parse_shared_strings(&xml)?,
                None => Vec::new(),
            };

            let sheets = parse_sheet_entries(&workbook_xml, &rels_xml)?;
            (sheets, shared_strings, styles_xml)
        };

        Ok(Self {
            src_bytes: bytes,
            sheets,
            shared_strings,
            styles_xml,
            style_cache: HashMap::new(),
            cur: None,
            staged: Vec::new(),
        })
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Makes `name` the sheet all subsequent cell operations target.
    ///
    /// The previously selected sheet is staged so its edits survive; a
    /// re-selected sheet resumes from its staged state.
    pub fn select_sheet(&mut self, name: &str) -> Result<()> {
        let part_path = self
            .sheets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| PatchError::MissingSheet(name.to_owned()))?;

        if let Some(prev) = self.cur.take() {
            stage_part(&mut self.staged, prev.part_path, prev.xml);
        }

        let xml = match self.staged.iter().find(|(p, _)| *p == part_path) {
            Some((_, staged)) => staged.clone(),
            None => {
                let mut zip = ZipArchive::new(Cursor::new(self.src_bytes.as_slice()))?;
                read_required(&mut zip, &part_path)?
            }
        };
        let last_row = scan_last_row(&xml)?;
        self.cur = Some(CurrentSheet {
            part_path,
            xml,
            last_row,
        });
        Ok(())
    }

    pub fn last_row(&self) -> Result<u32> {
        Ok(self.cur()?.last_row)
    }

    fn cur(&self) -> Result<&CurrentSheet> {
        self.cur
            .as_ref()
            .ok_or_else(|| PatchError::Malformed("no sheet selected".into()))
    }

    fn cur_mut(&mut self) -> Result<&mut CurrentSheet> {
        self.cur
            .as_mut()
            .ok_or_else(|| PatchError::Malformed("no sheet selected".into()))
    }

    pub(crate) fn sheet_xml(&self) -> Result<&[u8]> {
        Ok(self.cur()?.xml.as_slice())
    }

    pub(crate) fn sheet_xml_mut(&mut self) -> Result<&mut Vec<u8>> {
        Ok(&mut self.cur_mut()?.xml)
    }

    /// All populated cells of one row as `(col, text)`, shared strings
    /// already resolved.
    pub(crate) fn row_cells(&self, row: u32) -> Result<Vec<(u32, String)>> {
        let cells = self.collect_cells(Some(row), None, 1)?;
        Ok(cells.into_iter().map(|(_, col, text)| (col, text)).collect())
    }

    /// All populated cells of one column from `min_row` down, as `(row, text)`.
    pub(crate) fn column_values(&self, col: u32, min_row: u32) -> Result<Vec<(u32, String)>> {
        let cells = self.collect_cells(None, Some(col), min_row)?;
        Ok(cells.into_iter().map(|(row, _, text)| (row, text)).collect())
    }

    fn collect_cells(
        &self,
        want_row: Option<u32>,
        want_col: Option<u32>,
        min_row: u32,
    ) -> Result<Vec<(u32, u32, String)>> {
        let cur = self.cur()?;
        let mut reader = Reader::from_reader(cur.xml.as_slice());

        let mut out = Vec::new();
        let mut in_row: Option<u32> = None;
        let mut cell: Option<(u32, u32)> = None;
        let mut cell_type = String::new();
        let mut text_buf = String::new();
        let mut collecting = false;

        loop {
            match reader.read_event()? {
                Event::Start(ref e) => match e.name().as_ref() {
                    b"row" => {
                        in_row = match attr_u32(e, b"r") {
                            Some(r) if r >= min_row && want_row.map_or(true, |w| w == r) => Some(r),
                            _ => None,
                        };
                    }
                    b"c" if in_row.is_some() => {
                        cell = None;
                        if let Some((row, col)) = attr_string(e, b"r").and_then(|c| parse_coord(&c))
                        {
                            if want_col.map_or(true, |w| w == col) {
                                cell = Some((row, col));
                                cell_type = attr_string(e, b"t").unwrap_or_default();
                                text_buf.clear();
                            }
                        }
                    }
                    b"v" | b"t" if cell.is_some() => collecting = true,
                    _ => {}
                },
                Event::Text(ref t) if collecting => text_buf.push_str(&unescape_text(t)?),
                Event::End(ref e) => match e.name().as_ref() {
                    b"v" | b"t" => collecting = false,
                    b"c" => {
                        if let Some((row, col)) = cell.take() {
                            out.push((row, col, self.resolve_cell_text(&cell_type, &text_buf)));
                        }
                    }
                    b"row" => {
                        // once the requested row closes there is nothing left to find
                        if want_row.is_some() && in_row == want_row {
                            break;
                        }
                        in_row = None;
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(out)
    }

    fn resolve_cell_text(&self, cell_type: &str, raw: &str) -> String {
        if cell_type == "s" {
            raw.trim()
                .parse::<usize>()
                .ok()
                .and_then(|idx| self.shared_strings.get(idx).cloned())
                .unwrap_or_default()
        } else {
            raw.to_owned()
        }
    }

    /// Writes a cell, replacing any existing cell at that coordinate. New
    /// text is stored as an inline string so the shared-string table never
    /// has to be rewritten.
    pub fn set_cell(&mut self, row: u32, col: u32, value: CellValue, style: Option<u32>) -> Result<()> {
        let coord = coord(row, col);

        let mut cell_writer = Writer::new(Vec::new());
        let style_attr = style.map(|s| s.to_string());
        let mut c_elem = cell_writer
            .create_element("c")
            .with_attribute(("r", coord.as_str()));
        if let Some(s) = style_attr.as_deref() {
            c_elem = c_elem.with_attribute(("s", s));
        }
        if matches!(value, CellValue::Text(_)) {
            c_elem = c_elem.with_attribute(("t", "inlineStr"));
        }
        c_elem.write_inner_content(|w| {
            match &value {
                CellValue::Number(n) => {
                    w.create_element("v")
                        .write_text_content(BytesText::new(&n.to_string()))?;
                }
                CellValue::Text(t) => {
                    w.create_element("is").write_inner_content(|w2| {
                        w2.create_element("t").write_text_content(BytesText::new(t))?;
                        Ok(())
                    })?;
                }
            }
            Ok(())
        })?;
        let cell_xml = cell_writer.into_inner();

        self.splice_cell(row, col, &coord, cell_xml)?;

        let cur = self.cur_mut()?;
        if row > cur.last_row {
            cur.last_row = row;
        }
        Ok(())
    }

    fn splice_cell(&mut self, row: u32, col: u32, coord: &str, cell_xml: Vec<u8>) -> Result<()> {
        let cur = self.cur_mut()?;
        let row_marker = format!("<row r=\"{row}\"");

        if let Some(row_start) = find_bytes(&cur.xml, row_marker.as_bytes()) {
            let tag_end = find_bytes_from(&cur.xml, b">", row_start)
                .ok_or_else(|| PatchError::Malformed("unterminated <row> tag".into()))?;

            if cur.xml[tag_end - 1] == b'/' {
                // self-closing row: materialize it around the new cell
                let mut repl = cur.xml[row_start..tag_end - 1].to_vec();
                repl.push(b'>');
                repl.extend_from_slice(&cell_xml);
                repl.extend_from_slice(b"</row>");
                cur.xml.splice(row_start..tag_end + 1, repl);
                return Ok(());
            }

            let row_end = find_bytes_from(&cur.xml, b"</row>", row_start)
                .ok_or_else(|| PatchError::Malformed("</row> not found".into()))?
                + b"</row>".len();
            let mut row_slice = cur.xml[row_start..row_end].to_vec();

            // drop an existing cell at this coordinate
            let cell_marker = format!("<c r=\"{coord}\"");
            if let Some(cpos) = find_bytes(&row_slice, cell_marker.as_bytes()) {
                let ctag_end = find_bytes_from(&row_slice, b">", cpos)
                    .ok_or_else(|| PatchError::Malformed("unterminated <c> tag".into()))?;
                let cell_end = if row_slice[ctag_end - 1] == b'/' {
                    ctag_end + 1
                } else {
                    find_bytes_from(&row_slice, b"</c>", cpos)
                        .ok_or_else(|| PatchError::Malformed("</c> not found".into()))?
                        + b"</c>".len()
                };
                row_slice.drain(cpos..cell_end);
            }

            // keep cells ordered by column so the row stays well-formed
            let mut insert_pos = row_slice.len() - b"</row>".len();
            let mut i = 0;
            while let Some(p) = find_bytes_from(&row_slice, b"<c r=\"", i) {
                let start = p + 6;
                let Some(q) = row_slice[start..].iter().position(|&b| b == b'"') else {
                    break;
                };
                if let Some((_, existing_col)) = std::str::from_utf8(&row_slice[start..start + q])
                    .ok()
                    .and_then(parse_coord)
                {
                    if existing_col > col {
                        insert_pos = p;
                        break;
                    }
                }
                i = start + q;
            }
            row_slice.splice(insert_pos..insert_pos, cell_xml);
            cur.xml.splice(row_start..row_end, row_slice);
            return Ok(());
        }

        // Row absent: build it and insert before the first row with a larger
        // number, keeping <row> elements sorted so Excel does not flag the
        // sheet as recovered.
        let mut new_row_xml = Vec::with_capacity(cell_xml.len() + 24);
        new_row_xml.extend_from_slice(format!("<row r=\"{row}\">").as_bytes());
        new_row_xml.extend_from_slice(&cell_xml);
        new_row_xml.extend_from_slice(b"</row>");

        let mut insert_pos: Option<usize> = None;
        let mut search_idx = 0;
        while let Some(p) = find_bytes_from(&cur.xml, b"<row r=\"", search_idx) {
            let num_start = p + b"<row r=\"".len();
            let Some(q) = cur.xml[num_start..].iter().position(|&b| b == b'"') else {
                break;
            };
            if let Ok(existing) = std::str::from_utf8(&cur.xml[num_start..num_start + q])
                .unwrap_or("")
                .parse::<u32>()
            {
                if existing > row {
                    insert_pos = Some(p);
                    break;
                }
            }
            search_idx = num_start + q;
        }

        let pos = match insert_pos {
            Some(p) => p,
            None => match find_bytes(&cur.xml, b"</sheetData>") {
                Some(p) => p,
                None => {
                    // empty sheets may carry a self-closing sheetData element
                    let p = find_bytes(&cur.xml, b"<sheetData/>")
                        .ok_or_else(|| PatchError::Malformed("sheetData not found".into()))?;
                    cur.xml
                        .splice(p..p + b"<sheetData/>".len(), b"<sheetData></sheetData>".iter().copied());
                    p + b"<sheetData>".len()
                }
            },
        };
        cur.xml.splice(pos..pos, new_row_xml);
        Ok(())
    }

    /// Removes the cell at the coordinate, returning whether one existed.
    pub fn remove_cell(&mut self, row: u32, col: u32) -> Result<bool> {
        let coord = coord(row, col);
        let cur = self.cur_mut()?;
        let row_marker = format!("<row r=\"{row}\"");
        let Some(row_start) = find_bytes(&cur.xml, row_marker.as_bytes()) else {
            return Ok(false);
        };
        let row_tag_end = find_bytes_from(&cur.xml, b">", row_start)
            .ok_or_else(|| PatchError::Malformed("unterminated <row> tag".into()))?;
        if cur.xml[row_tag_end - 1] == b'/' {
            return Ok(false);
        }
        let row_end = find_bytes_from(&cur.xml, b"</row>", row_start)
            .ok_or_else(|| PatchError::Malformed("</row> not found".into()))?;

        let cell_marker = format!("<c r=\"{coord}\"");
        let Some(rel) = find_bytes(&cur.xml[row_start..row_end], cell_marker.as_bytes()) else {
            return Ok(false);
        };
        let cpos = row_start + rel;
        let ctag_end = find_bytes_from(&cur.xml, b">", cpos)
            .ok_or_else(|| PatchError::Malformed("unterminated <c> tag".into()))?;
        let cell_end = if cur.xml[ctag_end - 1] == b'/' {
            ctag_end + 1
        } else {
            find_bytes_from(&cur.xml, b"</c>", cpos)
                .ok_or_else(|| PatchError::Malformed("</c> not found".into()))?
                + b"</c>".len()
        };
        cur.xml.drain(cpos..cell_end);
        Ok(true)
    }

    /// Clears every data cell of a column from `from_row` down. Running the
    /// same report date twice must rewrite, not accumulate.
    pub fn clear_column_below(&mut self, col: u32, from_row: u32) -> Result<u32> {
        let last = self.cur()?.last_row;
        let mut cleared = 0;
        for row in from_row..=last {
            if self.remove_cell(row, col)? {
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Re-serializes the workbook. Parts this run never touched are copied
    /// raw from the source archive.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        if let Some(cur) = self.cur.take() {
            stage_part(&mut self.staged, cur.part_path, cur.xml);
        }

        let mut zin = ZipArchive::new(Cursor::new(self.src_bytes.as_slice()))?;
        let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
        let opt: FileOptions<'_, ()> = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(1));

        for i in 0..zin.len() {
            let file = zin.by_index_raw(i)?;
            let name = file.name().to_owned();

            if name == "xl/styles.xml" {
                zout.start_file(name, opt)?;
                zout.write_all(&self.styles_xml)?;
            } else if let Some((_, content)) = self.staged.iter().find(|(p, _)| *p == name) {
                zout.start_file(name, opt)?;
                zout.write_all(content)?;
            } else {
                zout.raw_copy_file(file)?;
            }
        }

        let cursor = zout.finish()?;
        Ok(cursor.into_inner())
    }
}

fn stage_part(staged: &mut Vec<(String, Vec<u8>)>, part_path: String, xml: Vec<u8>) {
    if let Some(entry) = staged.iter_mut().find(|(p, _)| *p == part_path) {
        entry.1 = xml;
    } else {
        staged.push((part_path, xml));
    }
}

fn read_required(zip: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Vec<u8>> {
    match zip.by_name(name) {
        Ok(mut part) => {
            let mut buf = Vec::with_capacity(part.size() as usize);
            part.read_to_end(&mut buf)?;
            Ok(buf)
        }
        Err(ZipError::FileNotFound) => Err(PatchError::Malformed(format!(
            "{name} not found in workbook container"
        ))),
        Err(e) => Err(e.into()),
    }
}

fn read_optional(zip: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Option<Vec<u8>>> {
    match zip.by_name(name) {
        Ok(mut part) => {
            let mut buf = Vec::with_capacity(part.size() as usize);
            part.read_to_end(&mut buf)?;
            Ok(Some(buf))
        }
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolves `(sheet name, part path)` pairs from workbook.xml and its rels.
fn parse_sheet_entries(workbook_xml: &[u8], rels_xml: &[u8]) -> Result<Vec<(String, String)>> {
    let mut targets: HashMap<String, String> = HashMap::new();
    let mut reader = Reader::from_reader(rels_xml);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event()? {
            Event::Empty(ref e) | Event::Start(ref e)
                if e.name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) =
                    (attr_string(e, b"Id"), attr_string(e, b"Target"))
                {
                    targets.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut sheets = Vec::new();
    let mut reader = Reader::from_reader(workbook_xml);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event()? {
            Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"sheet" => {
                let name = attr_string(e, b"name");
                let rid = attr_string(e, b"r:id");
                if let (Some(name), Some(rid)) = (name, rid) {
                    let target = targets.get(&rid).ok_or_else(|| {
                        PatchError::Malformed(format!("sheet '{name}' has no relationship target"))
                    })?;
                    sheets.push((name, normalize_part_path(target)));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if sheets.is_empty() {
        return Err(PatchError::Malformed("workbook declares no sheets".into()));
    }
    Ok(sheets)
}

fn normalize_part_path(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_owned(),
        None => format!("xl/{target}"),
    }
}

fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut out = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event()? {
            Event::Start(ref e) => match e.name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" if current.is_some() => in_text = true,
                _ => {}
            },
            Event::Text(ref t) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&unescape_text(t)?);
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"t" => in_text = false,
                b"si" => {
                    if let Some(s) = current.take() {
                        out.push(s);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn scan_last_row(sheet_xml: &[u8]) -> Result<u32> {
    let mut reader = Reader::from_reader(sheet_xml);
    reader.config_mut().trim_text(true);
    let mut last_row = 0;
    loop {
        match reader.read_event()? {
            Event::Empty(ref e) | Event::Start(ref e) if e.name().as_ref() == b"row" => {
                if let Some(r) = attr_u32(e, b"r") {
                    last_row = last_row.max(r);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(last_row)
}

pub(crate) fn attr_string(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .with_checks(false)
        .flatten()
        .find_map(|a| (a.key.as_ref() == key).then(|| String::from_utf8_lossy(&a.value).into_owned()))
}

pub(crate) fn attr_u32(e: &BytesStart, key: &[u8]) -> Option<u32> {
    attr_string(e, key)?.parse().ok()
}

pub(crate) fn find_bytes(hay: &[u8], needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(hay, needle)
}

pub(crate) fn find_bytes_from(hay: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    memchr::memmem::find(&hay[start..], needle).map(|p| p + start)
}
