//! styles.xml surgery: reading a cell's format record and cloning it onto
//! newly written cells, with the number format forced to currency.
//!
//! The style sheet is patched the same way sheet XML is: targeted scans with
//! quick-xml, then byte-range splices. Existing `<xf>` records are reused
//! when an identical one is already registered.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::column::HEADER_ROW;
use crate::editor::{attr_string, attr_u32, find_bytes, find_bytes_from, CellValue, WorkbookEditor};
use crate::{PatchError, Result};

/// 2-decimal currency mask applied to every written net amount.
pub const CURRENCY_FMT: &str = "\"$\"#,##0.00";

/// Column whose cells carry the portfolio's canonical financial formatting
/// (column G in the standard weekly template). Used as the style reference
/// for new data cells when present.
pub const FINANCIAL_STYLE_COL: u32 = 6;

/// Custom number formats live above the OOXML built-in range.
const FIRST_CUSTOM_NUM_FMT: u32 = 163;

/// Font/fill/border/alignment of one `<xf>` record, minus its number format.
#[derive(Debug, Clone, Default)]
pub(crate) struct StyleParts {
    pub font: Option<u32>,
    pub fill: Option<u32>,
    pub border: Option<u32>,
    pub align: Option<AlignSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AlignSpec {
    pub horiz: Option<String>,
    pub vert: Option<String>,
    pub wrap: bool,
}

impl WorkbookEditor {
    /// Copies the left neighbor's header style onto a freshly created header
    /// cell. Only called when a new column was allocated, never on replace.
    pub fn propagate_header_style(&mut self, new_col: u32) -> Result<()> {
        if new_col == 0 {
            return Ok(());
        }
        if let Some(style_id) = self.cell_style_id(HEADER_ROW, new_col - 1)? {
            self.apply_style_to_cell(HEADER_ROW, new_col, style_id)?;
        }
        Ok(())
    }

    /// Style id for a new data cell: the reference cell's font, fill, border
    /// and alignment with the number format forced to [`CURRENCY_FMT`].
    ///
    /// Results are cached per source xf id; a funder sheet with thousands of
    /// rows registers at most a handful of new xf records.
    pub(crate) fn currency_style_from(&mut self, ref_style: Option<u32>) -> Result<u32> {
        let key = ref_style.unwrap_or(u32::MAX);
        if let Some(&sid) = self.style_cache.get(&key) {
            return Ok(sid);
        }
        let parts = match ref_style {
            Some(sid) => self.read_xf(sid)?,
            None => StyleParts::default(),
        };
        let fmt_id = self.ensure_num_fmt(CURRENCY_FMT)?;
        let sid = self.ensure_xf(fmt_id, &parts)?;
        self.style_cache.insert(key, sid);
        Ok(sid)
    }

    /// Reads the `s=` attribute of a cell, bounded to its open tag.
    pub(crate) fn cell_style_id(&self, row: u32, col: u32) -> Result<Option<u32>> {
        let coord = coord(row, col);
        let tag = format!("<c r=\"{coord}\"");
        let xml = self.sheet_xml()?;
        let Some(cpos) = find_bytes(xml, tag.as_bytes()) else {
            return Ok(None);
        };
        let ctag_end = find_bytes_from(xml, b">", cpos)
            .ok_or_else(|| PatchError::Malformed("unterminated <c> tag".into()))?;
        if let Some(spos) = find_bytes_from(xml, b" s=\"", cpos) {
            if spos < ctag_end {
                let val_start = spos + b" s=\"".len();
                let val_end = find_bytes_from(xml, b"\"", val_start)
                    .ok_or_else(|| PatchError::Malformed("unterminated s attribute".into()))?;
                let id = std::str::from_utf8(&xml[val_start..val_end])
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok());
                return Ok(id);
            }
        }
        Ok(None)
    }

    /// Sets the `s=` attribute of a cell, creating an empty styled cell if
    /// the coordinate is vacant.
    pub(crate) fn apply_style_to_cell(&mut self, row: u32, col: u32, style_id: u32) -> Result<()> {
        let coord = coord(row, col);
        let tag = format!("<c r=\"{coord}\"");
        let xml = self.sheet_xml_mut()?;
        let Some(cpos) = find_bytes(xml, tag.as_bytes()) else {
            return self.set_cell(row, col, CellValue::text(""), Some(style_id));
        };
        let ctag_end = find_bytes_from(xml, b">", cpos)
            .ok_or_else(|| PatchError::Malformed("unterminated <c> tag".into()))?;
        if let Some(spos) = find_bytes_from(xml, b" s=\"", cpos) {
            if spos < ctag_end {
                let val_start = spos + b" s=\"".len();
                let val_end = find_bytes_from(xml, b"\"", val_start)
                    .ok_or_else(|| PatchError::Malformed("unterminated s attribute".into()))?;
                xml.splice(val_start..val_end, style_id.to_string().bytes());
                return Ok(());
            }
        }
        let insert = if xml[ctag_end - 1] == b'/' {
            ctag_end - 1
        } else {
            ctag_end
        };
        xml.splice(insert..insert, format!(" s=\"{style_id}\"").bytes());
        Ok(())
    }

    /// Captures the components of the `style_id`-th `<xf>` in `cellXfs`.
    fn read_xf(&self, style_id: u32) -> Result<StyleParts> {
        let mut reader = Reader::from_reader(self.styles_xml.as_slice());
        reader.config_mut().trim_text(true);

        let mut in_xfs = false;
        let mut idx = 0u32;
        loop {
            let ev = reader.read_event()?;
            match ev {
                Event::Start(ref e) if e.name().as_ref() == b"cellXfs" => in_xfs = true,
                Event::End(ref e) if e.name().as_ref() == b"cellXfs" => break,
                Event::Start(ref e) | Event::Empty(ref e)
                    if in_xfs && e.name().as_ref() == b"xf" =>
                {
                    if idx == style_id {
                        let mut parts = StyleParts {
                            font: attr_u32(e, b"fontId"),
                            fill: attr_u32(e, b"fillId"),
                            border: attr_u32(e, b"borderId"),
                            align: None,
                        };
                        if matches!(ev, Event::Start(_)) {
                            let mut depth = 1;
                            while depth > 0 {
                                match reader.read_event()? {
                                    Event::Start(ref inner) => {
                                        if inner.name().as_ref() == b"alignment" {
                                            parts.align = Some(parse_align(inner));
                                        }
                                        depth += 1;
                                    }
                                    Event::Empty(ref inner)
                                        if inner.name().as_ref() == b"alignment" =>
                                    {
                                        parts.align = Some(parse_align(inner));
                                    }
                                    Event::End(_) => depth -= 1,
                                    Event::Eof => break,
                                    _ => {}
                                }
                            }
                        }
                        return Ok(parts);
                    }
                    idx += 1;
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(StyleParts::default())
    }

    /// Returns the id of a `numFmt` with this code, registering one above
    /// the built-in range if absent.
    pub(crate) fn ensure_num_fmt(&mut self, code: &str) -> Result<u32> {
        let mut reader = Reader::from_reader(self.styles_xml.as_slice());
        reader.config_mut().trim_text(true);

        let mut found_id = None;
        let mut max_custom_id = FIRST_CUSTOM_NUM_FMT;
        loop {
            match reader.read_event()? {
                Event::Start(ref e) | Event::Empty(ref e) if e.name().as_ref() == b"numFmt" => {
                    let id = attr_u32(e, b"numFmtId");
                    let fmt_code = e
                        .attributes()
                        .with_checks(false)
                        .flatten()
                        .find(|a| a.key.as_ref() == b"formatCode")
                        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
                    if let (Some(id), Some(fmt_code)) = (id, fmt_code) {
                        if fmt_code == code {
                            found_id = Some(id);
                        }
                        max_custom_id = max_custom_id.max(id);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if let Some(id) = found_id {
            return Ok(id);
        }

        let new_id = max_custom_id + 1;
        let escaped = quick_xml::escape::escape(code);
        let tag = format!("<numFmt numFmtId=\"{new_id}\" formatCode=\"{escaped}\"/>");

        if let Some(end) = find_bytes(&self.styles_xml, b"</numFmts>") {
            self.styles_xml.splice(end..end, tag.bytes());
            bump_count(&mut self.styles_xml, b"<numFmts", b"count=\"")?;
        } else {
            // schema order: numFmts precedes fonts
            let insert = find_bytes(&self.styles_xml, b"<fonts")
                .ok_or_else(|| PatchError::Malformed("styles.xml has no <fonts> block".into()))?;
            let block = format!("<numFmts count=\"1\">{tag}</numFmts>");
            self.styles_xml.splice(insert..insert, block.bytes());
        }
        Ok(new_id)
    }

    /// Finds an `<xf>` with these exact components, or appends one.
    fn ensure_xf(&mut self, fmt_id: u32, parts: &StyleParts) -> Result<u32> {
        if parts.align.is_none() {
            if let Some(id) = self.find_matching_xf(fmt_id, parts)? {
                return Ok(id);
            }
        }
        self.add_new_xf(fmt_id, parts)
    }

    fn find_matching_xf(&self, fmt_id: u32, parts: &StyleParts) -> Result<Option<u32>> {
        let mut reader = Reader::from_reader(self.styles_xml.as_slice());
        reader.config_mut().trim_text(true);

        let mut in_xfs = false;
        let mut idx = 0u32;
        loop {
            let ev = reader.read_event()?;
            match ev {
                Event::Start(ref e) if e.name().as_ref() == b"cellXfs" => in_xfs = true,
                Event::End(ref e) if e.name().as_ref() == b"cellXfs" => break,
                Event::Start(ref e) | Event::Empty(ref e)
                    if in_xfs && e.name().as_ref() == b"xf" =>
                {
                    // xf records carrying an alignment child are never reused
                    let mut has_alignment = false;
                    if matches!(ev, Event::Start(_)) {
                        let mut depth = 1;
                        while depth > 0 {
                            match reader.read_event()? {
                                Event::Start(ref inner) => {
                                    if inner.name().as_ref() == b"alignment" {
                                        has_alignment = true;
                                    }
                                    depth += 1;
                                }
                                Event::Empty(ref inner) => {
                                    if inner.name().as_ref() == b"alignment" {
                                        has_alignment = true;
                                    }
                                }
                                Event::End(_) => depth -= 1,
                                Event::Eof => break,
                                _ => {}
                            }
                        }
                    }
                    if has_alignment {
                        idx += 1;
                        continue;
                    }

                    let num_ok = attr_u32(e, b"numFmtId").unwrap_or(0) == fmt_id;
                    let font_ok = parts.font.map_or(true, |v| attr_u32(e, b"fontId") == Some(v));
                    let fill_ok = parts.fill.map_or(true, |v| attr_u32(e, b"fillId") == Some(v));
                    let border_ok = parts
                        .border
                        .map_or(true, |v| attr_u32(e, b"borderId") == Some(v));
                    if num_ok && font_ok && fill_ok && border_ok {
                        return Ok(Some(idx));
                    }
                    idx += 1;
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(None)
    }

    fn add_new_xf(&mut self, fmt_id: u32, parts: &StyleParts) -> Result<u32> {
        let mut xf = String::from("<xf xfId=\"0\" ");
        if let Some(font) = parts.font {
            xf.push_str(&format!("fontId=\"{font}\" applyFont=\"1\" "));
        }
        if let Some(fill) = parts.fill {
            xf.push_str(&format!("fillId=\"{fill}\" applyFill=\"1\" "));
        }
        if let Some(border) = parts.border {
            xf.push_str(&format!("borderId=\"{border}\" applyBorder=\"1\" "));
        }
        xf.push_str(&format!("numFmtId=\"{fmt_id}\""));
        if fmt_id != 0 {
            xf.push_str(" applyNumberFormat=\"1\"");
        }
        match &parts.align {
            Some(al) if al.horiz.is_some() || al.vert.is_some() || al.wrap => {
                xf.push_str(" applyAlignment=\"1\"><alignment");
                if let Some(h) = &al.horiz {
                    xf.push_str(&format!(" horizontal=\"{h}\""));
                }
                if let Some(v) = &al.vert {
                    xf.push_str(&format!(" vertical=\"{v}\""));
                }
                if al.wrap {
                    xf.push_str(" wrapText=\"1\"");
                }
                xf.push_str("/></xf>");
            }
            _ => xf.push_str("/>"),
        }

        let pos = find_bytes(&self.styles_xml, b"</cellXfs>")
            .ok_or_else(|| PatchError::Malformed("styles.xml has no </cellXfs>".into()))?;
        self.styles_xml.splice(pos..pos, xf.bytes());
        bump_count(&mut self.styles_xml, b"<cellXfs", b"count=\"")?;

        // the appended record's index is the new count minus one
        let mut reader = Reader::from_reader(self.styles_xml.as_slice());
        reader.config_mut().trim_text(true);
        let mut in_xfs = false;
        let mut count = 0u32;
        loop {
            match reader.read_event()? {
                Event::Start(ref e) if e.name().as_ref() == b"cellXfs" => in_xfs = true,
                Event::End(ref e) if e.name().as_ref() == b"cellXfs" => break,
                Event::Start(ref e) | Event::Empty(ref e)
                    if in_xfs && e.name().as_ref() == b"xf" =>
                {
                    count += 1;
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(count - 1)
    }
}

fn parse_align(e: &BytesStart) -> AlignSpec {
    AlignSpec {
        horiz: attr_string(e, b"horizontal"),
        vert: attr_string(e, b"vertical"),
        wrap: attr_string(e, b"wrapText").map_or(false, |v| v == "1" || v == "true"),
    }
}

/* ---------------- coordinate helpers ---------------- */

/// 0-based column index to Excel letters (0 -> "A", 26 -> "AA").
pub fn col_letter(mut n: u32) -> String {
    let mut s = String::new();
    loop {
        s.insert(0, (b'A' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    s
}

/// Excel letters to 0-based column index.
pub fn col_index(s: &str) -> usize {
    s.bytes().fold(0, |acc, b| {
        acc * 26 + (b.to_ascii_uppercase() - b'A' + 1) as usize
    }) - 1
}

/// `(row, col)` to an A1-style coordinate.
pub fn coord(row: u32, col: u32) -> String {
    format!("{}{row}", col_letter(col))
}

fn bump_count(xml: &mut Vec<u8>, tag: &[u8], attr: &[u8]) -> Result<()> {
    if let Some(pos) = find_bytes(xml, tag) {
        if let Some(a) = find_bytes_from(xml, attr, pos) {
            let start = a + attr.len();
            let end = find_bytes_from(xml, b"\"", start)
                .ok_or_else(|| PatchError::Malformed("unterminated count attribute".into()))?;
            let num: u32 = std::str::from_utf8(&xml[start..end])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| PatchError::Malformed("count attribute is not a number".into()))?;
            xml.splice(start..end, (num + 1).to_string().bytes());
            return Ok(());
        }
    }
    Err(PatchError::Malformed("count attribute not found".into()))
}
