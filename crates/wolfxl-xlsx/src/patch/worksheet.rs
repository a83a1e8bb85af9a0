//! Streaming worksheet patcher.
//!
//! The original part is re-emitted event for event. Rows and cells named in the patch are
//! rewritten in place; new ones are inserted in coordinate order. `<dimension>`,
//! `<mergeCells>`, and the first view's `<pane>` are replaced when the patch carries them.

use std::collections::BTreeMap;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use wolfxl_model::{CellRef, Range};

use crate::xml::{
    attr_value, element_prefix, escape_text, format_number, needs_space_preserve,
    prefixed,
};
use crate::XlsxError;

/// Cached result written next to a formula.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CachedValue {
    Number(f64),
    Bool(bool),
    Error(String),
    Str(String),
}

/// Children (and `t`) of a rewritten cell.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CellBody {
    /// Style-only edit: keep the existing children.
    Keep,
    /// No content. The cell disappears unless it keeps a non-default style.
    Clear,
    Number(f64),
    Bool(bool),
    Error(String),
    Shared(u32),
    Inline(String),
    /// Plain string stored in `<v>` with `t="str"`.
    Str(String),
    Formula {
        text: String,
        cached: Option<CachedValue>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CellWrite {
    /// Final `cellXfs` index.
    pub style: u32,
    pub body: CellBody,
}

impl CellWrite {
    fn is_absent(&self) -> bool {
        self.style == 0 && matches!(self.body, CellBody::Clear | CellBody::Keep)
    }
}

/// Everything to change in one worksheet part.
#[derive(Debug, Default)]
pub(crate) struct WorksheetPatch {
    /// Cell writes by row, each row sorted by column.
    pub rows: BTreeMap<u32, Vec<(u32, CellWrite)>>,
    /// New `<dimension ref>`. Only applied when the part has a `<dimension>`.
    pub dimension: Option<Range>,
    pub merges: Option<Vec<Range>>,
    pub freeze_panes: Option<Option<CellRef>>,
}

impl WorksheetPatch {
    pub fn push(&mut self, cell: CellRef, write: CellWrite) {
        let row = self.rows.entry(cell.row).or_default();
        match row.binary_search_by_key(&cell.col, |(c, _)| *c) {
            Ok(idx) => row[idx].1 = write,
            Err(idx) => row.insert(idx, (cell.col, write)),
        }
    }
}

/// Elements that come after `<mergeCells>` in `CT_Worksheet`.
const AFTER_MERGE_CELLS: &[&[u8]] = &[
    b"phoneticPr",
    b"conditionalFormatting",
    b"dataValidations",
    b"hyperlinks",
    b"printOptions",
    b"pageMargins",
    b"pageSetup",
    b"headerFooter",
    b"rowBreaks",
    b"colBreaks",
    b"customProperties",
    b"cellWatches",
    b"ignoredErrors",
    b"smartTags",
    b"drawing",
    b"legacyDrawing",
    b"legacyDrawingHF",
    b"drawingHF",
    b"picture",
    b"oleObjects",
    b"controls",
    b"webPublishItems",
    b"tableParts",
    b"extLst",
];

/// Elements that may precede `<sheetViews>`.
const BEFORE_SHEET_VIEWS: &[&[u8]] = &[b"sheetPr", b"dimension"];

/// Element names carrying the part's namespace prefix.
struct Tags {
    prefix: Option<String>,
}

impl Tags {
    fn name(&self, local: &str) -> String {
        prefixed(self.prefix.as_deref(), local)
    }
}

pub(crate) fn patch_worksheet(original: &[u8], patch: &WorksheetPatch) -> Result<Vec<u8>, XlsxError> {
    let mut reader = Reader::from_reader(original);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(
        original.len() + patch.rows.values().map(Vec::len).sum::<usize>() * 64,
    ));

    let mut tags = Tags { prefix: None };
    let mut depth = 0usize;
    let mut saw_sheet_data = false;
    let mut views_done = patch.freeze_panes.is_none();
    let mut merges_done = patch.merges.is_none();

    loop {
        let event = reader.read_event()?;
        let top_level = depth == 1;
        match event {
            Event::Eof => break,
            Event::Start(ref e) if depth == 0 && e.local_name().as_ref() == b"worksheet" => {
                tags.prefix = element_prefix(e);
                depth += 1;
                writer.write_event(event)?;
            }
            Event::Start(ref e) | Event::Empty(ref e) if top_level => {
                let local = e.local_name();
                let local = local.as_ref();
                let is_start = matches!(event, Event::Start(_));

                if !views_done && local != b"sheetViews" && !BEFORE_SHEET_VIEWS.iter().any(|n| *n == local) {
                    write_sheet_views(&mut writer, &tags, patch.freeze_panes.flatten());
                    views_done = true;
                }
                if !merges_done && local != b"mergeCells" && AFTER_MERGE_CELLS.iter().any(|n| *n == local) {
                    write_merge_cells(&mut writer, &tags, patch.merges.as_deref().unwrap_or_default());
                    merges_done = true;
                }

                match local {
                    b"dimension" if patch.dimension.is_some() => {
                        let dim = patch.dimension.map(|d| d.to_string()).unwrap_or_default();
                        let start = with_attr(e, b"ref", Some(&dim))?;
                        write_start_or_empty(&mut writer, start, is_start)?;
                    }
                    b"sheetViews" if !views_done => {
                        if is_start {
                            writer.write_event(Event::Start(e.borrow()))?;
                            patch_sheet_views(&mut reader, &mut writer, &tags, patch.freeze_panes.flatten())?;
                        } else {
                            write_sheet_views(&mut writer, &tags, patch.freeze_panes.flatten());
                        }
                        views_done = true;
                        continue;
                    }
                    b"sheetData" => {
                        saw_sheet_data = true;
                        if is_start {
                            writer.write_event(Event::Start(e.borrow()))?;
                            patch_sheet_data(&mut reader, &mut writer, &tags, &patch.rows)?;
                        } else if patch.rows.is_empty() {
                            writer.write_event(Event::Empty(e.borrow()))?;
                        } else {
                            // `<sheetData/>` becomes `<sheetData>...</sheetData>`.
                            writer.write_event(Event::Start(e.borrow()))?;
                            for (row, cells) in &patch.rows {
                                write_new_row(&mut writer, &tags, *row, cells);
                            }
                            writer.write_event(Event::End(BytesEnd::new(tags.name("sheetData"))))?;
                        }
                        continue;
                    }
                    b"mergeCells" if !merges_done => {
                        if is_start {
                            reader.read_to_end(e.name())?;
                        }
                        write_merge_cells(&mut writer, &tags, patch.merges.as_deref().unwrap_or_default());
                        merges_done = true;
                        continue;
                    }
                    _ => writer.write_event(event.borrow())?,
                }
                if is_start {
                    depth += 1;
                }
            }
            Event::End(ref e) if depth == 1 && e.local_name().as_ref() == b"worksheet" => {
                if !views_done {
                    write_sheet_views(&mut writer, &tags, patch.freeze_panes.flatten());
                }
                if !saw_sheet_data && !patch.rows.is_empty() {
                    writer.write_event(Event::Start(BytesStart::new(tags.name("sheetData"))))?;
                    for (row, cells) in &patch.rows {
                        write_new_row(&mut writer, &tags, *row, cells);
                    }
                    writer.write_event(Event::End(BytesEnd::new(tags.name("sheetData"))))?;
                }
                if !merges_done {
                    write_merge_cells(&mut writer, &tags, patch.merges.as_deref().unwrap_or_default());
                }
                depth -= 1;
                writer.write_event(event)?;
            }
            Event::Start(_) => {
                depth += 1;
                writer.write_event(event)?;
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                writer.write_event(event)?;
            }
            other => writer.write_event(other)?,
        }
    }

    Ok(writer.into_inner())
}

fn write_start_or_empty(
    writer: &mut Writer<Vec<u8>>,
    start: BytesStart<'static>,
    is_start: bool,
) -> Result<(), XlsxError> {
    if is_start {
        writer.write_event(Event::Start(start))?;
    } else {
        writer.write_event(Event::Empty(start))?;
    }
    Ok(())
}

/// Copy of `e` with attribute `key` replaced (or removed when `value` is `None`). A new
/// attribute is appended.
fn with_attr(e: &BytesStart<'_>, key: &[u8], value: Option<&str>) -> Result<BytesStart<'static>, XlsxError> {
    let mut out = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    let mut replaced = false;
    for attr in e.attributes().with_checks(false) {
        let attr = attr?;
        if attr.key.as_ref() == key {
            replaced = true;
            if let Some(value) = value {
                out.push_attribute((attr.key.as_ref(), value.as_bytes()));
            }
        } else {
            out.push_attribute(attr);
        }
    }
    if !replaced {
        if let Some(value) = value {
            out.push_attribute((key, value.as_bytes()));
        }
    }
    Ok(out)
}

fn patch_sheet_data(
    reader: &mut Reader<&[u8]>,
    writer: &mut Writer<Vec<u8>>,
    tags: &Tags,
    rows: &BTreeMap<u32, Vec<(u32, CellWrite)>>,
) -> Result<(), XlsxError> {
    let mut pending = rows.iter().peekable();
    let mut last_row = 0u32;

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"row" => {
                let is_start = matches!(event, Event::Start(_));
                let row_num = match attr_value(e, b"r")?.and_then(|r| r.trim().parse::<u32>().ok()) {
                    Some(r) => r,
                    None => {
                        log::warn!("row without r attribute; numbering it {}", last_row + 1);
                        last_row + 1
                    }
                };
                last_row = row_num;

                while let Some((row, cells)) = pending.next_if(|(row, _)| **row < row_num) {
                    write_new_row(writer, tags, *row, cells);
                }

                match pending.next_if(|(row, _)| **row == row_num) {
                    Some((_, cells)) if is_start => {
                        writer.write_event(Event::Start(row_start(e, cells)?))?;
                        patch_row(reader, writer, tags, row_num, cells)?;
                    }
                    Some((_, cells)) => {
                        // `<row/>` becomes `<row>...</row>`.
                        writer.write_event(Event::Start(row_start(e, cells)?))?;
                        for (col, write) in cells {
                            write_cell(writer, tags, CellRef { row: row_num, col: *col }, write);
                        }
                        writer.write_event(Event::End(BytesEnd::new(
                            String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                        )))?;
                    }
                    None if is_start => {
                        // Untouched row: copy it through verbatim.
                        writer.write_event(Event::Start(e.borrow()))?;
                        copy_until_end(reader, writer)?;
                    }
                    None => writer.write_event(event)?,
                }
            }
            Event::End(ref e) if e.local_name().as_ref() == b"sheetData" => {
                for (row, cells) in pending.by_ref() {
                    write_new_row(writer, tags, *row, cells);
                }
                writer.write_event(event)?;
                break;
            }
            Event::Eof => return Err(XlsxError::malformed("worksheet", "unexpected eof in <sheetData>")),
            other => writer.write_event(other)?,
        }
    }
    Ok(())
}

/// Start tag of an existing row, with `spans` widened to cover the cells being written.
fn row_start(e: &BytesStart<'_>, cells: &[(u32, CellWrite)]) -> Result<BytesStart<'static>, XlsxError> {
    let spans = attr_value(e, b"spans")?;
    match spans.as_deref().and_then(|spans| widened_spans(spans, cells)) {
        Some(widened) => with_attr(e, b"spans", Some(&widened)),
        None => Ok(e.clone().into_owned()),
    }
}

/// `spans` covering both `spans` and every written column, or `None` when it already does.
/// A hint that does not parse is left for the consumer to ignore.
fn widened_spans(spans: &str, cells: &[(u32, CellWrite)]) -> Option<String> {
    let mut bounds: Option<(u32, u32)> = None;
    for token in spans.split_whitespace() {
        let (lo, hi) = token.split_once(':')?;
        let (lo, hi) = (lo.parse::<u32>().ok()?, hi.parse::<u32>().ok()?);
        bounds = Some(match bounds {
            Some((min, max)) => (min.min(lo), max.max(hi)),
            None => (lo, hi),
        });
    }
    let (min, max) = bounds?;
    let written = cells.iter().filter(|(_, w)| !w.is_absent()).map(|(col, _)| *col);
    let (lo, hi) = written.fold((min, max), |(lo, hi), col| (lo.min(col), hi.max(col)));
    ((lo, hi) != (min, max)).then(|| format!("{lo}:{hi}"))
}

/// Copy events through the end tag closing the element just opened.
fn copy_until_end(reader: &mut Reader<&[u8]>, writer: &mut Writer<Vec<u8>>) -> Result<(), XlsxError> {
    let mut depth = 1usize;
    loop {
        let event = reader.read_event()?;
        match event {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    writer.write_event(event)?;
                    return Ok(());
                }
            }
            Event::Eof => return Err(XlsxError::malformed("worksheet", "unexpected eof")),
            _ => {}
        }
        writer.write_event(event)?;
    }
}

/// Skip the children of the element just opened, through its end tag.
fn skip_until_end(reader: &mut Reader<&[u8]>) -> Result<(), XlsxError> {
    let mut depth = 1usize;
    loop {
        match reader.read_event()? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => return Err(XlsxError::malformed("worksheet", "unexpected eof")),
            _ => {}
        }
    }
}

fn patch_row(
    reader: &mut Reader<&[u8]>,
    writer: &mut Writer<Vec<u8>>,
    tags: &Tags,
    row_num: u32,
    cells: &[(u32, CellWrite)],
) -> Result<(), XlsxError> {
    let mut pending = cells.iter().peekable();
    let mut last_col = 0u32;

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"c" => {
                let is_start = matches!(event, Event::Start(_));
                let col = match attr_value(e, b"r")?.and_then(|r| CellRef::from_a1(&r).ok()) {
                    Some(cell) => cell.col,
                    None => {
                        log::warn!("cell without r attribute in row {row_num}");
                        last_col + 1
                    }
                };
                last_col = col;

                while let Some((c, write)) = pending.next_if(|(c, _)| *c < col) {
                    write_cell(writer, tags, CellRef { row: row_num, col: *c }, write);
                }

                let Some((_, write)) = pending.next_if(|(c, _)| *c == col) else {
                    writer.write_event(event.borrow())?;
                    if is_start {
                        copy_until_end(reader, writer)?;
                    }
                    continue;
                };

                let cell = CellRef { row: row_num, col };
                if write.body == CellBody::Keep {
                    // Style-only edit: swap `s`, keep the children.
                    let style = (write.style != 0).then(|| write.style.to_string());
                    let start = with_attr(e, b"s", style.as_deref())?;
                    write_start_or_empty(writer, start, is_start)?;
                    if is_start {
                        copy_until_end(reader, writer)?;
                    }
                } else {
                    if is_start {
                        skip_until_end(reader)?;
                    }
                    write_cell(writer, tags, cell, write);
                }
            }
            Event::End(ref e) if e.local_name().as_ref() == b"row" => {
                for (col, write) in pending.by_ref() {
                    write_cell(writer, tags, CellRef { row: row_num, col: *col }, write);
                }
                writer.write_event(event)?;
                break;
            }
            Event::Eof => return Err(XlsxError::malformed("worksheet", "unexpected eof in <row>")),
            other => writer.write_event(other)?,
        }
    }
    Ok(())
}

fn write_new_row(writer: &mut Writer<Vec<u8>>, tags: &Tags, row_num: u32, cells: &[(u32, CellWrite)]) {
    if cells.iter().all(|(_, w)| w.is_absent()) {
        return;
    }
    let row_tag = tags.name("row");
    let out = writer.get_mut();
    out.extend_from_slice(format!(r#"<{row_tag} r="{row_num}">"#).as_bytes());
    for (col, write) in cells {
        write_cell(writer, tags, CellRef { row: row_num, col: *col }, write);
    }
    writer.get_mut().extend_from_slice(format!("</{row_tag}>").as_bytes());
}

fn write_cell(writer: &mut Writer<Vec<u8>>, tags: &Tags, cell: CellRef, write: &CellWrite) {
    if write.is_absent() {
        return;
    }
    let c = tags.name("c");
    let v = tags.name("v");
    let mut out = format!(r#"<{c} r="{}""#, cell.to_a1());
    if write.style != 0 {
        out.push_str(&format!(r#" s="{}""#, write.style));
    }

    let mut ty: Option<&str> = None;
    let mut children = String::new();
    let value = |text: &str| format!("<{v}>{}</{v}>", escape_text(text));

    match &write.body {
        CellBody::Keep | CellBody::Clear => {}
        CellBody::Number(n) => children.push_str(&value(&format_number(*n))),
        CellBody::Bool(b) => {
            ty = Some("b");
            children.push_str(&value(if *b { "1" } else { "0" }));
        }
        CellBody::Error(e) => {
            ty = Some("e");
            children.push_str(&value(e));
        }
        CellBody::Shared(idx) => {
            ty = Some("s");
            children.push_str(&value(&idx.to_string()));
        }
        CellBody::Str(s) => {
            ty = Some("str");
            children.push_str(&value(s));
        }
        CellBody::Inline(s) => {
            ty = Some("inlineStr");
            let (is, t) = (tags.name("is"), tags.name("t"));
            let space = if needs_space_preserve(s) { r#" xml:space="preserve""# } else { "" };
            children.push_str(&format!("<{is}><{t}{space}>{}</{t}></{is}>", escape_text(s)));
        }
        CellBody::Formula { text, cached } => {
            let f = tags.name("f");
            children.push_str(&format!("<{f}>{}</{f}>", escape_text(text)));
            match cached {
                Some(CachedValue::Number(n)) => children.push_str(&value(&format_number(*n))),
                Some(CachedValue::Bool(b)) => {
                    ty = Some("b");
                    children.push_str(&value(if *b { "1" } else { "0" }));
                }
                Some(CachedValue::Error(e)) => {
                    ty = Some("e");
                    children.push_str(&value(e));
                }
                Some(CachedValue::Str(s)) => {
                    ty = Some("str");
                    children.push_str(&value(s));
                }
                None => {}
            }
        }
    }

    if let Some(t) = ty {
        out.push_str(&format!(r#" t="{t}""#));
    }
    if children.is_empty() {
        out.push_str("/>");
    } else {
        out.push('>');
        out.push_str(&children);
        out.push_str(&format!("</{c}>"));
    }
    writer.get_mut().extend_from_slice(out.as_bytes());
}

fn write_merge_cells(writer: &mut Writer<Vec<u8>>, tags: &Tags, merges: &[Range]) {
    if merges.is_empty() {
        return;
    }
    let (block, item) = (tags.name("mergeCells"), tags.name("mergeCell"));
    let mut out = format!(r#"<{block} count="{}">"#, merges.len());
    for range in merges {
        out.push_str(&format!(r#"<{item} ref="{range}"/>"#));
    }
    out.push_str(&format!("</{block}>"));
    writer.get_mut().extend_from_slice(out.as_bytes());
}

/// `<pane>` for panes frozen above and left of `top_left`. `None` when nothing is frozen.
fn pane_xml(tags: &Tags, top_left: Option<CellRef>) -> Option<String> {
    let top_left = top_left?;
    let (x, y) = (top_left.col - 1, top_left.row - 1);
    let active = match (x > 0, y > 0) {
        (true, true) => "bottomRight",
        (false, true) => "bottomLeft",
        (true, false) => "topRight",
        (false, false) => return None,
    };
    let mut out = format!("<{}", tags.name("pane"));
    if x > 0 {
        out.push_str(&format!(r#" xSplit="{x}""#));
    }
    if y > 0 {
        out.push_str(&format!(r#" ySplit="{y}""#));
    }
    out.push_str(&format!(
        r#" topLeftCell="{}" activePane="{active}" state="frozen"/>"#,
        top_left.to_a1()
    ));
    Some(out)
}

/// A fresh `<sheetViews>` for a part that has none. Nothing is written when nothing is frozen.
fn write_sheet_views(writer: &mut Writer<Vec<u8>>, tags: &Tags, top_left: Option<CellRef>) {
    let Some(pane) = pane_xml(tags, top_left) else {
        return;
    };
    let (views, view) = (tags.name("sheetViews"), tags.name("sheetView"));
    let out = format!(r#"<{views}><{view} workbookViewId="0">{pane}</{view}></{views}>"#);
    writer.get_mut().extend_from_slice(out.as_bytes());
}

/// Inside `<sheetViews>`: replace the pane of the first `<sheetView>`, copy the rest.
fn patch_sheet_views(
    reader: &mut Reader<&[u8]>,
    writer: &mut Writer<Vec<u8>>,
    tags: &Tags,
    top_left: Option<CellRef>,
) -> Result<(), XlsxError> {
    let pane = pane_xml(tags, top_left);
    let mut first = true;

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Start(ref e) if first && e.local_name().as_ref() == b"sheetView" => {
                first = false;
                writer.write_event(event.borrow())?;
                if let Some(pane) = &pane {
                    writer.get_mut().extend_from_slice(pane.as_bytes());
                }
                // Drop the old pane and any selection tied to a pane that may no longer exist.
                loop {
                    let inner = reader.read_event()?;
                    match inner {
                        Event::Start(ref c) | Event::Empty(ref c)
                            if c.local_name().as_ref() == b"pane"
                                || (c.local_name().as_ref() == b"selection"
                                    && attr_value(c, b"pane")?.is_some()) =>
                        {
                            if matches!(inner, Event::Start(_)) {
                                skip_until_end(reader)?;
                            }
                        }
                        Event::Start(_) => {
                            writer.write_event(inner.borrow())?;
                            copy_until_end(reader, writer)?;
                        }
                        Event::End(_) => {
                            writer.write_event(inner)?;
                            break;
                        }
                        Event::Eof => {
                            return Err(XlsxError::malformed("worksheet", "unexpected eof in <sheetView>"))
                        }
                        other => writer.write_event(other)?,
                    }
                }
            }
            Event::Empty(ref e) if first && e.local_name().as_ref() == b"sheetView" => {
                first = false;
                match &pane {
                    Some(pane) => {
                        writer.write_event(Event::Start(e.borrow()))?;
                        writer.get_mut().extend_from_slice(pane.as_bytes());
                        writer.write_event(Event::End(BytesEnd::new(
                            String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                        )))?;
                    }
                    None => writer.write_event(event.borrow())?,
                }
            }
            Event::End(ref e) if e.local_name().as_ref() == b"sheetViews" => {
                writer.write_event(event)?;
                break;
            }
            Event::Eof => return Err(XlsxError::malformed("worksheet", "unexpected eof in <sheetViews>")),
            other => writer.write_event(other)?,
        }
    }
    Ok(())
}
