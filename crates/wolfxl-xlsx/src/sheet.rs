//! Lazily decoded view of one worksheet part.
//!
//! Opening a sheet performs a single scan that records the byte span of every `<row>`,
//! plus the sheet-level metadata (`<dimension>`, `<mergeCells>`, the frozen pane). Cells
//! are only decoded when a row is first visited.

use std::cell::{OnceCell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use wolfxl_model::{
    column_index, column_letters, serial_to_datetime, CellRef, CellValue, DateSystem, ErrorValue,
    Formula, Range, EXCEL_MAX_COLS, EXCEL_MAX_ROWS,
};

use crate::shared_strings::SharedStringTable;
use crate::styles::StylePool;
use crate::xml::{attr_value, local_name, read_text};
use crate::XlsxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RowSpan {
    start: usize,
    end: usize,
    has_cells: bool,
}

/// `<f>` as stored on a cell.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFormula {
    pub text: String,
    /// `t` attribute: `shared`, `array`, `dataTable`, or `None` for a normal formula.
    pub kind: Option<String>,
    pub shared_index: Option<u32>,
    pub reference: Option<String>,
}

impl RawFormula {
    /// The anchor of a shared or array group spanning more than this one cell. Rewriting
    /// it would orphan the cells that depend on it.
    pub fn is_group_anchor(&self) -> bool {
        matches!(self.kind.as_deref(), Some("shared") | Some("array"))
            && self
                .reference
                .as_deref()
                .and_then(|r| Range::from_a1(r).ok())
                .is_some_and(|r| !r.is_single_cell())
    }
}

/// A `<c>` element, decoded but not yet interpreted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawCell {
    pub col: u32,
    pub cell_type: Option<String>,
    pub style: u32,
    pub value: Option<String>,
    pub formula: Option<RawFormula>,
    pub inline_text: Option<String>,
}

impl RawCell {
    /// Shared string index, for `t="s"` cells.
    pub fn shared_string(&self) -> Option<u32> {
        match self.cell_type.as_deref() {
            Some("s") => self.value.as_deref().and_then(|v| v.trim().parse::<u32>().ok()),
            _ => None,
        }
    }
}

/// Lookups needed to turn a [`RawCell`] into a [`CellValue`].
#[derive(Clone, Copy)]
pub(crate) struct ValueContext<'a> {
    pub strings: Option<&'a SharedStringTable>,
    pub styles: Option<&'a StylePool>,
    pub date_system: DateSystem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SharedFormula {
    anchor: CellRef,
    text: String,
}

#[derive(Debug)]
pub struct SheetView {
    part: String,
    xml: Vec<u8>,
    rows: BTreeMap<u32, RowSpan>,
    dimension: Option<Range>,
    merges: Vec<Range>,
    freeze_panes: Option<CellRef>,
    decoded: RefCell<HashMap<u32, Rc<Vec<RawCell>>>>,
    shared_formulas: OnceCell<HashMap<u32, SharedFormula>>,
}

impl SheetView {
    pub fn parse(part: &str, xml: Vec<u8>) -> Result<Self, XlsxError> {
        let mut rows = BTreeMap::new();
        let mut dimension = None;
        let mut merges = Vec::new();
        let mut freeze_panes = None;

        {
            let mut reader = Reader::from_reader(xml.as_slice());
            reader.config_mut().trim_text(false);
            let mut last_row = 0u32;
            let mut sheet_views = 0usize;
            let mut saw_worksheet = false;

            loop {
                let start = reader.buffer_position() as usize;
                match reader.read_event()? {
                    Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"worksheet" => {
                        saw_worksheet = true;
                    }
                    Event::Start(e) if e.local_name().as_ref() == b"row" => {
                        let row = row_number(&e, last_row, part)?;
                        reader.read_to_end(e.name())?;
                        let end = reader.buffer_position() as usize;
                        rows.insert(row, RowSpan { start, end, has_cells: true });
                        last_row = row;
                    }
                    Event::Empty(e) if e.local_name().as_ref() == b"row" => {
                        let row = row_number(&e, last_row, part)?;
                        let end = reader.buffer_position() as usize;
                        rows.insert(row, RowSpan { start, end, has_cells: false });
                        last_row = row;
                    }
                    Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"dimension" => {
                        dimension = attr_value(&e, b"ref")?.and_then(|r| Range::from_a1(&r).ok());
                    }
                    Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"mergeCell" => {
                        if let Some(r) = attr_value(&e, b"ref")? {
                            match Range::from_a1(&r) {
                                Ok(range) => merges.push(range),
                                Err(_) => log::warn!("{part}: ignoring unparseable merge {r:?}"),
                            }
                        }
                    }
                    Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheetView" => {
                        sheet_views += 1;
                    }
                    Event::Start(e) | Event::Empty(e)
                        if e.local_name().as_ref() == b"pane" && sheet_views == 1 =>
                    {
                        freeze_panes = parse_frozen_pane(&e)?;
                    }
                    Event::Eof => break,
                    _ => {}
                }
            }

            if !saw_worksheet {
                return Err(XlsxError::malformed(part, "root element is not <worksheet>"));
            }
        }

        log::debug!("indexed {part}: {} rows, {} merges", rows.len(), merges.len());
        Ok(Self {
            part: part.to_string(),
            xml,
            rows,
            dimension,
            merges,
            freeze_panes,
            decoded: RefCell::new(HashMap::new()),
            shared_formulas: OnceCell::new(),
        })
    }

    pub fn part(&self) -> &str {
        &self.part
    }

    pub(crate) fn xml(&self) -> &[u8] {
        &self.xml
    }

    pub fn dimension(&self) -> Option<Range> {
        self.dimension
    }

    pub fn merges(&self) -> &[Range] {
        &self.merges
    }

    pub fn freeze_panes(&self) -> Option<CellRef> {
        self.freeze_panes
    }

    /// Last row holding at least one cell.
    pub fn max_row(&self) -> Option<u32> {
        self.rows
            .iter()
            .rev()
            .find(|(_, span)| span.has_cells)
            .map(|(row, _)| *row)
    }

    /// Used range: the stored `<dimension>`, or the extent of the cells when the part has
    /// none (which decodes every row). An empty sheet has none.
    pub fn used_range(&self) -> Result<Option<Range>, XlsxError> {
        if let Some(dim) = self.dimension {
            // Producers write `A1` for sheets without cells.
            if dim.is_single_cell() && self.max_row().is_none() {
                return Ok(None);
            }
            return Ok(Some(dim));
        }
        let mut extent: Option<Range> = None;
        let rows: Vec<u32> = self.rows.keys().copied().collect();
        for row in rows {
            for cell in self.row(row)?.iter() {
                let here = Range::single(CellRef { row, col: cell.col });
                extent = Some(match extent {
                    Some(r) => r.union(&here),
                    None => here,
                });
            }
        }
        Ok(extent)
    }

    /// Decoded cells of `row`, in column order. Empty when the row does not exist.
    pub fn row(&self, row: u32) -> Result<Rc<Vec<RawCell>>, XlsxError> {
        if let Some(cells) = self.decoded.borrow().get(&row) {
            return Ok(Rc::clone(cells));
        }
        let cells = match self.rows.get(&row) {
            Some(span) if span.has_cells => decode_row(&self.xml[span.start..span.end], &self.part)?,
            _ => Vec::new(),
        };
        let cells = Rc::new(cells);
        self.decoded.borrow_mut().insert(row, Rc::clone(&cells));
        Ok(cells)
    }

    pub fn raw_cell(&self, cell: CellRef) -> Result<Option<RawCell>, XlsxError> {
        let row = self.row(cell.row)?;
        Ok(row
            .binary_search_by_key(&cell.col, |c| c.col)
            .ok()
            .map(|idx| row[idx].clone()))
    }

    /// Whether any cell stores a shared string reference.
    pub fn uses_shared_strings(&self) -> bool {
        contains_attr(&self.xml, b"t=\"s\"") || contains_attr(&self.xml, b"t='s'")
    }

    /// Whether any cell stores an inline string.
    pub fn uses_inline_strings(&self) -> bool {
        contains_attr(&self.xml, b"t=\"inlineStr\"") || contains_attr(&self.xml, b"t='inlineStr'")
    }

    /// Interpret a raw cell at `cell`.
    pub(crate) fn value_of(
        &self,
        cell: CellRef,
        raw: &RawCell,
        ctx: ValueContext<'_>,
    ) -> Result<CellValue, XlsxError> {
        let value = self.plain_value(raw, ctx)?;
        let Some(formula) = &raw.formula else {
            return Ok(value);
        };

        let text = if formula.text.is_empty() && formula.kind.as_deref() == Some("shared") {
            match formula.shared_index.and_then(|si| self.shared_formula(si, cell)) {
                Some(text) => text,
                None => return Ok(value),
            }
        } else {
            formula.text.clone()
        };
        if text.is_empty() {
            return Ok(value);
        }

        let mut f = Formula::new(text);
        if !value.is_empty() {
            f = f.with_cached(value);
        }
        Ok(CellValue::Formula(f))
    }

    fn plain_value(&self, raw: &RawCell, ctx: ValueContext<'_>) -> Result<CellValue, XlsxError> {
        let v = raw.value.as_deref();
        let value = match raw.cell_type.as_deref() {
            Some("s") => {
                let Some(idx) = raw.shared_string() else {
                    return Ok(CellValue::Empty);
                };
                let text = ctx
                    .strings
                    .and_then(|sst| sst.materialize(idx))
                    .ok_or_else(|| {
                        XlsxError::malformed(
                            &self.part,
                            format!("cell refers to missing shared string {idx}"),
                        )
                    })?;
                CellValue::String(text.to_string())
            }
            Some("inlineStr") => match &raw.inline_text {
                Some(text) => CellValue::String(text.clone()),
                None => CellValue::Empty,
            },
            Some("str") => CellValue::String(v.unwrap_or_default().to_string()),
            Some("b") => match v.map(str::trim) {
                Some("1") | Some("true") => CellValue::Boolean(true),
                Some(_) => CellValue::Boolean(false),
                None => CellValue::Empty,
            },
            Some("e") => match v {
                Some(v) => ErrorValue::from_str(v)
                    .map(CellValue::Error)
                    .unwrap_or_else(|_| CellValue::String(v.to_string())),
                None => CellValue::Empty,
            },
            Some("d") => match v.and_then(parse_iso_datetime) {
                Some(dt) => CellValue::DateTime(dt),
                None => CellValue::Empty,
            },
            _ => match v.map(str::trim).filter(|v| !v.is_empty()) {
                Some(v) => {
                    let n = v.parse::<f64>().map_err(|_| {
                        XlsxError::malformed(&self.part, format!("invalid number {v:?}"))
                    })?;
                    let is_date = ctx.styles.is_some_and(|s| s.is_date_style(raw.style));
                    match is_date.then(|| serial_to_datetime(n, ctx.date_system)).flatten() {
                        Some(dt) => CellValue::DateTime(dt),
                        None => CellValue::Number(n),
                    }
                }
                None => CellValue::Empty,
            },
        };
        Ok(value)
    }

    fn shared_formula(&self, si: u32, cell: CellRef) -> Option<String> {
        let groups = self
            .shared_formulas
            .get_or_init(|| scan_shared_formulas(&self.xml).unwrap_or_default());
        let group = groups.get(&si)?;
        Some(shift_formula(
            &group.text,
            i64::from(cell.row) - i64::from(group.anchor.row),
            i64::from(cell.col) - i64::from(group.anchor.col),
        ))
    }
}

fn contains_attr(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn row_number(e: &BytesStart<'_>, last_row: u32, part: &str) -> Result<u32, XlsxError> {
    match attr_value(e, b"r")? {
        Some(r) => r
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|r| (1..=EXCEL_MAX_ROWS).contains(r))
            .ok_or_else(|| XlsxError::malformed(part, format!("invalid row number {r:?}"))),
        None => Ok(last_row + 1),
    }
}

fn parse_frozen_pane(e: &BytesStart<'_>) -> Result<Option<CellRef>, XlsxError> {
    let state = attr_value(e, b"state")?;
    if !matches!(state.as_deref(), Some("frozen") | Some("frozenSplit")) {
        return Ok(None);
    }
    if let Some(top_left) = attr_value(e, b"topLeftCell")? {
        if let Ok(cell) = CellRef::from_a1(&top_left) {
            return Ok(Some(cell));
        }
    }
    let split = |v: Option<String>| {
        v.and_then(|v| v.parse::<f64>().ok())
            .map(|v| v.max(0.0) as u32)
            .unwrap_or(0)
    };
    let x = split(attr_value(e, b"xSplit")?);
    let y = split(attr_value(e, b"ySplit")?);
    Ok(CellRef::new(y + 1, x + 1).ok())
}

fn parse_iso_datetime(v: &str) -> Option<NaiveDateTime> {
    let v = v.trim();
    NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn decode_row(bytes: &[u8], part: &str) -> Result<Vec<RawCell>, XlsxError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);
    let mut cells: Vec<RawCell> = Vec::new();
    let mut last_col = 0u32;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"c" => {
                let mut cell = cell_attrs(&e, last_col, part)?;
                decode_cell_children(&mut reader, &mut cell, part)?;
                last_col = cell.col;
                cells.push(cell);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                let cell = cell_attrs(&e, last_col, part)?;
                last_col = cell.col;
                cells.push(cell);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    // Producers are supposed to write cells in column order; tolerate those that don't.
    cells.sort_by_key(|c| c.col);
    cells.dedup_by_key(|c| c.col);
    Ok(cells)
}

fn cell_attrs(e: &BytesStart<'_>, last_col: u32, part: &str) -> Result<RawCell, XlsxError> {
    let mut cell = RawCell {
        col: last_col + 1,
        ..RawCell::default()
    };
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        match local_name(attr.key.as_ref()) {
            b"r" => {
                let col_letters: String = value.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
                cell.col = column_index(&col_letters).map_err(|_| {
                    XlsxError::malformed(part, format!("invalid cell reference {value:?}"))
                })?;
            }
            b"t" => cell.cell_type = Some(value.into_owned()),
            b"s" => cell.style = value.trim().parse::<u32>().unwrap_or(0),
            _ => {}
        }
    }
    if cell.col == 0 || cell.col > EXCEL_MAX_COLS {
        return Err(XlsxError::malformed(part, "cell column out of range"));
    }
    Ok(cell)
}

fn decode_cell_children(
    reader: &mut Reader<&[u8]>,
    cell: &mut RawCell,
    part: &str,
) -> Result<(), XlsxError> {
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"v" => {
                cell.value = Some(read_text(reader, e.name())?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"f" => {
                let mut formula = formula_attrs(&e)?;
                formula.text = read_text(reader, e.name())?;
                cell.formula = Some(formula);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"f" => {
                cell.formula = Some(formula_attrs(&e)?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"is" => {
                cell.inline_text = Some(inline_text(reader, part)?);
            }
            Event::Start(e) => {
                reader.read_to_end(e.name())?;
            }
            Event::End(e) if e.local_name().as_ref() == b"c" => break,
            Event::Eof => return Err(XlsxError::malformed(part, "unexpected eof in <c>")),
            _ => {}
        }
    }
    Ok(())
}

fn formula_attrs(e: &BytesStart<'_>) -> Result<RawFormula, XlsxError> {
    Ok(RawFormula {
        text: String::new(),
        kind: attr_value(e, b"t")?,
        shared_index: attr_value(e, b"si")?.and_then(|v| v.trim().parse::<u32>().ok()),
        reference: attr_value(e, b"ref")?,
    })
}

/// Visible text of `<is>`: direct `<t>` plus run text, without phonetic runs.
fn inline_text(reader: &mut Reader<&[u8]>, part: &str) -> Result<String, XlsxError> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => {
                text.push_str(&read_text(reader, e.name())?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"r" => {}
            Event::Start(e) => {
                reader.read_to_end(e.name())?;
            }
            Event::End(e) if e.local_name().as_ref() == b"is" => break,
            Event::Eof => return Err(XlsxError::malformed(part, "unexpected eof in <is>")),
            _ => {}
        }
    }
    Ok(text)
}

fn scan_shared_formulas(xml: &[u8]) -> Result<HashMap<u32, SharedFormula>, XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut groups = HashMap::new();
    let mut current: Option<CellRef> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"c" => {
                current = attr_value(&e, b"r")?.and_then(|r| CellRef::from_a1(&r).ok());
            }
            Event::Start(e) if e.local_name().as_ref() == b"f" => {
                let attrs = formula_attrs(&e)?;
                let text = read_text(&mut reader, e.name())?;
                if let (Some("shared"), Some(si), Some(_), Some(anchor)) = (
                    attrs.kind.as_deref(),
                    attrs.shared_index,
                    attrs.reference.as_ref(),
                    current,
                ) {
                    if !text.is_empty() {
                        groups.entry(si).or_insert(SharedFormula { anchor, text });
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(groups)
}

/// Move the relative A1 references in `formula` by `(rows, cols)`.
///
/// References that would leave the sheet become `#REF!`. Quoted strings and quoted sheet
/// names are left alone.
pub(crate) fn shift_formula(formula: &str, rows: i64, cols: i64) -> String {
    if rows == 0 && cols == 0 {
        return formula.to_string();
    }
    let chars: Vec<char> = formula.chars().collect();
    let mut out = String::with_capacity(formula.len() + 8);
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            // Copy the quoted run verbatim; a doubled quote is an escaped one.
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == c {
                    if chars.get(i + 1) == Some(&c) {
                        out.push(c);
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            continue;
        }

        let boundary = i == 0 || !is_name_char(chars[i - 1]);
        if boundary && (c == '$' || c.is_ascii_alphabetic()) {
            if let Some((len, shifted)) = shift_reference(&chars[i..], rows, cols) {
                out.push_str(&shifted);
                i += len;
                continue;
            }
        }

        // Not a reference: copy the whole identifier so its tail isn't mistaken for one.
        if is_name_char(c) {
            while i < chars.len() && is_name_char(chars[i]) {
                out.push(chars[i]);
                i += 1;
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '$'
}

fn shift_reference(chars: &[char], rows: i64, cols: i64) -> Option<(usize, String)> {
    let mut i = 0usize;
    let col_abs = chars.first() == Some(&'$');
    if col_abs {
        i += 1;
    }
    let col_start = i;
    while i < chars.len() && chars[i].is_ascii_alphabetic() && i - col_start < 3 {
        i += 1;
    }
    if i == col_start {
        return None;
    }
    let letters: String = chars[col_start..i].iter().collect();
    let row_abs = chars.get(i) == Some(&'$');
    if row_abs {
        i += 1;
    }
    let row_start = i;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i == row_start {
        return None;
    }
    if chars
        .get(i)
        .is_some_and(|c| is_name_char(*c) || *c == '(')
    {
        return None;
    }

    let col = column_index(&letters).ok()?;
    let row: u32 = chars[row_start..i].iter().collect::<String>().parse().ok()?;
    if row == 0 || row > EXCEL_MAX_ROWS {
        return None;
    }

    let new_col = if col_abs { i64::from(col) } else { i64::from(col) + cols };
    let new_row = if row_abs { i64::from(row) } else { i64::from(row) + rows };
    if new_col < 1 || new_col > i64::from(EXCEL_MAX_COLS) || new_row < 1 || new_row > i64::from(EXCEL_MAX_ROWS) {
        return Some((i, "#REF!".to_string()));
    }

    let mut shifted = String::new();
    if col_abs {
        shifted.push('$');
    }
    shifted.push_str(&column_letters(new_col as u32));
    if row_abs {
        shifted.push('$');
    }
    shifted.push_str(&new_row.to_string());
    Some((i, shifted))
}
