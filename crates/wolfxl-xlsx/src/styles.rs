//! `xl/styles.xml` cell format pool.
//!
//! Worksheets refer to formats by their index in `cellXfs`, and each `xf` refers to font,
//! fill, border, and number format records by index. Existing records are never reordered
//! or removed: a cell in a sheet that is not rewritten keeps pointing at the same `xf`.
//! New records are appended to the end of each table, and only when no structurally equal
//! record already exists.

use std::collections::{BTreeMap, HashMap};

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use wolfxl_model::{
    builtin_format_code, builtin_format_id, is_builtin_date_format, is_date_format_code,
    Alignment, Border, BorderEdge, BorderStyle, Color, Fill, Font, HorizontalAlignment,
    PatternType, Style, StylePatch, Underline, VerticalAlignment, FIRST_CUSTOM_NUMFMT_ID,
};

use crate::xml::{escape_attr, format_number};
use crate::XlsxError;

/// Record counts of each table, used to tell appended records from original ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    pub num_fmts: usize,
    pub fonts: usize,
    pub fills: usize,
    pub borders: usize,
    pub cell_xfs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct XfRecord {
    num_fmt_id: u32,
    font_id: u32,
    fill_id: u32,
    border_id: u32,
    xf_id: u32,
    alignment: Alignment,
}

#[derive(Debug, Clone)]
pub struct StylePool {
    num_fmts: BTreeMap<u32, String>,
    num_fmt_by_code: HashMap<String, u32>,
    new_num_fmts: Vec<(u32, String)>,
    next_num_fmt_id: u32,

    fonts: Vec<Font>,
    font_index: HashMap<Font, u32>,
    fills: Vec<Fill>,
    fill_index: HashMap<Fill, u32>,
    borders: Vec<Border>,
    border_index: HashMap<Border, u32>,

    cell_xfs: Vec<XfRecord>,
    xf_index: HashMap<XfRecord, u32>,

    original: PoolSnapshot,
    /// `cellXfs` length after default seeding; growth past it marks the pool dirty.
    loaded_xfs: usize,
}

impl StylePool {
    pub fn parse(xml: &[u8]) -> Result<Self, XlsxError> {
        let text = std::str::from_utf8(xml)?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let doc = roxmltree::Document::parse(text)?;
        let root = doc.root_element();
        if root.tag_name().name() != "styleSheet" {
            return Err(XlsxError::malformed("styles.xml", "root is not <styleSheet>"));
        }

        let num_fmts = parse_num_fmts(root);
        let mut num_fmt_by_code = HashMap::new();
        let mut max_custom = FIRST_CUSTOM_NUMFMT_ID - 1;
        for (id, code) in &num_fmts {
            num_fmt_by_code.entry(code.clone()).or_insert(*id);
            max_custom = max_custom.max(*id);
        }

        let fonts = children(root, "fonts", "font").map(parse_font).collect::<Vec<_>>();
        let fills = children(root, "fills", "fill")
            .map(|el| parse_fill(text, el))
            .collect::<Vec<_>>();
        let borders = children(root, "borders", "border")
            .map(parse_border)
            .collect::<Vec<_>>();
        let cell_xfs = children(root, "cellXfs", "xf").map(parse_xf).collect::<Vec<_>>();

        let original = PoolSnapshot {
            num_fmts: num_fmts.len(),
            fonts: fonts.len(),
            fills: fills.len(),
            borders: borders.len(),
            cell_xfs: cell_xfs.len(),
        };

        let mut pool = StylePool {
            num_fmts,
            num_fmt_by_code,
            new_num_fmts: Vec::new(),
            next_num_fmt_id: max_custom + 1,
            font_index: first_wins(&fonts),
            fonts,
            fill_index: first_wins(&fills),
            fills,
            border_index: first_wins(&borders),
            borders,
            cell_xfs: Vec::new(),
            xf_index: HashMap::new(),
            original,
            loaded_xfs: 0,
        };

        // Index formats by canonical component ids so that an `xf` pointing at a duplicate
        // font (or fill, border, format code) still matches a request for the first one.
        for xf in cell_xfs {
            let idx = pool.cell_xfs.len() as u32;
            let key = pool.canonical(&xf);
            pool.xf_index.entry(key).or_insert(idx);
            pool.cell_xfs.push(xf);
        }

        // A producer that omitted a table still expects index 0 to mean "default".
        if pool.fonts.is_empty() {
            pool.push_font(default_font());
        }
        if pool.fills.is_empty() {
            pool.push_fill(Fill::default());
            pool.push_fill(Fill::Pattern {
                pattern: PatternType::Gray125,
                fg_color: None,
                bg_color: None,
            });
        }
        if pool.borders.is_empty() {
            pool.push_border(Border::default());
        }
        if pool.cell_xfs.is_empty() {
            let xf = XfRecord {
                num_fmt_id: 0,
                font_id: 0,
                fill_id: 0,
                border_id: 0,
                xf_id: 0,
                alignment: Alignment::default(),
            };
            pool.xf_index.insert(xf.clone(), 0);
            pool.cell_xfs.push(xf);
        }
        pool.loaded_xfs = pool.cell_xfs.len();

        log::debug!(
            "parsed styles: {} cellXfs, {} fonts, {} fills, {} borders, {} custom numFmts",
            original.cell_xfs,
            original.fonts,
            original.fills,
            original.borders,
            original.num_fmts
        );
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.cell_xfs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_xfs.is_empty()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            num_fmts: self.num_fmts.len(),
            fonts: self.fonts.len(),
            fills: self.fills.len(),
            borders: self.borders.len(),
            cell_xfs: self.cell_xfs.len(),
        }
    }

    /// Counts as parsed from the package.
    pub fn original_snapshot(&self) -> PoolSnapshot {
        self.original
    }

    /// Whether new cell formats were appended.
    pub fn is_dirty(&self) -> bool {
        self.cell_xfs.len() != self.loaded_xfs
    }

    /// Materialize the format at `index`.
    pub fn record(&self, index: u32) -> Option<Style> {
        let xf = self.cell_xfs.get(index as usize)?;
        Some(Style {
            font: self.fonts.get(xf.font_id as usize).cloned().unwrap_or_default(),
            fill: self.fills.get(xf.fill_id as usize).cloned().unwrap_or_default(),
            border: self
                .borders
                .get(xf.border_id as usize)
                .cloned()
                .unwrap_or_default(),
            alignment: xf.alignment.clone(),
            number_format: self.number_format_code(xf.num_fmt_id),
        })
    }

    /// Format code for a `numFmtId`; `None` for General.
    pub fn number_format_code(&self, num_fmt_id: u32) -> Option<String> {
        if num_fmt_id == 0 {
            return None;
        }
        self.num_fmts
            .get(&num_fmt_id)
            .cloned()
            .or_else(|| builtin_format_code(num_fmt_id).map(str::to_string))
            .filter(|code| !code.eq_ignore_ascii_case("general"))
    }

    /// Whether the format at `index` renders numbers as dates or times.
    pub fn is_date_style(&self, index: u32) -> bool {
        let Some(xf) = self.cell_xfs.get(index as usize) else {
            return false;
        };
        if is_builtin_date_format(xf.num_fmt_id) {
            return true;
        }
        self.num_fmts
            .get(&xf.num_fmt_id)
            .is_some_and(|code| is_date_format_code(code))
    }

    /// Index of a format equal to `style`, appending one if none exists.
    pub fn resolve(&mut self, style: &Style) -> Result<u32, XlsxError> {
        let record = XfRecord {
            num_fmt_id: self.intern_number_format(style.number_format.as_deref()),
            font_id: self.intern_font(&style.font),
            fill_id: self.intern_fill(&style.fill),
            border_id: self.intern_border(&style.border),
            xf_id: 0,
            alignment: style.alignment.clone(),
        };
        self.intern_xf(record)
    }

    /// Overlay `patch` on the format at `base`, keeping the components it leaves out as they
    /// are (including their original record ids).
    pub fn resolve_patch(&mut self, base: u32, patch: &StylePatch) -> Result<u32, XlsxError> {
        if patch.is_empty() {
            return Ok(base);
        }
        let base_record = self.cell_xfs.get(base as usize).cloned().ok_or_else(|| {
            XlsxError::malformed("styles.xml", format!("cell format {base} does not exist"))
        })?;
        let base_style = self.record(base).unwrap_or_default();
        let patched = patch.apply(&base_style);

        let mut record = base_record;
        if patch.font.is_some() {
            record.font_id = self.intern_font(&patched.font);
        }
        if patch.fill.is_some() {
            record.fill_id = self.intern_fill(&patched.fill);
        }
        if patch.border.is_some() {
            record.border_id = self.intern_border(&patched.border);
        }
        if patch.alignment.is_some() {
            record.alignment = patched.alignment.clone();
        }
        if patch.number_format.is_some() {
            record.num_fmt_id = self.intern_number_format(patched.number_format.as_deref());
        }
        self.intern_xf(record)
    }

    fn intern_xf(&mut self, record: XfRecord) -> Result<u32, XlsxError> {
        let key = self.canonical(&record);
        if let Some(idx) = self.xf_index.get(&key) {
            return Ok(*idx);
        }
        let idx = self.cell_xfs.len() as u32;
        self.cell_xfs.push(record.clone());
        self.xf_index.insert(key, idx);
        self.verify_appended(idx, &record)?;
        log::debug!("appended cell format {idx}");
        Ok(idx)
    }

    /// Re-materialize a freshly appended format and compare it with what was requested.
    fn verify_appended(&self, idx: u32, requested: &XfRecord) -> Result<(), XlsxError> {
        let stored = self.cell_xfs.get(idx as usize);
        let ok = stored == Some(requested)
            && (requested.font_id as usize) < self.fonts.len()
            && (requested.fill_id as usize) < self.fills.len()
            && (requested.border_id as usize) < self.borders.len()
            && (requested.num_fmt_id == 0
                || self.num_fmts.contains_key(&requested.num_fmt_id)
                || builtin_format_code(requested.num_fmt_id).is_some());
        if ok {
            Ok(())
        } else {
            Err(XlsxError::PoolInconsistency(format!(
                "cell format {idx} does not match the record it was appended for"
            )))
        }
    }

    fn canonical(&self, xf: &XfRecord) -> XfRecord {
        let canon = |id: u32, index: Option<&u32>| index.copied().unwrap_or(id);
        XfRecord {
            num_fmt_id: match self.num_fmts.get(&xf.num_fmt_id) {
                Some(code) => builtin_format_id(code)
                    .or_else(|| self.num_fmt_by_code.get(code).copied())
                    .unwrap_or(xf.num_fmt_id),
                None => xf.num_fmt_id,
            },
            font_id: canon(
                xf.font_id,
                self.fonts
                    .get(xf.font_id as usize)
                    .and_then(|f| self.font_index.get(f)),
            ),
            fill_id: canon(
                xf.fill_id,
                self.fills
                    .get(xf.fill_id as usize)
                    .and_then(|f| self.fill_index.get(f)),
            ),
            border_id: canon(
                xf.border_id,
                self.borders
                    .get(xf.border_id as usize)
                    .and_then(|b| self.border_index.get(b)),
            ),
            xf_id: xf.xf_id,
            alignment: xf.alignment.clone(),
        }
    }

    fn intern_number_format(&mut self, code: Option<&str>) -> u32 {
        let Some(code) = code.filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("general"))
        else {
            return 0;
        };
        if let Some(id) = builtin_format_id(code) {
            return id;
        }
        if let Some(id) = self.num_fmt_by_code.get(code) {
            return *id;
        }
        let id = self.next_num_fmt_id;
        self.next_num_fmt_id += 1;
        self.num_fmts.insert(id, code.to_string());
        self.num_fmt_by_code.insert(code.to_string(), id);
        self.new_num_fmts.push((id, code.to_string()));
        id
    }

    fn intern_font(&mut self, font: &Font) -> u32 {
        match self.font_index.get(font) {
            Some(idx) => *idx,
            None => self.push_font(font.clone()),
        }
    }

    fn push_font(&mut self, font: Font) -> u32 {
        let idx = self.fonts.len() as u32;
        self.font_index.entry(font.clone()).or_insert(idx);
        self.fonts.push(font);
        idx
    }

    fn intern_fill(&mut self, fill: &Fill) -> u32 {
        match self.fill_index.get(fill) {
            Some(idx) => *idx,
            None => self.push_fill(fill.clone()),
        }
    }

    fn push_fill(&mut self, fill: Fill) -> u32 {
        let idx = self.fills.len() as u32;
        self.fill_index.entry(fill.clone()).or_insert(idx);
        self.fills.push(fill);
        idx
    }

    fn intern_border(&mut self, border: &Border) -> u32 {
        match self.border_index.get(border) {
            Some(idx) => *idx,
            None => self.push_border(border.clone()),
        }
    }

    fn push_border(&mut self, border: Border) -> u32 {
        let idx = self.borders.len() as u32;
        self.border_index.entry(border.clone()).or_insert(idx);
        self.borders.push(border);
        idx
    }

    /// Stream `original` through, appending new records to each table and updating counts.
    pub(crate) fn write(&self, original: &[u8]) -> Result<Vec<u8>, XlsxError> {
        let mut reader = Reader::from_reader(original);
        reader.config_mut().trim_text(false);
        let mut writer = Writer::new(Vec::with_capacity(original.len() + 1024));

        let mut depth = 0usize;
        let mut prefix = String::new();
        let mut seen = [false; TABLES.len()];

        loop {
            let event = reader.read_event()?;
            match event {
                Event::Eof => break,
                Event::Start(ref e) | Event::Empty(ref e) if depth == 0 => {
                    if e.local_name().as_ref() == b"styleSheet" {
                        prefix = crate::xml::element_prefix(e)
                            .map(|p| format!("{p}:"))
                            .unwrap_or_default();
                    }
                    if matches!(event, Event::Start(_)) {
                        depth += 1;
                    } else {
                        // `<styleSheet/>`: nothing to preserve; emit every table we hold.
                        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                        writer.write_event(Event::Start(e.borrow()))?;
                        self.write_missing_tables(&mut writer, &prefix, &mut seen, TABLES.len());
                        writer
                            .get_mut()
                            .extend_from_slice(format!("</{tag}>").as_bytes());
                        continue;
                    }
                    writer.write_event(event)?;
                }
                Event::Start(ref e) | Event::Empty(ref e) if depth == 1 => {
                    let local = e.local_name().as_ref().to_vec();
                    let position = schema_position(&local);
                    self.write_missing_tables(&mut writer, &prefix, &mut seen, position);

                    match table_index(&local) {
                        Some(table) => {
                            seen[table] = true;
                            let start = self.counted_start(e, table)?;
                            if matches!(event, Event::Start(_)) {
                                depth += 1;
                                writer.write_event(Event::Start(start))?;
                            } else {
                                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                                writer.write_event(Event::Start(start))?;
                                self.write_appended(&mut writer, &prefix, table);
                                writer
                                    .get_mut()
                                    .extend_from_slice(format!("</{tag}>").as_bytes());
                            }
                        }
                        None => {
                            if matches!(event, Event::Start(_)) {
                                depth += 1;
                            }
                            writer.write_event(event)?;
                        }
                    }
                }
                Event::Start(_) => {
                    depth += 1;
                    writer.write_event(event)?;
                }
                Event::End(ref e) => {
                    depth = depth.saturating_sub(1);
                    if depth == 1 {
                        if let Some(table) = table_index(e.local_name().as_ref()) {
                            self.write_appended(&mut writer, &prefix, table);
                        }
                    } else if depth == 0 {
                        self.write_missing_tables(&mut writer, &prefix, &mut seen, TABLES.len());
                    }
                    writer.write_event(event)?;
                }
                other => writer.write_event(other)?,
            }
        }

        Ok(writer.into_inner())
    }

    /// Emit whole tables that the original lacked but that now have records, for every
    /// table ordered before `position`.
    fn write_missing_tables(
        &self,
        writer: &mut Writer<Vec<u8>>,
        prefix: &str,
        seen: &mut [bool; TABLES.len()],
        position: usize,
    ) {
        for (table, name) in TABLES.iter().enumerate() {
            if seen[table] || schema_position(name.as_bytes()) >= position {
                continue;
            }
            if self.appended_len(table) == 0 {
                continue;
            }
            seen[table] = true;
            let count = self.table_len(table);
            writer
                .get_mut()
                .extend_from_slice(format!(r#"<{prefix}{name} count="{count}">"#).as_bytes());
            self.write_appended(writer, prefix, table);
            writer
                .get_mut()
                .extend_from_slice(format!("</{prefix}{name}>").as_bytes());
        }
    }

    fn counted_start(&self, e: &BytesStart<'_>, table: usize) -> Result<BytesStart<'static>, XlsxError> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut start = BytesStart::new(tag);
        let count = self.table_len(table).to_string();
        let mut saw_count = false;
        for attr in e.attributes() {
            let attr = attr?;
            if attr.key.as_ref() == b"count" {
                saw_count = true;
                start.push_attribute(("count", count.as_str()));
            } else {
                start.push_attribute(attr);
            }
        }
        if !saw_count && self.appended_len(table) > 0 {
            start.push_attribute(("count", count.as_str()));
        }
        Ok(start)
    }

    fn table_len(&self, table: usize) -> usize {
        match table {
            NUM_FMTS => self.num_fmts.len(),
            FONTS => self.fonts.len(),
            FILLS => self.fills.len(),
            BORDERS => self.borders.len(),
            _ => self.cell_xfs.len(),
        }
    }

    fn appended_len(&self, table: usize) -> usize {
        match table {
            NUM_FMTS => self.new_num_fmts.len(),
            FONTS => self.fonts.len() - self.original.fonts,
            FILLS => self.fills.len() - self.original.fills,
            BORDERS => self.borders.len() - self.original.borders,
            _ => self.cell_xfs.len() - self.original.cell_xfs,
        }
    }

    fn write_appended(&self, writer: &mut Writer<Vec<u8>>, p: &str, table: usize) {
        let out = writer.get_mut();
        match table {
            NUM_FMTS => {
                for (id, code) in &self.new_num_fmts {
                    out.extend_from_slice(
                        format!(
                            r#"<{p}numFmt numFmtId="{id}" formatCode="{}"/>"#,
                            escape_attr(code)
                        )
                        .as_bytes(),
                    );
                }
            }
            FONTS => {
                for font in &self.fonts[self.original.fonts..] {
                    out.extend_from_slice(render_font(p, font).as_bytes());
                }
            }
            FILLS => {
                for fill in &self.fills[self.original.fills..] {
                    out.extend_from_slice(render_fill(p, fill).as_bytes());
                }
            }
            BORDERS => {
                for border in &self.borders[self.original.borders..] {
                    out.extend_from_slice(render_border(p, border).as_bytes());
                }
            }
            _ => {
                for xf in &self.cell_xfs[self.original.cell_xfs..] {
                    out.extend_from_slice(render_xf(p, xf).as_bytes());
                }
            }
        }
    }
}

const NUM_FMTS: usize = 0;
const FONTS: usize = 1;
const FILLS: usize = 2;
const BORDERS: usize = 3;
const TABLES: [&str; 5] = ["numFmts", "fonts", "fills", "borders", "cellXfs"];

fn table_index(local: &[u8]) -> Option<usize> {
    TABLES.iter().position(|t| t.as_bytes() == local)
}

fn schema_position(local: &[u8]) -> usize {
    const ORDER: [&[u8]; 11] = [
        b"numFmts",
        b"fonts",
        b"fills",
        b"borders",
        b"cellStyleXfs",
        b"cellXfs",
        b"cellStyles",
        b"dxfs",
        b"tableStyles",
        b"colors",
        b"extLst",
    ];
    ORDER.iter().position(|o| *o == local).unwrap_or(ORDER.len())
}

fn first_wins<T: Clone + Eq + std::hash::Hash>(items: &[T]) -> HashMap<T, u32> {
    let mut index = HashMap::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        index.entry(item.clone()).or_insert(idx as u32);
    }
    index
}

fn default_font() -> Font {
    Font {
        name: Some("Calibri".to_string()),
        size_100pt: Some(1100),
        color: Some(Color::Theme {
            index: 1,
            tint: None,
        }),
        family: Some(2),
        scheme: Some("minor".to_string()),
        ..Font::default()
    }
}

type Node<'a, 'input> = roxmltree::Node<'a, 'input>;

fn child<'a, 'input>(el: Node<'a, 'input>, local: &str) -> Option<Node<'a, 'input>> {
    el.children()
        .find(|n| n.is_element() && n.tag_name().name() == local)
}

fn children<'a, 'input: 'a>(
    root: Node<'a, 'input>,
    table: &'a str,
    item: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    child(root, table)
        .into_iter()
        .flat_map(move |t| t.children().filter(move |n| n.is_element() && n.tag_name().name() == item))
}

fn is_true(v: Option<&str>) -> bool {
    v.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// `<b/>` and friends: present means on unless `val` says otherwise.
fn flag(el: Node<'_, '_>, local: &str) -> bool {
    child(el, local).is_some_and(|n| n.attribute("val").map_or(true, |v| is_true(Some(v))))
}

fn parse_num_fmts(root: Node<'_, '_>) -> BTreeMap<u32, String> {
    let mut out = BTreeMap::new();
    for num_fmt in children(root, "numFmts", "numFmt") {
        let id = num_fmt.attribute("numFmtId").and_then(|v| v.parse::<u32>().ok());
        let code = num_fmt.attribute("formatCode");
        if let (Some(id), Some(code)) = (id, code) {
            out.insert(id, code.to_string());
        }
    }
    out
}

fn parse_color(el: Node<'_, '_>) -> Option<Color> {
    if is_true(el.attribute("auto")) {
        return Some(Color::Auto);
    }
    if let Some(rgb) = el.attribute("rgb") {
        return Color::from_hex(rgb);
    }
    if let Some(index) = el.attribute("theme").and_then(|v| v.parse::<u32>().ok()) {
        return Some(Color::Theme {
            index,
            tint: el.attribute("tint").map(str::to_string),
        });
    }
    el.attribute("indexed")
        .and_then(|v| v.parse::<u32>().ok())
        .map(Color::Indexed)
}

fn parse_font(el: Node<'_, '_>) -> Font {
    let val = |local: &str| child(el, local).and_then(|n| n.attribute("val"));
    Font {
        name: val("name").map(str::to_string),
        size_100pt: val("sz")
            .and_then(|v| v.parse::<f64>().ok())
            .map(|pt| (pt * 100.0).round() as u32),
        bold: flag(el, "b"),
        italic: flag(el, "i"),
        underline: child(el, "u").and_then(|u| Underline::from_ooxml(u.attribute("val"))),
        strike: flag(el, "strike"),
        color: child(el, "color").and_then(parse_color),
        family: val("family").and_then(|v| v.parse::<u32>().ok()),
        scheme: val("scheme").map(str::to_string),
    }
}

fn parse_fill(input: &str, el: Node<'_, '_>) -> Fill {
    if let Some(gradient) = child(el, "gradientFill") {
        return Fill::Gradient(input[gradient.range()].to_string());
    }
    let Some(pattern_fill) = child(el, "patternFill") else {
        return Fill::default();
    };
    Fill::Pattern {
        pattern: PatternType::from_ooxml(pattern_fill.attribute("patternType").unwrap_or("none")),
        fg_color: child(pattern_fill, "fgColor").and_then(parse_color),
        bg_color: child(pattern_fill, "bgColor").and_then(parse_color),
    }
}

fn parse_border(el: Node<'_, '_>) -> Border {
    let edge = |local: &str| {
        child(el, local)
            .map(|e| BorderEdge {
                style: BorderStyle::from_ooxml(e.attribute("style").unwrap_or("none")),
                color: child(e, "color").and_then(parse_color),
            })
            .unwrap_or_default()
    };
    Border {
        // `start`/`end` are the strict-mode spellings of left/right.
        left: child(el, "left").map(|_| edge("left")).unwrap_or_else(|| edge("start")),
        right: child(el, "right").map(|_| edge("right")).unwrap_or_else(|| edge("end")),
        top: edge("top"),
        bottom: edge("bottom"),
        diagonal: edge("diagonal"),
        diagonal_up: is_true(el.attribute("diagonalUp")),
        diagonal_down: is_true(el.attribute("diagonalDown")),
    }
}

fn parse_xf(el: Node<'_, '_>) -> XfRecord {
    let id = |attr: &str| el.attribute(attr).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
    XfRecord {
        num_fmt_id: id("numFmtId"),
        font_id: id("fontId"),
        fill_id: id("fillId"),
        border_id: id("borderId"),
        xf_id: id("xfId"),
        alignment: child(el, "alignment").map(parse_alignment).unwrap_or_default(),
    }
}

fn parse_alignment(el: Node<'_, '_>) -> Alignment {
    Alignment {
        horizontal: el.attribute("horizontal").and_then(HorizontalAlignment::from_ooxml),
        vertical: el.attribute("vertical").and_then(VerticalAlignment::from_ooxml),
        wrap_text: is_true(el.attribute("wrapText")),
        shrink_to_fit: is_true(el.attribute("shrinkToFit")),
        text_rotation: el
            .attribute("textRotation")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0),
        indent: el
            .attribute("indent")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0),
    }
}

fn render_color(p: &str, tag: &str, color: &Color) -> String {
    match color {
        Color::Argb(argb) => format!(r#"<{p}{tag} rgb="{argb:08X}"/>"#),
        Color::Theme { index, tint: Some(tint) } => {
            format!(r#"<{p}{tag} theme="{index}" tint="{}"/>"#, escape_attr(tint))
        }
        Color::Theme { index, tint: None } => format!(r#"<{p}{tag} theme="{index}"/>"#),
        Color::Indexed(index) => format!(r#"<{p}{tag} indexed="{index}"/>"#),
        Color::Auto => format!(r#"<{p}{tag} auto="1"/>"#),
    }
}

fn render_font(p: &str, font: &Font) -> String {
    let mut out = format!("<{p}font>");
    if font.bold {
        out.push_str(&format!("<{p}b/>"));
    }
    if font.italic {
        out.push_str(&format!("<{p}i/>"));
    }
    if font.strike {
        out.push_str(&format!("<{p}strike/>"));
    }
    match font.underline {
        Some(Underline::Single) => out.push_str(&format!("<{p}u/>")),
        Some(u) => out.push_str(&format!(r#"<{p}u val="{}"/>"#, u.as_ooxml())),
        None => {}
    }
    if let Some(size) = font.size_100pt {
        out.push_str(&format!(
            r#"<{p}sz val="{}"/>"#,
            format_number(size as f64 / 100.0)
        ));
    }
    if let Some(color) = &font.color {
        out.push_str(&render_color(p, "color", color));
    }
    if let Some(name) = &font.name {
        out.push_str(&format!(r#"<{p}name val="{}"/>"#, escape_attr(name)));
    }
    if let Some(family) = font.family {
        out.push_str(&format!(r#"<{p}family val="{family}"/>"#));
    }
    if let Some(scheme) = &font.scheme {
        out.push_str(&format!(r#"<{p}scheme val="{}"/>"#, escape_attr(scheme)));
    }
    out.push_str(&format!("</{p}font>"));
    out
}

fn render_fill(p: &str, fill: &Fill) -> String {
    match fill {
        Fill::Gradient(raw) => format!("<{p}fill>{raw}</{p}fill>"),
        Fill::Pattern {
            pattern,
            fg_color,
            bg_color,
        } => {
            let pattern = escape_attr(pattern.as_ooxml());
            if fg_color.is_none() && bg_color.is_none() {
                return format!(r#"<{p}fill><{p}patternFill patternType="{pattern}"/></{p}fill>"#);
            }
            let mut out = format!(r#"<{p}fill><{p}patternFill patternType="{pattern}">"#);
            if let Some(fg) = fg_color {
                out.push_str(&render_color(p, "fgColor", fg));
            }
            if let Some(bg) = bg_color {
                out.push_str(&render_color(p, "bgColor", bg));
            }
            out.push_str(&format!("</{p}patternFill></{p}fill>"));
            out
        }
    }
}

fn render_border(p: &str, border: &Border) -> String {
    let mut out = format!("<{p}border");
    if border.diagonal_up {
        out.push_str(r#" diagonalUp="1""#);
    }
    if border.diagonal_down {
        out.push_str(r#" diagonalDown="1""#);
    }
    out.push('>');
    for (tag, edge) in [
        ("left", &border.left),
        ("right", &border.right),
        ("top", &border.top),
        ("bottom", &border.bottom),
        ("diagonal", &border.diagonal),
    ] {
        match (edge.style.as_ooxml(), &edge.color) {
            (None, None) => out.push_str(&format!("<{p}{tag}/>")),
            (style, color) => {
                out.push_str(&format!("<{p}{tag}"));
                if let Some(style) = style {
                    out.push_str(&format!(r#" style="{style}""#));
                }
                match color {
                    Some(color) => {
                        out.push('>');
                        out.push_str(&render_color(p, "color", color));
                        out.push_str(&format!("</{p}{tag}>"));
                    }
                    None => out.push_str("/>"),
                }
            }
        }
    }
    out.push_str(&format!("</{p}border>"));
    out
}

fn render_xf(p: &str, xf: &XfRecord) -> String {
    let mut out = format!(
        r#"<{p}xf numFmtId="{}" fontId="{}" fillId="{}" borderId="{}" xfId="{}""#,
        xf.num_fmt_id, xf.font_id, xf.fill_id, xf.border_id, xf.xf_id
    );
    if xf.num_fmt_id != 0 {
        out.push_str(r#" applyNumberFormat="1""#);
    }
    if xf.font_id != 0 {
        out.push_str(r#" applyFont="1""#);
    }
    if xf.fill_id != 0 {
        out.push_str(r#" applyFill="1""#);
    }
    if xf.border_id != 0 {
        out.push_str(r#" applyBorder="1""#);
    }
    if xf.alignment.is_default() {
        out.push_str("/>");
        return out;
    }

    let a = &xf.alignment;
    out.push_str(&format!(r#" applyAlignment="1"><{p}alignment"#));
    if let Some(h) = a.horizontal {
        out.push_str(&format!(r#" horizontal="{}""#, h.as_ooxml()));
    }
    if let Some(v) = a.vertical {
        out.push_str(&format!(r#" vertical="{}""#, v.as_ooxml()));
    }
    if a.text_rotation != 0 {
        out.push_str(&format!(r#" textRotation="{}""#, a.text_rotation));
    }
    if a.wrap_text {
        out.push_str(r#" wrapText="1""#);
    }
    if a.indent != 0 {
        out.push_str(&format!(r#" indent="{}""#, a.indent));
    }
    if a.shrink_to_fit {
        out.push_str(r#" shrinkToFit="1""#);
    }
    out.push_str(&format!("/></{p}xf>"));
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use wolfxl_model::FontPatch;

    use super::*;

    pub(crate) const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><numFmts count="1"><numFmt numFmtId="164" formatCode="0.000"/></numFmts><fonts count="3"><font><sz val="11"/><color theme="1"/><name val="Calibri"/><family val="2"/><scheme val="minor"/></font><font><b/><sz val="11"/><color theme="1"/><name val="Calibri"/><family val="2"/><scheme val="minor"/></font><font><sz val="11"/><color theme="1"/><name val="Calibri"/><family val="2"/><scheme val="minor"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="4"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"/><xf numFmtId="14" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/><xf numFmtId="164" fontId="2" fillId="0" borderId="0" xfId="0"><alignment horizontal="center" wrapText="1"/></xf></cellXfs><cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles><dxfs count="0"/></styleSheet>"#;

    fn pool() -> StylePool {
        StylePool::parse(STYLES.as_bytes()).unwrap()
    }

    #[test]
    fn records_materialize_components() {
        let pool = pool();
        let bold = pool.record(1).unwrap();
        assert!(bold.font.bold);
        assert_eq!(bold.font.size_pt(), Some(11.0));

        let custom = pool.record(3).unwrap();
        assert_eq!(custom.number_format.as_deref(), Some("0.000"));
        assert_eq!(custom.alignment.horizontal, Some(HorizontalAlignment::Center));
        assert!(custom.alignment.wrap_text);

        assert!(pool.is_date_style(2));
        assert!(!pool.is_date_style(3));
        assert_eq!(pool.record(99), None);
    }

    #[test]
    fn equal_styles_resolve_to_existing_records() {
        let mut pool = pool();
        let bold = pool.record(1).unwrap();
        assert_eq!(pool.resolve(&bold).unwrap(), 1);
        // Duplicate font 2 is structurally font 0, so record 3 dedups onto it.
        let custom = pool.record(3).unwrap();
        assert_eq!(pool.resolve(&custom).unwrap(), 3);
        assert!(!pool.is_dirty());
        assert_eq!(pool.snapshot(), pool.original_snapshot());
    }

    #[test]
    fn new_styles_append_once() {
        let mut pool = pool();
        let base = pool.record(0).unwrap();
        let red = base.clone().with_fill(Fill::solid(Color::from_hex("FF0000").unwrap()));
        let first = pool.resolve(&red).unwrap();
        let second = pool.resolve(&red).unwrap();
        assert_eq!(first, 4);
        assert_eq!(first, second);
        assert_eq!(pool.record(first).unwrap(), red);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.fills, 3);
        assert_eq!(snapshot.cell_xfs, 5);
        assert_eq!(snapshot.fonts, 3);
    }

    #[test]
    fn patch_keeps_untouched_components() {
        let mut pool = pool();
        let patched = pool
            .resolve_patch(3, &StylePatch::default().font(FontPatch {
                italic: Some(true),
                ..FontPatch::default()
            }))
            .unwrap();
        let style = pool.record(patched).unwrap();
        assert!(style.font.italic);
        assert_eq!(style.number_format.as_deref(), Some("0.000"));
        assert!(style.alignment.wrap_text);

        // Number format only: built-in code maps to its built-in id.
        let pct = pool
            .resolve_patch(1, &StylePatch::default().number_format("0%"))
            .unwrap();
        assert_eq!(pool.record(pct).unwrap().number_format.as_deref(), Some("0%"));
        assert!(pool.record(pct).unwrap().font.bold);
    }

    #[test]
    fn custom_number_formats_start_after_existing_ids() {
        let mut pool = pool();
        let base = pool.record(0).unwrap();
        let idx = pool.resolve(&base.with_number_format("yyyy-mm-dd")).unwrap();
        assert!(pool.is_date_style(idx));

        let out = String::from_utf8(pool.write(STYLES.as_bytes()).unwrap()).unwrap();
        assert!(out.contains(r#"<numFmts count="2">"#), "{out}");
        assert!(out.contains(r#"<numFmt numFmtId="165" formatCode="yyyy-mm-dd"/>"#), "{out}");
        assert!(out.contains(r#"<cellXfs count="5">"#), "{out}");
    }

    #[test]
    fn regenerated_part_reparses_to_the_same_records() {
        let mut pool = pool();
        let base = pool.record(1).unwrap();
        let style = base
            .with_border(Border::outline(BorderEdge::new(
                BorderStyle::Thin,
                Some(Color::black()),
            )))
            .with_alignment(Alignment {
                vertical: Some(VerticalAlignment::Top),
                indent: 2,
                ..Alignment::default()
            });
        let idx = pool.resolve(&style).unwrap();

        let out = pool.write(STYLES.as_bytes()).unwrap();
        let reparsed = StylePool::parse(&out).unwrap();
        assert_eq!(reparsed.len(), pool.len());
        for i in 0..pool.len() as u32 {
            assert_eq!(reparsed.record(i), pool.record(i), "record {i}");
        }
        assert_eq!(reparsed.record(idx).unwrap(), style);

        let doc_text = String::from_utf8(out).unwrap();
        let doc = roxmltree::Document::parse(&doc_text).unwrap();
        let borders = doc
            .descendants()
            .find(|n| n.has_tag_name("borders"))
            .unwrap();
        assert_eq!(borders.attribute("count"), Some("2"));
    }

    #[test]
    fn missing_num_fmts_table_is_created_before_fonts() {
        let xml = r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="1"><fill><patternFill patternType="none"/></fill></fills><borders count="1"><border/></borders><cellXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/></cellXfs></styleSheet>"#;
        let mut pool = StylePool::parse(xml.as_bytes()).unwrap();
        let base = pool.record(0).unwrap();
        pool.resolve(&base.with_number_format("0.0000")).unwrap();
        let out = String::from_utf8(pool.write(xml.as_bytes()).unwrap()).unwrap();
        let num_fmts = out.find("<numFmts").unwrap();
        let fonts = out.find("<fonts").unwrap();
        assert!(num_fmts < fonts, "{out}");
    }
}
