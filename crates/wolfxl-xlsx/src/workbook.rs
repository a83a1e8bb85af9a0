//! `xl/workbook.xml`: sheet list, defined names, date system, and calc properties.

use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use wolfxl_model::{DateSystem, DefinedName, NameScope, Range, PRINT_AREA_NAME};

use crate::path::resolve_target;
use crate::relationships::{Relationship, SHARED_STRINGS_REL, STYLES_REL, WORKSHEET_REL};
use crate::xml::{attr_value, escape_attr, escape_text, local_name, RELATIONSHIPS_NS};
use crate::XlsxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SheetState {
    #[default]
    Visible,
    Hidden,
    VeryHidden,
}

/// One `<sheet>` entry, with its worksheet part resolved through the workbook relationships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetInfo {
    pub name: String,
    pub sheet_id: u32,
    pub rel_id: String,
    pub state: SheetState,
    pub part: String,
}

#[derive(Debug, Clone, Default)]
pub struct WorkbookInfo {
    pub part: String,
    pub sheets: Vec<SheetInfo>,
    pub defined_names: Vec<DefinedName>,
    pub date_system: DateSystem,
    pub full_calc_on_load: bool,
    pub relationships: Vec<Relationship>,
    pub shared_strings_part: Option<String>,
    pub styles_part: Option<String>,
}

impl WorkbookInfo {
    pub fn sheet(&self, name: &str) -> Option<&SheetInfo> {
        self.sheets
            .iter()
            .find(|s| s.name == name)
            .or_else(|| self.sheets.iter().find(|s| s.name.eq_ignore_ascii_case(name)))
    }

    pub fn sheet_index(&self, name: &str) -> Option<usize> {
        self.sheets.iter().position(|s| s.name.eq_ignore_ascii_case(name))
    }
}

pub fn parse_workbook(
    part: &str,
    xml: &[u8],
    relationships: Vec<Relationship>,
) -> Result<WorkbookInfo, XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut raw_sheets = Vec::new();
    let mut raw_names: Vec<(String, Option<usize>, bool, String)> = Vec::new();
    let mut date_system = DateSystem::Excel1900;
    let mut full_calc_on_load = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                raw_sheets.push(parse_sheet_element(&e)?);
            }
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"workbookPr" => {
                if attr_value(&e, b"date1904")?.is_some_and(|v| is_truthy(&v)) {
                    date_system = DateSystem::Excel1904;
                }
            }
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"calcPr" => {
                full_calc_on_load = attr_value(&e, b"fullCalcOnLoad")?.is_some_and(|v| is_truthy(&v));
            }
            Event::Start(e) if e.local_name().as_ref() == b"definedName" => {
                let name = attr_value(&e, b"name")?.unwrap_or_default();
                let local = attr_value(&e, b"localSheetId")?.and_then(|v| v.parse::<usize>().ok());
                let hidden = attr_value(&e, b"hidden")?.is_some_and(|v| is_truthy(&v));
                let text = crate::xml::read_text(&mut reader, e.name())?;
                raw_names.push((name, local, hidden, text));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut sheets = Vec::with_capacity(raw_sheets.len());
    for (name, sheet_id, rel_id, state) in raw_sheets {
        let rel = relationships
            .iter()
            .find(|r| r.id == rel_id && r.type_uri == WORKSHEET_REL)
            .or_else(|| relationships.iter().find(|r| r.id == rel_id));
        let Some(rel) = rel else {
            return Err(XlsxError::malformed(
                part,
                format!("sheet {name:?} references missing relationship {rel_id}"),
            ));
        };
        sheets.push(SheetInfo {
            part: resolve_target(part, &rel.target),
            name,
            sheet_id,
            rel_id,
            state,
        });
    }

    let mut defined_names = Vec::with_capacity(raw_names.len());
    for (name, local, hidden, text) in raw_names {
        let scope = match local.and_then(|idx| sheets.get(idx)) {
            Some(sheet) => NameScope::Sheet(sheet.name.clone()),
            None => NameScope::Workbook,
        };
        defined_names.push(DefinedName {
            name,
            scope,
            refers_to: text,
            hidden,
        });
    }

    let find_rel = |type_uri: &str| {
        relationships
            .iter()
            .find(|r| r.type_uri == type_uri && !r.is_external())
            .map(|r| resolve_target(part, &r.target))
    };
    let shared_strings_part = find_rel(SHARED_STRINGS_REL);
    let styles_part = find_rel(STYLES_REL);

    Ok(WorkbookInfo {
        part: part.to_string(),
        sheets,
        defined_names,
        date_system,
        full_calc_on_load,
        relationships,
        shared_strings_part,
        styles_part,
    })
}

fn parse_sheet_element(e: &BytesStart<'_>) -> Result<(String, u32, String, SheetState), XlsxError> {
    let mut name = None;
    let mut sheet_id = None;
    let mut rel_id = None;
    let mut state = SheetState::Visible;

    for attr in e.attributes() {
        let attr = attr?;
        let key = attr.key.as_ref();
        let value = attr.unescape_value()?.into_owned();
        match key {
            b"name" => name = Some(value),
            b"sheetId" => sheet_id = value.parse::<u32>().ok(),
            b"state" => {
                state = match value.as_str() {
                    "hidden" => SheetState::Hidden,
                    "veryHidden" => SheetState::VeryHidden,
                    _ => SheetState::Visible,
                }
            }
            _ if local_name(key) == b"id" => rel_id = Some(value),
            _ => {}
        }
    }

    match (name, sheet_id, rel_id) {
        (Some(name), Some(sheet_id), Some(rel_id)) => Ok((name, sheet_id, rel_id, state)),
        _ => Err(XlsxError::malformed(
            "workbook.xml",
            "<sheet> is missing name, sheetId, or r:id",
        )),
    }
}

fn is_truthy(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

/// Quote a sheet name for use in a reference (`'Q1 Data'!A1`).
pub fn quote_sheet_name(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    if plain {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}

/// `refers_to` text for a print area over `ranges` on `sheet`.
pub fn print_area_formula(sheet: &str, ranges: &[Range]) -> String {
    let quoted = quote_sheet_name(sheet);
    ranges
        .iter()
        .map(|r| format!("{quoted}!{}", r.to_absolute_a1()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse print-area `refers_to` text back into ranges. Unparseable areas are skipped.
pub fn parse_print_area(refers_to: &str) -> Vec<Range> {
    split_areas(refers_to)
        .into_iter()
        .filter_map(|area| {
            let reference = match area.rfind('!') {
                Some(idx) => &area[idx + 1..],
                None => area,
            };
            Range::from_a1(reference).ok()
        })
        .collect()
}

fn split_areas(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, c) in text.char_indices() {
        match c {
            '\'' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(text[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    out.push(text[start..].trim());
    out.retain(|s| !s.is_empty());
    out
}

/// A `<sheet>` entry appended by this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NewSheetEntry {
    pub name: String,
    pub sheet_id: u32,
    pub rel_id: String,
}

/// Everything that can change in `workbook.xml`.
#[derive(Debug, Default)]
pub(crate) struct WorkbookRewrite<'a> {
    pub new_sheets: Vec<NewSheetEntry>,
    /// Keyed by [`DefinedName::key`]; `None` removes the name.
    pub names: BTreeMap<(String, NameScope), Option<&'a DefinedName>>,
    /// Sheet names in final order, for `localSheetId`.
    pub sheet_order: Vec<String>,
    pub force_full_calc: bool,
}

impl WorkbookRewrite<'_> {
    pub fn is_noop(&self) -> bool {
        self.new_sheets.is_empty() && self.names.is_empty() && !self.force_full_calc
    }

    fn local_sheet_id(&self, scope: &NameScope) -> Option<usize> {
        match scope {
            NameScope::Workbook => None,
            NameScope::Sheet(sheet) => self
                .sheet_order
                .iter()
                .position(|s| s.eq_ignore_ascii_case(sheet)),
        }
    }

    fn defined_name_xml(&self, name: &DefinedName) -> String {
        let mut out = format!(r#"<definedName name="{}""#, escape_attr(&name.name));
        if let Some(idx) = self.local_sheet_id(&name.scope) {
            out.push_str(&format!(r#" localSheetId="{idx}""#));
        }
        if name.hidden {
            out.push_str(r#" hidden="1""#);
        }
        out.push('>');
        out.push_str(&escape_text(&name.refers_to));
        out.push_str("</definedName>");
        out
    }
}

fn follows_defined_names(local: &[u8]) -> bool {
    matches!(local, b"calcPr") || follows_calc_pr(local)
}

fn follows_calc_pr(local: &[u8]) -> bool {
    matches!(
        local,
        b"oleSize"
            | b"customWorkbookViews"
            | b"pivotCaches"
            | b"smartTagPr"
            | b"smartTagTypes"
            | b"webPublishing"
            | b"fileRecoveryPr"
            | b"webPublishObjects"
            | b"extLst"
    )
}

/// Stream `workbook.xml`, applying `rewrite`. Untouched elements are copied event for event.
pub(crate) fn rewrite_workbook(xml: &[u8], rewrite: &WorkbookRewrite<'_>) -> Result<Vec<u8>, XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 256));

    let mut rel_prefix: Option<String> = None;
    let mut names_pending: BTreeMap<(String, NameScope), &DefinedName> = rewrite
        .names
        .iter()
        .filter_map(|(k, v)| v.map(|v| (k.clone(), v)))
        .collect();
    let mut names_done = rewrite.names.is_empty();
    let mut calc_done = !rewrite.force_full_calc;
    let mut in_defined_names = false;
    let mut kept_names = 0usize;
    let mut names_block: Vec<u8> = Vec::new();
    let mut names_block_start: Option<BytesStart<'static>> = None;

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) if e.local_name().as_ref() == b"workbook" => {
                rel_prefix = relationships_prefix(e)?;
                writer.write_event(event)?;
            }
            Event::Empty(ref e) if e.local_name().as_ref() == b"sheets" => {
                let start = e.to_owned();
                writer.write_event(Event::Start(start.borrow()))?;
                write_new_sheets(&mut writer, rewrite, rel_prefix.as_deref());
                let end = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                writer.write_event(Event::End(quick_xml::events::BytesEnd::new(end)))?;
            }
            Event::End(ref e) if e.local_name().as_ref() == b"sheets" => {
                write_new_sheets(&mut writer, rewrite, rel_prefix.as_deref());
                writer.write_event(event)?;
            }
            Event::Start(ref e) if e.local_name().as_ref() == b"definedNames" => {
                in_defined_names = true;
                names_block.clear();
                kept_names = 0;
                names_block_start = Some(e.to_owned());
            }
            Event::Empty(ref e) if e.local_name().as_ref() == b"definedNames" => {
                write_names_block(&mut writer, rewrite, &mut names_pending, Vec::new(), 0, None)?;
                names_done = true;
            }
            Event::Start(ref e) if in_defined_names && e.local_name().as_ref() == b"definedName" => {
                let name = attr_value(e, b"name")?.unwrap_or_default();
                let local = attr_value(e, b"localSheetId")?.and_then(|v| v.parse::<usize>().ok());
                let scope = match local.and_then(|idx| rewrite.sheet_order.get(idx)) {
                    Some(sheet) => NameScope::Sheet(sheet.clone()),
                    None => NameScope::Workbook,
                };
                let key = (name.to_ascii_lowercase(), scope);

                // Capture the original element so untouched names are copied as-is.
                let mut original = Writer::new(Vec::new());
                original.write_event(Event::Start(e.borrow()))?;
                let mut depth = 1usize;
                while depth > 0 {
                    let inner = reader.read_event()?;
                    match &inner {
                        Event::Start(_) => depth += 1,
                        Event::End(_) => depth -= 1,
                        Event::Eof => {
                            return Err(XlsxError::malformed(
                                "workbook.xml",
                                "unexpected eof in <definedName>",
                            ))
                        }
                        _ => {}
                    }
                    original.write_event(inner)?;
                }

                match rewrite.names.get(&key) {
                    Some(Some(replacement)) => {
                        names_pending.remove(&key);
                        names_block.extend_from_slice(rewrite.defined_name_xml(replacement).as_bytes());
                        kept_names += 1;
                    }
                    Some(None) => {}
                    None => {
                        names_block.extend_from_slice(&original.into_inner());
                        kept_names += 1;
                    }
                }
            }
            Event::End(ref e) if in_defined_names && e.local_name().as_ref() == b"definedNames" => {
                in_defined_names = false;
                let block = std::mem::take(&mut names_block);
                write_names_block(
                    &mut writer,
                    rewrite,
                    &mut names_pending,
                    block,
                    kept_names,
                    names_block_start.take(),
                )?;
                names_done = true;
            }
            _ if in_defined_names => {
                // Whitespace between names.
                if let Event::Text(t) = &event {
                    names_block.extend_from_slice(t.as_ref());
                }
            }
            Event::Start(ref e) | Event::Empty(ref e)
                if !names_done && follows_defined_names(e.local_name().as_ref()) =>
            {
                write_names_block(&mut writer, rewrite, &mut names_pending, Vec::new(), 0, None)?;
                names_done = true;
                let local = e.local_name().as_ref().to_vec();
                write_calc_or_passthrough(&mut writer, &mut reader, event, &local, &mut calc_done)?;
            }
            Event::Start(ref e) | Event::Empty(ref e) => {
                let local = e.local_name().as_ref().to_vec();
                write_calc_or_passthrough(&mut writer, &mut reader, event, &local, &mut calc_done)?;
            }
            Event::End(ref e) if e.local_name().as_ref() == b"workbook" => {
                if !names_done {
                    write_names_block(&mut writer, rewrite, &mut names_pending, Vec::new(), 0, None)?;
                    names_done = true;
                }
                if !calc_done {
                    writer
                        .get_mut()
                        .extend_from_slice(br#"<calcPr fullCalcOnLoad="1"/>"#);
                    calc_done = true;
                }
                writer.write_event(event)?;
            }
            other => writer.write_event(other)?,
        }
    }

    Ok(writer.into_inner())
}

fn write_calc_or_passthrough(
    writer: &mut Writer<Vec<u8>>,
    reader: &mut Reader<&[u8]>,
    event: Event<'_>,
    local: &[u8],
    calc_done: &mut bool,
) -> Result<(), XlsxError> {
    if !*calc_done && local == b"calcPr" {
        let start = match &event {
            Event::Start(e) => Some((e.to_owned(), true)),
            Event::Empty(e) => Some((e.to_owned(), false)),
            _ => None,
        };
        if let Some((start, is_start)) = start {
            writer
                .get_mut()
                .extend_from_slice(&render_calc_pr_with_full_calc_on_load(&start)?);
            if is_start {
                reader.read_to_end(start.name())?;
            }
            *calc_done = true;
            return Ok(());
        }
    }
    if !*calc_done && follows_calc_pr(local) {
        writer
            .get_mut()
            .extend_from_slice(br#"<calcPr fullCalcOnLoad="1"/>"#);
        *calc_done = true;
    }
    writer.write_event(event)?;
    Ok(())
}

fn write_new_sheets(writer: &mut Writer<Vec<u8>>, rewrite: &WorkbookRewrite<'_>, prefix: Option<&str>) {
    for sheet in &rewrite.new_sheets {
        let out = match prefix {
            Some(p) => format!(
                r#"<sheet name="{}" sheetId="{}" {p}:id="{}"/>"#,
                escape_attr(&sheet.name),
                sheet.sheet_id,
                escape_attr(&sheet.rel_id)
            ),
            None => format!(
                r#"<sheet xmlns:r="{RELATIONSHIPS_NS}" name="{}" sheetId="{}" r:id="{}"/>"#,
                escape_attr(&sheet.name),
                sheet.sheet_id,
                escape_attr(&sheet.rel_id)
            ),
        };
        writer.get_mut().extend_from_slice(out.as_bytes());
    }
}

fn write_names_block(
    writer: &mut Writer<Vec<u8>>,
    rewrite: &WorkbookRewrite<'_>,
    pending: &mut BTreeMap<(String, NameScope), &DefinedName>,
    mut block: Vec<u8>,
    mut count: usize,
    start: Option<BytesStart<'static>>,
) -> Result<(), XlsxError> {
    for name in std::mem::take(pending).into_values() {
        block.extend_from_slice(rewrite.defined_name_xml(name).as_bytes());
        count += 1;
    }
    if count == 0 {
        return Ok(());
    }
    let start = start.unwrap_or_else(|| BytesStart::new("definedNames"));
    let end = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    writer.write_event(Event::Start(start.borrow()))?;
    writer.get_mut().extend_from_slice(&block);
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new(end)))?;
    Ok(())
}

fn relationships_prefix(workbook: &BytesStart<'_>) -> Result<Option<String>, XlsxError> {
    for attr in workbook.attributes() {
        let attr = attr?;
        let key = attr.key.as_ref();
        if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            if attr.unescape_value()?.as_ref() == RELATIONSHIPS_NS {
                return Ok(Some(String::from_utf8_lossy(prefix).into_owned()));
            }
        }
    }
    Ok(None)
}

fn render_calc_pr_with_full_calc_on_load(start: &BytesStart<'_>) -> Result<Vec<u8>, XlsxError> {
    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut out = format!("<{tag}");
    let mut has_full = false;
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if local_name(attr.key.as_ref()) == b"fullCalcOnLoad" {
            has_full = true;
            out.push_str(r#" fullCalcOnLoad="1""#);
            continue;
        }
        let value = attr.unescape_value()?.into_owned();
        out.push_str(&format!(r#" {key}="{}""#, escape_attr(&value)));
    }
    if !has_full {
        out.push_str(r#" fullCalcOnLoad="1""#);
    }
    out.push_str("/>");
    Ok(out.into_bytes())
}

/// Built-in name check used by the print-area helpers.
pub fn is_print_area(name: &DefinedName) -> bool {
    name.name.eq_ignore_ascii_case(PRINT_AREA_NAME)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><workbookPr date1904="1"/><sheets><sheet name="Data" sheetId="1" r:id="rId1"/><sheet name="Q1 Summary" sheetId="2" r:id="rId2" state="hidden"/></sheets><definedNames><definedName name="_xlnm.Print_Area" localSheetId="1">'Q1 Summary'!$A$1:$C$9</definedName><definedName name="Rate" comment="keep me">0.07</definedName></definedNames><calcPr calcId="191029"/></workbook>"#;

    fn rels() -> Vec<Relationship> {
        vec![
            Relationship {
                id: "rId1".into(),
                type_uri: WORKSHEET_REL.into(),
                target: "worksheets/sheet1.xml".into(),
                target_mode: None,
            },
            Relationship {
                id: "rId2".into(),
                type_uri: WORKSHEET_REL.into(),
                target: "/xl/worksheets/sheet2.xml".into(),
                target_mode: None,
            },
            Relationship {
                id: "rId3".into(),
                type_uri: SHARED_STRINGS_REL.into(),
                target: "sharedStrings.xml".into(),
                target_mode: None,
            },
        ]
    }

    #[test]
    fn parses_sheets_names_and_settings() {
        let info = parse_workbook("xl/workbook.xml", WORKBOOK.as_bytes(), rels()).unwrap();
        assert_eq!(info.sheets.len(), 2);
        assert_eq!(info.sheets[1].part, "xl/worksheets/sheet2.xml");
        assert_eq!(info.sheets[1].state, SheetState::Hidden);
        assert_eq!(info.date_system, DateSystem::Excel1904);
        assert!(!info.full_calc_on_load);
        assert_eq!(info.shared_strings_part.as_deref(), Some("xl/sharedStrings.xml"));
        assert_eq!(info.styles_part, None);

        let print_area = &info.defined_names[0];
        assert!(is_print_area(print_area));
        assert_eq!(print_area.scope, NameScope::Sheet("Q1 Summary".into()));
        assert_eq!(
            parse_print_area(&print_area.refers_to),
            vec![Range::from_a1("A1:C9").unwrap()]
        );
    }

    #[test]
    fn rewrite_replaces_one_name_and_keeps_the_other_verbatim() {
        let replacement = DefinedName {
            name: PRINT_AREA_NAME.into(),
            scope: NameScope::Sheet("Q1 Summary".into()),
            refers_to: print_area_formula("Q1 Summary", &[Range::from_a1("A1:B2").unwrap()]),
            hidden: false,
        };
        let mut rewrite = WorkbookRewrite {
            sheet_order: vec!["Data".into(), "Q1 Summary".into()],
            ..WorkbookRewrite::default()
        };
        rewrite.names.insert(replacement.key(), Some(&replacement));

        let out = rewrite_workbook(WORKBOOK.as_bytes(), &rewrite).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains(
            r#"<definedName name="_xlnm.Print_Area" localSheetId="1">'Q1 Summary'!$A$1:$B$2</definedName>"#
        ));
        assert!(out.contains(r#"<definedName name="Rate" comment="keep me">0.07</definedName>"#));
        assert!(out.contains(r#"<calcPr calcId="191029"/>"#));
    }

    #[test]
    fn rewrite_adds_sheet_names_and_full_calc() {
        let name = DefinedName::new("Total", NameScope::Workbook, "Data!$B$10").unwrap();
        let mut rewrite = WorkbookRewrite {
            new_sheets: vec![NewSheetEntry {
                name: "Extra".into(),
                sheet_id: 3,
                rel_id: "rId9".into(),
            }],
            sheet_order: vec!["Data".into(), "Q1 Summary".into(), "Extra".into()],
            force_full_calc: true,
            ..WorkbookRewrite::default()
        };
        rewrite.names.insert(name.key(), Some(&name));
        // Remove the existing print area.
        rewrite.names.insert(
            (
                PRINT_AREA_NAME.to_ascii_lowercase(),
                NameScope::Sheet("Q1 Summary".into()),
            ),
            None,
        );

        let out = rewrite_workbook(WORKBOOK.as_bytes(), &rewrite).unwrap();
        let doc_text = String::from_utf8(out).unwrap();
        let doc = roxmltree::Document::parse(&doc_text).unwrap();

        let sheets: Vec<&str> = doc
            .descendants()
            .filter(|n| n.has_tag_name("sheet"))
            .filter_map(|n| n.attribute("name"))
            .collect();
        assert_eq!(sheets, vec!["Data", "Q1 Summary", "Extra"]);

        let names: Vec<&str> = doc
            .descendants()
            .filter(|n| n.has_tag_name("definedName"))
            .filter_map(|n| n.attribute("name"))
            .collect();
        assert_eq!(names, vec!["Rate", "Total"]);

        let calc = doc
            .descendants()
            .find(|n| n.has_tag_name("calcPr"))
            .unwrap();
        assert_eq!(calc.attribute("fullCalcOnLoad"), Some("1"));
        assert_eq!(calc.attribute("calcId"), Some("191029"));
    }

    #[test]
    fn names_block_inserted_before_calc_pr_when_missing() {
        let xml = r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="S" sheetId="1" r:id="rId1"/></sheets><calcPr calcId="1"/></workbook>"#;
        let name = DefinedName::new("X", NameScope::Sheet("S".into()), "S!$A$1").unwrap();
        let mut rewrite = WorkbookRewrite {
            sheet_order: vec!["S".into()],
            ..WorkbookRewrite::default()
        };
        rewrite.names.insert(name.key(), Some(&name));
        let out = String::from_utf8(rewrite_workbook(xml.as_bytes(), &rewrite).unwrap()).unwrap();
        let names_pos = out.find("<definedNames>").unwrap();
        let calc_pos = out.find("<calcPr").unwrap();
        assert!(names_pos < calc_pos, "{out}");
        assert!(out.contains(r#"<definedName name="X" localSheetId="0">S!$A$1</definedName>"#));
    }

    #[test]
    fn sheet_names_are_quoted_when_needed() {
        assert_eq!(quote_sheet_name("Data"), "Data");
        assert_eq!(quote_sheet_name("Q1 Data"), "'Q1 Data'");
        assert_eq!(quote_sheet_name("Bob's"), "'Bob''s'");
        assert_eq!(quote_sheet_name("2024"), "'2024'");
    }
}
