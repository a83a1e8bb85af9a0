//! Flush: turn a [`ChangeSet`] into a new package.
//!
//! Only parts that actually change are regenerated: edited worksheets, the shared string
//! table and style sheet when they grew, and the workbook/relationship/content-type parts
//! when workbook metadata changed. Every other entry is raw-copied in container order
//! without recompression.

mod worksheet;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Seek, Write};
use std::rc::Rc;

use chrono::Timelike;
use wolfxl_model::{
    datetime_to_serial, CellRef, CellValue, DateSystem, DefinedName, Formula, NameScope, Range,
    StylePatch, PRINT_AREA_NAME,
};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::change_set::{ChangeSet, ContentEdit, SheetEdits, StyleEdit};
use crate::options::{OpenOptions, StringPolicy};
use crate::package::Package;
use crate::path::{relative_target, rels_for_part};
use crate::relationships::{
    rewrite_content_types, rewrite_relationships, Relationship, CALC_CHAIN_REL, WORKSHEET_CONTENT_TYPE,
    WORKSHEET_REL,
};
use crate::shared_strings::SharedStringTable;
use crate::sheet::{RawCell, SheetView};
use crate::styles::StylePool;
use crate::workbook::{print_area_formula, NewSheetEntry, SheetInfo, WorkbookInfo, WorkbookRewrite};
use crate::XlsxError;

pub(crate) use worksheet::{patch_worksheet, CachedValue, CellBody, CellWrite, WorksheetPatch};

const DATE_FORMAT: &str = "yyyy-mm-dd";
const DATETIME_FORMAT: &str = "yyyy-mm-dd h:mm:ss";

/// Session state the writer reads. The pools are working copies: the writer appends to
/// them and the session discards them unless it rebases onto the result.
pub(crate) struct FlushInput<'a> {
    pub package: &'a mut Package,
    pub workbook: &'a WorkbookInfo,
    /// Sheets added in this session, in creation order.
    pub new_sheets: &'a [SheetInfo],
    /// Views of every sheet with pending worksheet edits, keyed by sheet name.
    pub views: &'a HashMap<String, Rc<SheetView>>,
    pub strings: Option<SharedStringTable>,
    pub styles: StylePool,
    pub changes: &'a ChangeSet,
    pub options: OpenOptions,
}

/// What a flush did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushSummary {
    pub regenerated: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub raw_copied: usize,
}

/// Per-sheet plan produced from the sheet's edits.
struct SheetPlan {
    patch: WorksheetPatch,
    formula_changed: bool,
}

pub(crate) fn write_package<W: Write + Seek>(
    mut input: FlushInput<'_>,
    output: W,
) -> Result<FlushSummary, XlsxError> {
    let date_system = input.workbook.date_system;
    let mut regenerated: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut appended: Vec<(String, Vec<u8>)> = Vec::new();
    let mut removed: HashSet<String> = HashSet::new();
    let mut formula_changed = false;

    // Worksheets first: they feed the string table and style pool.
    let sheets: Vec<&SheetInfo> = input
        .workbook
        .sheets
        .iter()
        .chain(input.new_sheets.iter())
        .collect();
    for info in &sheets {
        let is_new = input.new_sheets.iter().any(|s| s.part == info.part);
        let edits = input
            .changes
            .sheet(&info.name)
            .filter(|e| e.touches_worksheet());

        let Some(edits) = edits else {
            if is_new {
                appended.push((info.part.clone(), crate::blank::worksheet_xml().into_bytes()));
            }
            continue;
        };
        let view = input
            .views
            .get(&info.name)
            .ok_or_else(|| XlsxError::UnknownSheet(info.name.clone()))?;

        let plan = plan_sheet(
            view,
            edits,
            input.strings.as_mut(),
            &mut input.styles,
            input.options.strings,
            date_system,
        )?;
        formula_changed |= plan.formula_changed;
        let xml = patch_worksheet(view.xml(), &plan.patch)?;
        if is_new {
            appended.push((info.part.clone(), xml));
        } else {
            regenerated.insert(entry_name(input.package, &info.part)?, xml);
        }
    }

    if input.styles.is_dirty() {
        let part = input.workbook.styles_part.as_deref().ok_or_else(|| {
            XlsxError::InvalidEdit("package has no styles part to add cell formats to".into())
        })?;
        let original = input.package.read_required_part(part)?;
        regenerated.insert(entry_name(input.package, part)?, input.styles.write(&original)?);
    }

    if let (Some(strings), Some(part)) = (&input.strings, &input.workbook.shared_strings_part) {
        if strings.is_dirty() {
            let original = input.package.read_required_part(part)?;
            regenerated.insert(entry_name(input.package, part)?, strings.write(&original)?);
        }
    }

    let recalc = input.options.recalc;
    let calc_chain = if formula_changed && recalc.drop_calc_chain_on_formula_change {
        calc_chain_part(input.package, input.workbook)
    } else {
        None
    };
    if let Some(part) = &calc_chain {
        removed.insert(part.clone());
    }

    // Workbook-level metadata.
    let print_areas = print_area_names(input.changes, &sheets);
    let mut names: BTreeMap<(String, NameScope), Option<&DefinedName>> = input
        .changes
        .defined_names()
        .iter()
        .map(|(k, v)| (k.clone(), v.as_ref()))
        .collect();
    for (key, name) in &print_areas {
        names.insert(key.clone(), name.as_ref());
    }

    let rewrite = WorkbookRewrite {
        new_sheets: input
            .new_sheets
            .iter()
            .map(|s| NewSheetEntry {
                name: s.name.clone(),
                sheet_id: s.sheet_id,
                rel_id: s.rel_id.clone(),
            })
            .collect(),
        names,
        sheet_order: sheets.iter().map(|s| s.name.clone()).collect(),
        force_full_calc: formula_changed
            && recalc.force_full_calc_on_formula_change
            && !input.workbook.full_calc_on_load,
    };
    if !rewrite.is_noop() {
        let part = &input.workbook.part;
        let original = input.package.read_required_part(part)?;
        regenerated.insert(
            entry_name(input.package, part)?,
            crate::workbook::rewrite_workbook(&original, &rewrite)?,
        );
    }

    if !input.new_sheets.is_empty() || calc_chain.is_some() {
        let wb_part = &input.workbook.part;
        let rels_part = rels_for_part(wb_part);
        let add: Vec<Relationship> = input
            .new_sheets
            .iter()
            .map(|s| Relationship {
                id: s.rel_id.clone(),
                type_uri: WORKSHEET_REL.to_string(),
                target: relative_target(wb_part, &s.part),
                target_mode: None,
            })
            .collect();
        let original = input.package.read_required_part(&rels_part)?;
        let drop_calc_chain = calc_chain.is_some();
        let rels = rewrite_relationships(
            &original,
            |r| drop_calc_chain && r.type_uri == CALC_CHAIN_REL,
            &add,
        )?;
        regenerated.insert(entry_name(input.package, &rels_part)?, rels);

        let add_types: Vec<(String, String)> = input
            .new_sheets
            .iter()
            .map(|s| (s.part.clone(), WORKSHEET_CONTENT_TYPE.to_string()))
            .collect();
        let remove_types: Vec<String> = calc_chain.iter().cloned().collect();
        let original = input.package.read_required_part("[Content_Types].xml")?;
        let types = rewrite_content_types(&original, &remove_types, &add_types)?;
        regenerated.insert(entry_name(input.package, "[Content_Types].xml")?, types);
    }

    log::debug!(
        "flush plan: {} regenerated, {} added, {} removed",
        regenerated.len(),
        appended.len(),
        removed.len()
    );
    emit(input.package, output, regenerated, appended, removed)
}

/// Actual entry name of `part` in the container.
fn entry_name(package: &Package, part: &str) -> Result<String, XlsxError> {
    package
        .find_part(part)
        .map(str::to_string)
        .ok_or_else(|| XlsxError::MissingPart(part.to_string()))
}

fn calc_chain_part(package: &Package, workbook: &WorkbookInfo) -> Option<String> {
    let from_rels = workbook
        .relationships
        .iter()
        .find(|r| r.type_uri == CALC_CHAIN_REL && !r.is_external())
        .map(|r| crate::path::resolve_target(&workbook.part, &r.target));
    from_rels
        .or_else(|| Some("xl/calcChain.xml".to_string()))
        .and_then(|part| package.find_part(&part).map(str::to_string))
}

/// `_xlnm.Print_Area` replacements for sheets whose print area was set or removed.
fn print_area_names(
    changes: &ChangeSet,
    sheets: &[&SheetInfo],
) -> Vec<((String, NameScope), Option<DefinedName>)> {
    sheets
        .iter()
        .filter_map(|info| {
            let area = changes.sheet(&info.name)?.print_area.as_ref()?;
            let scope = NameScope::Sheet(info.name.clone());
            let key = (PRINT_AREA_NAME.to_ascii_lowercase(), scope.clone());
            let name = area.as_ref().filter(|ranges| !ranges.is_empty()).map(|ranges| DefinedName {
                name: PRINT_AREA_NAME.to_string(),
                scope,
                refers_to: print_area_formula(&info.name, ranges),
                hidden: false,
            });
            Some((key, name))
        })
        .collect()
}

fn emit<W: Write + Seek>(
    package: &mut Package,
    output: W,
    mut regenerated: BTreeMap<String, Vec<u8>>,
    appended: Vec<(String, Vec<u8>)>,
    removed: HashSet<String>,
) -> Result<FlushSummary, XlsxError> {
    let mut zip = ZipWriter::new(output);
    let options = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);
    let mut summary = FlushSummary::default();

    let entries = package.entries().to_vec();
    let archive = package.archive_mut();
    for (i, entry) in entries.iter().enumerate() {
        if removed.contains(&entry.name) {
            summary.removed.push(entry.name.clone());
            continue;
        }
        if let Some(bytes) = regenerated.remove(&entry.name) {
            zip.start_file(entry.name.clone(), options)?;
            zip.write_all(&bytes)?;
            summary.regenerated.push(entry.name.clone());
            continue;
        }
        // Unchanged: copy the compressed bytes as they are.
        zip.raw_copy_file(archive.by_index_raw(i)?)?;
        summary.raw_copied += 1;
    }

    for (name, bytes) in appended {
        zip.start_file(name.clone(), options)?;
        zip.write_all(&bytes)?;
        summary.added.push(name);
    }

    zip.finish()?;
    log::debug!(
        "flush wrote {} regenerated, {} added, {} raw-copied parts",
        summary.regenerated.len(),
        summary.added.len(),
        summary.raw_copied
    );
    Ok(summary)
}

/// How a string value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringForm {
    Shared,
    Inline,
    Str,
}

fn string_form(
    policy: StringPolicy,
    existing: Option<&RawCell>,
    view: &SheetView,
    has_table: bool,
) -> StringForm {
    let shared_if_possible = if has_table { StringForm::Shared } else { StringForm::Inline };
    match policy {
        StringPolicy::PreferInline => StringForm::Inline,
        StringPolicy::PreferShared => shared_if_possible,
        StringPolicy::MatchPart => match existing.and_then(|c| c.cell_type.as_deref()) {
            Some("s") => shared_if_possible,
            Some("inlineStr") => StringForm::Inline,
            Some("str") if existing.is_some_and(|c| c.formula.is_none()) => StringForm::Str,
            _ if view.uses_inline_strings() && !view.uses_shared_strings() => StringForm::Inline,
            _ => shared_if_possible,
        },
    }
}

fn plan_sheet(
    view: &SheetView,
    edits: &SheetEdits,
    mut strings: Option<&mut SharedStringTable>,
    styles: &mut StylePool,
    policy: StringPolicy,
    date_system: DateSystem,
) -> Result<SheetPlan, XlsxError> {
    let mut patch = WorksheetPatch::default();
    let mut formula_changed = false;
    let mut count_delta = 0i64;

    for (cell, edit) in edits.cells() {
        let existing = view.raw_cell(cell)?;
        let base_style = existing.as_ref().map_or(0, |c| c.style);
        let mut style = match &edit.style {
            None => base_style,
            Some(StyleEdit::Replace(s)) => styles.resolve(s)?,
            Some(StyleEdit::Patch(p)) => styles.resolve_patch(base_style, p)?,
        };

        let body = match &edit.content {
            None if existing.is_some() => CellBody::Keep,
            None => CellBody::Clear,
            Some(content) => {
                let value = content.as_value();
                let was_formula = existing.as_ref().is_some_and(|c| c.formula.is_some());
                formula_changed |= was_formula || value.is_formula();

                if let Some(dt) = date_of(&value) {
                    if !styles.is_date_style(style) {
                        let code = if dt.time().num_seconds_from_midnight() == 0 {
                            DATE_FORMAT
                        } else {
                            DATETIME_FORMAT
                        };
                        style = styles.resolve_patch(style, &StylePatch::default().number_format(code))?;
                    }
                }

                let form = string_form(policy, existing.as_ref(), view, strings.is_some());
                let body = content_body(&value, form, strings.as_deref_mut(), date_system)?;

                let was_shared = existing.as_ref().is_some_and(|c| c.cell_type.as_deref() == Some("s"));
                let is_shared = matches!(body, CellBody::Shared(_));
                count_delta += i64::from(is_shared) - i64::from(was_shared);
                body
            }
        };
        patch.push(cell, CellWrite { style, body });
    }

    if let Some(table) = strings.as_deref_mut() {
        table.adjust_count(count_delta);
    }

    if let (Some(dim), Some(bounds)) = (view.dimension(), edits.content_bounds()) {
        // A placeholder `A1` on a sheet without cells is replaced, not widened.
        let widened = if dim.is_single_cell() && view.max_row().is_none() {
            bounds
        } else {
            dim.union(&bounds)
        };
        if widened != dim {
            patch.dimension = Some(widened);
        }
    }
    patch.merges = edits.merges.clone();
    patch.freeze_panes = edits.freeze_panes;

    Ok(SheetPlan {
        patch,
        formula_changed,
    })
}

/// The date a value will be stored as a serial for, if any.
fn date_of(value: &CellValue) -> Option<chrono::NaiveDateTime> {
    match value {
        CellValue::DateTime(dt) => Some(*dt),
        CellValue::Formula(Formula { cached: Some(cached), .. }) => match cached.as_ref() {
            CellValue::DateTime(dt) => Some(*dt),
            _ => None,
        },
        _ => None,
    }
}

fn content_body(
    value: &CellValue,
    form: StringForm,
    strings: Option<&mut SharedStringTable>,
    date_system: DateSystem,
) -> Result<CellBody, XlsxError> {
    Ok(match value {
        CellValue::Empty => CellBody::Clear,
        CellValue::Number(n) => CellBody::Number(*n),
        CellValue::DateTime(dt) => CellBody::Number(datetime_to_serial(*dt, date_system)),
        CellValue::Boolean(b) => CellBody::Bool(*b),
        CellValue::Error(e) => CellBody::Error(e.to_string()),
        CellValue::String(s) => match (form, strings) {
            (StringForm::Shared, Some(table)) => {
                let idx = table.resolve(s);
                table.verify(idx, s)?;
                CellBody::Shared(idx)
            }
            (StringForm::Str, _) => CellBody::Str(s.clone()),
            _ => CellBody::Inline(s.clone()),
        },
        CellValue::Formula(f) => CellBody::Formula {
            text: f.text.clone(),
            cached: f.cached.as_deref().and_then(|c| cached_value(c, date_system)),
        },
    })
}

fn cached_value(value: &CellValue, date_system: DateSystem) -> Option<CachedValue> {
    match value {
        CellValue::Number(n) => Some(CachedValue::Number(*n)),
        CellValue::DateTime(dt) => Some(CachedValue::Number(datetime_to_serial(*dt, date_system))),
        CellValue::Boolean(b) => Some(CachedValue::Bool(*b)),
        CellValue::Error(e) => Some(CachedValue::Error(e.to_string())),
        CellValue::String(s) => Some(CachedValue::Str(s.clone())),
        CellValue::Empty | CellValue::Formula(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::change_set::ChangeSet;

    const SHEET: &str = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><dimension ref="A1:B2"/><sheetData><row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1"><f>1+1</f><v>2</v></c></row><row r="2"><c r="A2" s="1"><v>5</v></c></row></sheetData></worksheet>"#;
    const STYLES: &str = r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border/></borders><cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="14" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/></cellXfs></styleSheet>"#;
    const SST: &str = r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="1" uniqueCount="1"><si><t>old</t></si></sst>"#;

    fn fixtures() -> (SheetView, StylePool, SharedStringTable) {
        (
            SheetView::parse("xl/worksheets/sheet1.xml", SHEET.as_bytes().to_vec()).unwrap(),
            StylePool::parse(STYLES.as_bytes()).unwrap(),
            SharedStringTable::parse(SST.as_bytes()).unwrap(),
        )
    }

    fn cell(a1: &str) -> CellRef {
        CellRef::from_a1(a1).unwrap()
    }

    fn write_of(plan: &SheetPlan, a1: &str) -> CellWrite {
        let c = cell(a1);
        plan.patch.rows[&c.row]
            .iter()
            .find(|(col, _)| *col == c.col)
            .map(|(_, w)| w.clone())
            .unwrap()
    }

    #[test]
    fn strings_follow_the_part_and_count_is_tracked() {
        let (view, mut styles, mut sst) = fixtures();
        let mut changes = ChangeSet::new();
        changes.set_content("S", cell("A1"), ContentEdit::Value("old".into()));
        changes.set_content("S", cell("C3"), ContentEdit::Value("new".into()));
        let plan = plan_sheet(
            &view,
            changes.sheet("S").unwrap(),
            Some(&mut sst),
            &mut styles,
            StringPolicy::MatchPart,
            DateSystem::Excel1900,
        )
        .unwrap();

        assert_eq!(write_of(&plan, "A1").body, CellBody::Shared(0));
        assert_eq!(write_of(&plan, "C3").body, CellBody::Shared(1));
        assert_eq!(sst.appended(), ["new".to_string()]);
        assert_eq!(plan.patch.dimension, Some(Range::from_a1("A1:C3").unwrap()));
        assert!(!plan.formula_changed);

        let out = String::from_utf8(sst.write(SST.as_bytes()).unwrap()).unwrap();
        assert!(out.contains(r#"count="2""#), "{out}");
    }

    #[test]
    fn overwriting_a_formula_is_a_formula_change() {
        let (view, mut styles, mut sst) = fixtures();
        let mut changes = ChangeSet::new();
        changes.set_content("S", cell("B1"), ContentEdit::Value(3.0.into()));
        let plan = plan_sheet(
            &view,
            changes.sheet("S").unwrap(),
            Some(&mut sst),
            &mut styles,
            StringPolicy::MatchPart,
            DateSystem::Excel1900,
        )
        .unwrap();
        assert!(plan.formula_changed);
        assert_eq!(plan.patch.dimension, None);
    }

    #[test]
    fn dates_get_a_date_format_unless_they_have_one() {
        let (view, mut styles, _) = fixtures();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut changes = ChangeSet::new();
        changes.set_content("S", cell("A2"), ContentEdit::Value(date.into()));
        changes.set_content("S", cell("B2"), ContentEdit::Value(date.into()));
        let plan = plan_sheet(
            &view,
            changes.sheet("S").unwrap(),
            None,
            &mut styles,
            StringPolicy::MatchPart,
            DateSystem::Excel1900,
        )
        .unwrap();

        // A2 already has numFmt 14.
        assert_eq!(write_of(&plan, "A2").style, 1);
        let b2 = write_of(&plan, "B2");
        assert_eq!(b2.body, CellBody::Number(45352.0));
        assert!(styles.is_date_style(b2.style));
        assert_eq!(styles.record(b2.style).unwrap().number_format.as_deref(), Some(DATE_FORMAT));
    }

    #[test]
    fn no_table_means_inline() {
        let (view, mut styles, _) = fixtures();
        let mut changes = ChangeSet::new();
        changes.set_content("S", cell("D1"), ContentEdit::Value("x".into()));
        let plan = plan_sheet(
            &view,
            changes.sheet("S").unwrap(),
            None,
            &mut styles,
            StringPolicy::MatchPart,
            DateSystem::Excel1900,
        )
        .unwrap();
        assert_eq!(write_of(&plan, "D1").body, CellBody::Inline("x".into()));
    }
}
