//! Caller-facing session over one package.
//!
//! Reads are served lazily from the package and overlay whatever is queued in the
//! [`ChangeSet`]. Writes are validated when they are made and only touch the change
//! set; nothing reaches disk until [`Session::flush`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{Seek, Write};
use std::path::Path;
use std::rc::Rc;

use wolfxl_model::{
    CellRef, CellValue, DefinedName, Formula, IntoCellRef, NameScope, Range, Style, StylePatch,
    EXCEL_MAX_COLS, EXCEL_MAX_ROWS, PRINT_AREA_NAME,
};

use crate::change_set::{ChangeSet, ContentEdit, StyleEdit};
use crate::options::OpenOptions;
use crate::package::Package;
use crate::patch::{self, FlushInput, FlushSummary};
use crate::path::{rels_for_part, resolve_target};
use crate::relationships::{
    next_relationship_id, parse_relationships, Relationship, OFFICE_DOCUMENT_REL, WORKSHEET_REL,
};
use crate::shared_strings::SharedStringTable;
use crate::sheet::{SheetView, ValueContext};
use crate::styles::StylePool;
use crate::workbook::{is_print_area, parse_print_area, parse_workbook, SheetInfo, SheetState, WorkbookInfo};
use crate::XlsxError;

/// Longest string a cell can hold.
const MAX_CELL_TEXT: usize = 32_767;
const MAX_SHEET_NAME: usize = 31;

const EMPTY_STYLES: &[u8] =
    br#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"/>"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Reads only. Writes fail with [`XlsxError::ReadOnly`].
    ReadOnly,
    /// Surgical modify of an existing package.
    Modify,
    /// A fresh workbook seeded from a blank package.
    WriteOnly,
}

/// One cell as read through a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub coordinate: CellRef,
    pub value: CellValue,
    /// Style index as stored in the worksheet. A pending style edit gets its index at
    /// flush time; see [`Session::cell_style`] for the effective record.
    pub style_index: u32,
    /// Shared string index when the stored cell references the string table.
    pub shared_string: Option<u32>,
}

struct Loaded {
    package: RefCell<Package>,
    workbook: WorkbookInfo,
    /// Sheets added since the last flush, in creation order.
    new_sheets: Vec<SheetInfo>,
    /// Parsed sheet views keyed by sheet name as spelled in the workbook.
    views: RefCell<HashMap<String, Rc<SheetView>>>,
    strings: Option<SharedStringTable>,
    styles: StylePool,
}

impl Loaded {
    fn from_package(mut package: Package) -> Result<Self, XlsxError> {
        let workbook_part = workbook_part(&mut package)?;
        let relationships = match package.read_part(&rels_for_part(&workbook_part))? {
            Some(xml) => parse_relationships(&xml)?,
            None => Vec::new(),
        };
        let xml = package.read_required_part(&workbook_part)?;
        let workbook = parse_workbook(&workbook_part, &xml, relationships)?;

        for sheet in &workbook.sheets {
            if package.has_part(&sheet.part) {
                package.promote_to_managed(&sheet.part);
            } else {
                log::warn!("sheet {:?} points at missing part {}", sheet.name, sheet.part);
            }
        }

        let strings = match &workbook.shared_strings_part {
            Some(part) => match package.read_part(part)? {
                Some(xml) => Some(SharedStringTable::parse(&xml)?),
                None => {
                    log::warn!("shared strings relationship points at missing part {part}");
                    None
                }
            },
            None => None,
        };
        let styles = match &workbook.styles_part {
            Some(part) => match package.read_part(part)? {
                Some(xml) => StylePool::parse(&xml)?,
                None => {
                    log::warn!("styles relationship points at missing part {part}");
                    StylePool::parse(EMPTY_STYLES)?
                }
            },
            None => StylePool::parse(EMPTY_STYLES)?,
        };

        log::debug!(
            "loaded workbook {} with {} sheets and {} defined names",
            workbook.part,
            workbook.sheets.len(),
            workbook.defined_names.len()
        );
        Ok(Self {
            package: RefCell::new(package),
            workbook,
            new_sheets: Vec::new(),
            views: RefCell::new(HashMap::new()),
            strings,
            styles,
        })
    }

    fn sheet(&self, name: &str) -> Result<&SheetInfo, XlsxError> {
        self.workbook
            .sheet(name)
            .or_else(|| self.new_sheets.iter().find(|s| s.name == name))
            .or_else(|| self.new_sheets.iter().find(|s| s.name.eq_ignore_ascii_case(name)))
            .ok_or_else(|| XlsxError::UnknownSheet(name.to_string()))
    }

    fn all_sheets(&self) -> impl Iterator<Item = &SheetInfo> + '_ {
        self.workbook.sheets.iter().chain(self.new_sheets.iter())
    }

    /// View of the sheet named exactly `name`, parsing its part on first use.
    fn view(&self, name: &str) -> Result<Rc<SheetView>, XlsxError> {
        if let Some(view) = self.views.borrow().get(name) {
            return Ok(Rc::clone(view));
        }
        let part = self.sheet(name)?.part.clone();
        let xml = self.package.borrow_mut().read_required_part(&part)?;
        let view = Rc::new(SheetView::parse(&part, xml)?);
        self.views
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&view));
        Ok(view)
    }

    fn value_context(&self) -> ValueContext<'_> {
        ValueContext {
            strings: self.strings.as_ref(),
            styles: Some(&self.styles),
            date_system: self.workbook.date_system,
        }
    }
}

/// Workbook part named by the root relationships, else the conventional location.
fn workbook_part(package: &mut Package) -> Result<String, XlsxError> {
    if let Some(xml) = package.read_part("_rels/.rels")? {
        let office_document = parse_relationships(&xml)?
            .into_iter()
            .find(|r| r.type_uri == OFFICE_DOCUMENT_REL && !r.is_external());
        if let Some(rel) = office_document {
            let part = resolve_target("", &rel.target);
            if package.has_part(&part) {
                return Ok(part);
            }
            log::warn!("officeDocument relationship points at missing part {part}");
        }
    }
    Ok("xl/workbook.xml".to_string())
}

/// An open package plus the edits queued against it.
pub struct Session {
    mode: SessionMode,
    options: OpenOptions,
    /// `None` once closed.
    loaded: Option<Loaded>,
    changes: ChangeSet,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("closed", &self.loaded.is_none())
            .field("changes", &self.changes)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, XlsxError> {
        Self::open_with(path, false, OpenOptions::default())
    }

    /// Open `path` for surgical modification.
    pub fn open_modify(path: impl AsRef<Path>) -> Result<Self, XlsxError> {
        Self::open_with(path, true, OpenOptions::default())
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        modify: bool,
        options: OpenOptions,
    ) -> Result<Self, XlsxError> {
        let package = Package::open(path, options.limits)?;
        Self::with_package(package, modify, options)
    }

    /// Open an in-memory package.
    pub fn from_bytes(bytes: Vec<u8>, modify: bool, options: OpenOptions) -> Result<Self, XlsxError> {
        let package = Package::from_bytes(bytes, options.limits)?;
        Self::with_package(package, modify, options)
    }

    /// A write-only session over a blank one-sheet workbook.
    pub fn new() -> Result<Self, XlsxError> {
        Self::new_with(OpenOptions::default())
    }

    pub fn new_with(options: OpenOptions) -> Result<Self, XlsxError> {
        let package = Package::from_bytes(crate::blank::blank_package()?, options.limits)?;
        Ok(Self {
            mode: SessionMode::WriteOnly,
            options,
            loaded: Some(Loaded::from_package(package)?),
            changes: ChangeSet::new(),
        })
    }

    fn with_package(package: Package, modify: bool, options: OpenOptions) -> Result<Self, XlsxError> {
        let mode = if modify {
            SessionMode::Modify
        } else {
            SessionMode::ReadOnly
        };
        Ok(Self {
            mode,
            options,
            loaded: Some(Loaded::from_package(package)?),
            changes: ChangeSet::new(),
        })
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn options(&self) -> OpenOptions {
        self.options
    }

    pub fn is_closed(&self) -> bool {
        self.loaded.is_none()
    }

    /// Edits queued since the last successful flush.
    pub fn change_set(&self) -> &ChangeSet {
        &self.changes
    }

    fn loaded(&self) -> Result<&Loaded, XlsxError> {
        self.loaded.as_ref().ok_or(XlsxError::Closed)
    }

    fn ensure_writable(&self) -> Result<&Loaded, XlsxError> {
        let loaded = self.loaded()?;
        if self.mode == SessionMode::ReadOnly {
            return Err(XlsxError::ReadOnly);
        }
        Ok(loaded)
    }

    /// Canonical sheet name and the parsed cell reference.
    fn target(&self, sheet: &str, cell: impl IntoCellRef) -> Result<(String, CellRef), XlsxError> {
        let name = self.loaded()?.sheet(sheet)?.name.clone();
        Ok((name, cell.into_cell_ref()?))
    }

    // ---- reads ----

    /// Sheet names in workbook order, including sheets added in this session.
    pub fn sheet_names(&self) -> Result<Vec<String>, XlsxError> {
        Ok(self.loaded()?.all_sheets().map(|s| s.name.clone()).collect())
    }

    pub fn get(&self, sheet: &str, cell: impl IntoCellRef) -> Result<Cell, XlsxError> {
        let (name, coordinate) = self.target(sheet, cell)?;
        let loaded = self.loaded()?;
        let view = loaded.view(&name)?;

        let mut out = Cell {
            coordinate,
            value: CellValue::Empty,
            style_index: 0,
            shared_string: None,
        };
        if let Some(raw) = view.raw_cell(coordinate)? {
            out.value = view.value_of(coordinate, &raw, loaded.value_context())?;
            out.style_index = raw.style;
            out.shared_string = raw.shared_string();
        }

        let pending = self
            .changes
            .sheet(&name)
            .and_then(|edits| edits.cell(coordinate))
            .and_then(|edit| edit.content.as_ref());
        if let Some(content) = pending {
            out.value = content.as_value();
            out.shared_string = None;
        }
        Ok(out)
    }

    pub fn value(&self, sheet: &str, cell: impl IntoCellRef) -> Result<CellValue, XlsxError> {
        Ok(self.get(sheet, cell)?.value)
    }

    /// Effective format of a cell, including a pending style edit.
    pub fn cell_style(&self, sheet: &str, cell: impl IntoCellRef) -> Result<Style, XlsxError> {
        let (name, coordinate) = self.target(sheet, cell)?;
        let loaded = self.loaded()?;
        let index = loaded
            .view(&name)?
            .raw_cell(coordinate)?
            .map(|raw| raw.style)
            .unwrap_or(0);
        let current = loaded.styles.record(index).unwrap_or_else(|| {
            log::warn!("{name}!{coordinate} uses style {index}, past the end of cellXfs");
            Style::default()
        });

        let pending = self
            .changes
            .sheet(&name)
            .and_then(|edits| edits.cell(coordinate))
            .and_then(|edit| edit.style.as_ref());
        Ok(match pending {
            Some(edit) => edit.apply(&current),
            None => current,
        })
    }

    /// Rows of `range` (the sheet's dimensions when `None`), every cell included.
    pub fn iter_rows(&self, sheet: &str, range: Option<Range>) -> Result<RowIter<'_>, XlsxError> {
        let name = self.loaded()?.sheet(sheet)?.name.clone();
        let range = match range {
            Some(range) => Some(range),
            None => self.dimensions(&name)?,
        };
        Ok(RowIter {
            session: self,
            sheet: name,
            next_row: range.map(|r| r.start.row).unwrap_or(1),
            range,
        })
    }

    /// Used range of the sheet, widened by pending content.
    pub fn dimensions(&self, sheet: &str) -> Result<Option<Range>, XlsxError> {
        let loaded = self.loaded()?;
        let name = &loaded.sheet(sheet)?.name;
        let stored = loaded.view(name)?.used_range()?;

        let pending = self.changes.sheet(name).and_then(|edits| edits.content_bounds());
        Ok(match (stored, pending) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        })
    }

    /// Last used row, or 0 for an empty sheet.
    pub fn max_row(&self, sheet: &str) -> Result<u32, XlsxError> {
        let loaded = self.loaded()?;
        let name = &loaded.sheet(sheet)?.name;
        let stored = loaded.view(name)?.max_row().unwrap_or(0);
        let pending = self
            .changes
            .sheet(name)
            .and_then(|edits| edits.content_bounds())
            .map(|bounds| bounds.end.row)
            .unwrap_or(0);
        Ok(stored.max(pending))
    }

    /// Last used column, or 0 for an empty sheet.
    pub fn max_column(&self, sheet: &str) -> Result<u32, XlsxError> {
        Ok(self.dimensions(sheet)?.map(|r| r.end.col).unwrap_or(0))
    }

    pub fn merged_ranges(&self, sheet: &str) -> Result<Vec<Range>, XlsxError> {
        let loaded = self.loaded()?;
        let name = &loaded.sheet(sheet)?.name;
        if let Some(merges) = self.changes.sheet(name).and_then(|e| e.merges.as_ref()) {
            return Ok(merges.clone());
        }
        Ok(loaded.view(name)?.merges().to_vec())
    }

    pub fn print_area(&self, sheet: &str) -> Result<Option<Vec<Range>>, XlsxError> {
        let loaded = self.loaded()?;
        let name = loaded.sheet(sheet)?.name.clone();
        if let Some(area) = self.changes.sheet(&name).and_then(|e| e.print_area.as_ref()) {
            return Ok(area.clone());
        }
        let scope = NameScope::Sheet(name);
        Ok(self
            .defined_names()?
            .into_iter()
            .find(|n| is_print_area(n) && n.scope == scope)
            .map(|n| parse_print_area(&n.refers_to))
            .filter(|ranges| !ranges.is_empty()))
    }

    /// Top-left cell of the scrollable pane when rows or columns are frozen.
    pub fn freeze_panes(&self, sheet: &str) -> Result<Option<CellRef>, XlsxError> {
        let loaded = self.loaded()?;
        let name = &loaded.sheet(sheet)?.name;
        if let Some(pane) = self.changes.sheet(name).and_then(|e| e.freeze_panes) {
            return Ok(pane);
        }
        Ok(loaded.view(name)?.freeze_panes())
    }

    /// Defined names as they will be after the next flush.
    pub fn defined_names(&self) -> Result<Vec<DefinedName>, XlsxError> {
        let loaded = self.loaded()?;
        let pending = self.changes.defined_names();

        let mut names: Vec<DefinedName> = loaded
            .workbook
            .defined_names
            .iter()
            .filter(|n| !pending.contains_key(&n.key()))
            .cloned()
            .collect();
        names.extend(pending.values().flatten().cloned());

        for info in loaded.all_sheets() {
            let Some(area) = self.changes.sheet(&info.name).and_then(|e| e.print_area.as_ref()) else {
                continue;
            };
            let scope = NameScope::Sheet(info.name.clone());
            names.retain(|n| !(is_print_area(n) && n.scope == scope));
            if let Some(ranges) = area {
                names.push(DefinedName {
                    name: PRINT_AREA_NAME.to_string(),
                    scope,
                    refers_to: crate::workbook::print_area_formula(&info.name, ranges),
                    hidden: false,
                });
            }
        }
        Ok(names)
    }

    // ---- writes ----

    /// Queue a value. A [`CellValue::Formula`] is queued as a formula edit.
    pub fn set_value(
        &mut self,
        sheet: &str,
        cell: impl IntoCellRef,
        value: impl Into<CellValue>,
    ) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        let (name, cell) = self.target(sheet, cell)?;
        let value = value.into();
        validate_value(&value)?;
        self.reject_group_anchor(&name, cell)?;

        let content = match value {
            CellValue::Formula(formula) => ContentEdit::Formula(formula),
            other => ContentEdit::Value(other),
        };
        self.changes.set_content(&name, cell, content);
        Ok(())
    }

    /// Shorthand for [`Session::set_value`].
    pub fn set(
        &mut self,
        sheet: &str,
        cell: impl IntoCellRef,
        value: impl Into<CellValue>,
    ) -> Result<(), XlsxError> {
        self.set_value(sheet, cell, value)
    }

    /// Queue a formula (with or without a leading `=`) and an optional cached result.
    pub fn set_formula(
        &mut self,
        sheet: &str,
        cell: impl IntoCellRef,
        text: &str,
        cached: Option<CellValue>,
    ) -> Result<(), XlsxError> {
        let mut formula = Formula::new(text);
        if let Some(cached) = cached {
            formula = formula.with_cached(cached);
        }
        self.set_value(sheet, cell, CellValue::Formula(formula))
    }

    /// Replace the cell's whole format.
    pub fn set_style(&mut self, sheet: &str, cell: impl IntoCellRef, style: Style) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        let (name, cell) = self.target(sheet, cell)?;
        self.changes.set_style(&name, cell, StyleEdit::Replace(style));
        Ok(())
    }

    /// Overlay the given components on the cell's current format.
    pub fn patch_style(
        &mut self,
        sheet: &str,
        cell: impl IntoCellRef,
        patch: StylePatch,
    ) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        let (name, cell) = self.target(sheet, cell)?;
        if !patch.is_empty() {
            self.changes.set_style(&name, cell, StyleEdit::Patch(patch));
        }
        Ok(())
    }

    /// Remove the cell's content. Its format stays.
    pub fn clear(&mut self, sheet: &str, cell: impl IntoCellRef) -> Result<(), XlsxError> {
        self.set_value(sheet, cell, CellValue::Empty)
    }

    /// Write `values` into the row after the last used one. Returns that row.
    pub fn append<I, V>(&mut self, sheet: &str, values: I) -> Result<u32, XlsxError>
    where
        I: IntoIterator<Item = V>,
        V: Into<CellValue>,
    {
        self.ensure_writable()?;
        let name = self.loaded()?.sheet(sheet)?.name.clone();
        let row = self.max_row(&name)? + 1;
        if row > EXCEL_MAX_ROWS {
            return Err(XlsxError::InvalidEdit(format!("sheet {name:?} is full")));
        }

        let values: Vec<CellValue> = values.into_iter().map(Into::into).collect();
        if values.len() > EXCEL_MAX_COLS as usize {
            return Err(XlsxError::InvalidEdit(format!(
                "{} values do not fit in one row",
                values.len()
            )));
        }
        for value in &values {
            validate_value(value)?;
        }

        for (col, value) in (1u32..).zip(values) {
            let content = match value {
                CellValue::Formula(formula) => ContentEdit::Formula(formula),
                other => ContentEdit::Value(other),
            };
            self.changes.set_content(&name, CellRef { row, col }, content);
        }
        Ok(row)
    }

    pub fn merge_cells(&mut self, sheet: &str, range: &str) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        let name = self.loaded()?.sheet(sheet)?.name.clone();
        let range = Range::from_a1(range)?;
        if range.is_single_cell() {
            return Err(XlsxError::InvalidEdit(format!("cannot merge a single cell ({range})")));
        }

        let mut merges = self.merged_ranges(&name)?;
        if let Some(existing) = merges.iter().find(|m| m.intersects(&range)) {
            return Err(XlsxError::InvalidEdit(format!(
                "{range} overlaps merged range {existing}"
            )));
        }
        merges.push(range);
        self.changes.set_merges(&name, merges);
        Ok(())
    }

    pub fn unmerge_cells(&mut self, sheet: &str, range: &str) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        let name = self.loaded()?.sheet(sheet)?.name.clone();
        let range = Range::from_a1(range)?;

        let mut merges = self.merged_ranges(&name)?;
        let Some(idx) = merges.iter().position(|m| *m == range) else {
            return Err(XlsxError::InvalidEdit(format!("{range} is not merged on {name:?}")));
        };
        merges.remove(idx);
        self.changes.set_merges(&name, merges);
        Ok(())
    }

    /// Set (`"A1:D20"`, or several comma-separated areas) or remove the print area.
    pub fn set_print_area(&mut self, sheet: &str, area: Option<&str>) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        let name = self.loaded()?.sheet(sheet)?.name.clone();
        let ranges = match area {
            None => None,
            Some(text) => {
                let ranges = text
                    .split(',')
                    .map(|part| {
                        let part = part.trim();
                        let reference = part.rsplit_once('!').map_or(part, |(_, r)| r);
                        Range::from_a1(reference)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Some(ranges)
            }
        };
        self.changes.set_print_area(&name, ranges);
        Ok(())
    }

    /// Freeze rows above and columns left of `top_left`. `None` (or `A1`) unfreezes.
    pub fn set_freeze_panes(&mut self, sheet: &str, top_left: Option<&str>) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        let name = self.loaded()?.sheet(sheet)?.name.clone();
        let cell = top_left
            .map(CellRef::from_a1)
            .transpose()?
            .filter(|c| (c.row, c.col) != (1, 1));
        self.changes.set_freeze_panes(&name, cell);
        Ok(())
    }

    /// Add or replace a defined name. A sheet scope must name an existing sheet.
    pub fn set_defined_name(&mut self, mut name: DefinedName) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        let checked = DefinedName::new(&name.name, name.scope.clone(), &name.refers_to)?;
        name.refers_to = checked.refers_to;
        name.scope = self.canonical_scope(&name.scope)?;
        self.changes.upsert_name(name);
        Ok(())
    }

    pub fn remove_defined_name(&mut self, name: &str, scope: NameScope) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        let scope = self.canonical_scope(&scope)?;
        let key = (name.to_ascii_lowercase(), scope);
        if !self.defined_names()?.iter().any(|n| n.key() == key) {
            return Err(XlsxError::InvalidEdit(format!("defined name {name:?} does not exist")));
        }
        self.changes.remove_name(key);
        Ok(())
    }

    fn canonical_scope(&self, scope: &NameScope) -> Result<NameScope, XlsxError> {
        Ok(match scope {
            NameScope::Workbook => NameScope::Workbook,
            NameScope::Sheet(sheet) => NameScope::Sheet(self.loaded()?.sheet(sheet)?.name.clone()),
        })
    }

    /// Append an empty worksheet named `name`.
    pub fn add_sheet(&mut self, name: &str) -> Result<(), XlsxError> {
        self.ensure_writable()?;
        validate_sheet_name(name)?;
        let loaded = self.loaded.as_mut().ok_or(XlsxError::Closed)?;
        if loaded.all_sheets().any(|s| s.name.eq_ignore_ascii_case(name)) {
            return Err(XlsxError::DuplicateSheet(name.to_string()));
        }

        let dir = loaded
            .workbook
            .part
            .rsplit_once('/')
            .map(|(dir, _)| format!("{dir}/"))
            .unwrap_or_default();
        let part = {
            let package = loaded.package.borrow();
            let free = (1u32..)
                .map(|n| format!("{dir}worksheets/sheet{n}.xml"))
                .find(|p| !package.has_part(p) && !loaded.new_sheets.iter().any(|s| s.part == *p));
            free.ok_or_else(|| XlsxError::InvalidEdit("no free worksheet part name".into()))?
        };
        let sheet_id = loaded.all_sheets().map(|s| s.sheet_id).max().unwrap_or(0) + 1;
        let mut relationships = loaded.workbook.relationships.clone();
        relationships.extend(loaded.new_sheets.iter().map(|s| Relationship {
            id: s.rel_id.clone(),
            type_uri: WORKSHEET_REL.to_string(),
            target: String::new(),
            target_mode: None,
        }));
        let rel_id = next_relationship_id(&relationships);

        let view = SheetView::parse(&part, crate::blank::worksheet_xml().into_bytes())?;
        loaded
            .views
            .borrow_mut()
            .insert(name.to_string(), Rc::new(view));
        loaded.new_sheets.push(SheetInfo {
            name: name.to_string(),
            sheet_id,
            rel_id,
            state: SheetState::Visible,
            part,
        });
        self.changes.add_sheet(name);
        log::debug!("queued new sheet {name:?}");
        Ok(())
    }

    fn reject_group_anchor(&self, sheet: &str, cell: CellRef) -> Result<(), XlsxError> {
        let raw = self.loaded()?.view(sheet)?.raw_cell(cell)?;
        if raw
            .as_ref()
            .and_then(|r| r.formula.as_ref())
            .is_some_and(|f| f.is_group_anchor())
        {
            return Err(XlsxError::InvalidEdit(format!(
                "{sheet}!{cell} anchors a shared or array formula used by other cells"
            )));
        }
        Ok(())
    }

    // ---- lifecycle ----

    /// Write the edited package to `out`. The change set is kept.
    pub fn write_to<W: Write + Seek>(&self, out: W) -> Result<FlushSummary, XlsxError> {
        let loaded = self.ensure_writable()?;

        let mut views = HashMap::new();
        for name in self.changes.sheets() {
            if self.changes.sheet(name).is_some_and(|e| e.touches_worksheet()) {
                views.insert(name.to_string(), loaded.view(name)?);
            }
        }

        let mut package = loaded.package.borrow_mut();
        patch::write_package(
            FlushInput {
                package: &mut package,
                workbook: &loaded.workbook,
                new_sheets: &loaded.new_sheets,
                views: &views,
                strings: loaded.strings.clone(),
                styles: loaded.styles.clone(),
                changes: &self.changes,
                options: self.options,
            },
            out,
        )
    }

    /// Commit every queued edit to `path` and continue from the written package.
    ///
    /// On failure nothing at `path` changes and the change set is kept for a retry.
    pub fn flush(&mut self, path: impl AsRef<Path>) -> Result<FlushSummary, XlsxError> {
        self.ensure_writable()?;
        let path = path.as_ref();
        let summary = crate::persist::atomic_write(path, |file| self.write_to(file))?;
        self.changes.clear();

        match Package::open(path, self.options.limits).and_then(Loaded::from_package) {
            Ok(loaded) => self.loaded = Some(loaded),
            Err(err) => {
                self.loaded = None;
                return Err(err);
            }
        }
        log::debug!("flush committed to {}", path.display());
        Ok(summary)
    }

    /// Release the package. Later calls fail with [`XlsxError::Closed`].
    pub fn close(&mut self) {
        if self.loaded.take().is_some() {
            log::debug!("session closed");
        }
    }
}

fn validate_value(value: &CellValue) -> Result<(), XlsxError> {
    match value {
        CellValue::Number(n) if !n.is_finite() => {
            Err(XlsxError::InvalidEdit(format!("{n} cannot be stored in a cell")))
        }
        CellValue::String(s) if s.chars().count() > MAX_CELL_TEXT => Err(XlsxError::InvalidEdit(
            format!("string of {} characters exceeds the cell limit", s.chars().count()),
        )),
        CellValue::Formula(f) if f.text.trim().is_empty() => {
            Err(XlsxError::InvalidEdit("formula text is empty".into()))
        }
        CellValue::Formula(f) => match f.cached.as_deref() {
            Some(CellValue::Formula(_)) => {
                Err(XlsxError::InvalidEdit("a cached value cannot be a formula".into()))
            }
            Some(cached) => validate_value(cached),
            None => Ok(()),
        },
        _ => Ok(()),
    }
}

fn validate_sheet_name(name: &str) -> Result<(), XlsxError> {
    let invalid = |reason: &str| XlsxError::InvalidEdit(format!("invalid sheet name {name:?}: {reason}"));
    if name.trim().is_empty() {
        return Err(invalid("empty"));
    }
    if name.chars().count() > MAX_SHEET_NAME {
        return Err(invalid("longer than 31 characters"));
    }
    if name.contains(['[', ']', ':', '*', '?', '/', '\\']) {
        return Err(invalid("contains a reserved character"));
    }
    if name.starts_with('\'') || name.ends_with('\'') {
        return Err(invalid("starts or ends with an apostrophe"));
    }
    Ok(())
}

/// Lazy iterator over the rows of a range. Each item holds one [`Cell`] per column.
#[derive(Clone)]
pub struct RowIter<'a> {
    session: &'a Session,
    sheet: String,
    range: Option<Range>,
    next_row: u32,
}

impl<'a> RowIter<'a> {
    /// Rewind to the first row.
    pub fn restart(&mut self) {
        self.next_row = self.range.map(|r| r.start.row).unwrap_or(1);
    }

    /// The same rows as plain values.
    pub fn values(self) -> impl Iterator<Item = Result<Vec<CellValue>, XlsxError>> + 'a {
        self.map(|row| row.map(|cells| cells.into_iter().map(|c| c.value).collect()))
    }
}

impl Iterator for RowIter<'_> {
    type Item = Result<Vec<Cell>, XlsxError>;

    fn next(&mut self) -> Option<Self::Item> {
        let range = self.range?;
        if self.next_row > range.end.row {
            return None;
        }
        let row = self.next_row;
        self.next_row += 1;
        Some(
            (range.start.col..=range.end.col)
                .map(|col| self.session.get(&self.sheet, CellRef { row, col }))
                .collect(),
        )
    }
}
