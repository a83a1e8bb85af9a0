//! Pending edits, queued between flushes.

use std::collections::BTreeMap;

use wolfxl_model::{CellRef, CellValue, DefinedName, Formula, NameScope, Range, Style, StylePatch};

/// What a cell should contain after the flush.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentEdit {
    /// `CellValue::Empty` clears the cell's content.
    Value(CellValue),
    Formula(Formula),
}

impl ContentEdit {
    /// The value a read should observe.
    pub fn as_value(&self) -> CellValue {
        match self {
            ContentEdit::Value(v) => v.clone(),
            ContentEdit::Formula(f) => CellValue::Formula(f.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StyleEdit {
    /// Replace the whole format.
    Replace(Style),
    /// Overlay components on whatever the cell already has.
    Patch(StylePatch),
}

impl StyleEdit {
    /// Fold `later` into this edit.
    fn then(self, later: StyleEdit) -> StyleEdit {
        match (self, later) {
            (_, StyleEdit::Replace(style)) => StyleEdit::Replace(style),
            (StyleEdit::Replace(style), StyleEdit::Patch(patch)) => {
                StyleEdit::Replace(patch.apply(&style))
            }
            (StyleEdit::Patch(earlier), StyleEdit::Patch(patch)) => {
                StyleEdit::Patch(earlier.merged_with(patch))
            }
        }
    }

    /// Effective format given the cell's current one.
    pub fn apply(&self, current: &Style) -> Style {
        match self {
            StyleEdit::Replace(style) => style.clone(),
            StyleEdit::Patch(patch) => patch.apply(current),
        }
    }
}

/// Content and style edits are tracked separately: a value write keeps a pending style
/// edit and vice versa.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellEdit {
    pub content: Option<ContentEdit>,
    pub style: Option<StyleEdit>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetEdits {
    cells: BTreeMap<(u32, u32), CellEdit>,
    /// Replacement for the sheet's whole merge list.
    pub merges: Option<Vec<Range>>,
    /// `Some(None)` removes the print area.
    pub print_area: Option<Option<Vec<Range>>>,
    /// `Some(None)` removes frozen panes.
    pub freeze_panes: Option<Option<CellRef>>,
}

impl SheetEdits {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
            && self.merges.is_none()
            && self.print_area.is_none()
            && self.freeze_panes.is_none()
    }

    /// Whether the worksheet part itself must be rewritten. A print area lives in the
    /// workbook part.
    pub fn touches_worksheet(&self) -> bool {
        !self.cells.is_empty() || self.merges.is_some() || self.freeze_panes.is_some()
    }

    pub fn cell(&self, cell: CellRef) -> Option<&CellEdit> {
        self.cells.get(&(cell.row, cell.col))
    }

    /// Cell edits in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = (CellRef, &CellEdit)> + '_ {
        self.cells
            .iter()
            .map(|(&(row, col), edit)| (CellRef { row, col }, edit))
    }

    /// Bounding box of the cells that will hold something after the flush. A cleared
    /// cell with no pending style does not count.
    pub fn content_bounds(&self) -> Option<Range> {
        self.cells()
            .filter(|(_, e)| {
                e.style.is_some()
                    || matches!(&e.content, Some(c) if !matches!(c, ContentEdit::Value(CellValue::Empty)))
            })
            .fold(None, |acc: Option<Range>, (cell, _)| {
                let here = Range::single(cell);
                Some(acc.map_or(here, |r| r.union(&here)))
            })
    }

    fn set_content(&mut self, cell: CellRef, content: ContentEdit) {
        self.cells.entry((cell.row, cell.col)).or_default().content = Some(content);
    }

    fn set_style(&mut self, cell: CellRef, style: StyleEdit) {
        let entry = self.cells.entry((cell.row, cell.col)).or_default();
        entry.style = Some(match entry.style.take() {
            Some(earlier) => earlier.then(style),
            None => style,
        });
    }
}

/// Every edit not yet flushed, keyed by sheet name (as spelled in the workbook).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    sheets: BTreeMap<String, SheetEdits>,
    /// Keyed by [`DefinedName::key`]; `None` removes the name.
    names: BTreeMap<(String, NameScope), Option<DefinedName>>,
    new_sheets: Vec<String>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.values().all(SheetEdits::is_empty)
            && self.names.is_empty()
            && self.new_sheets.is_empty()
    }

    /// Sheets with pending edits, in name order.
    pub fn sheets(&self) -> impl Iterator<Item = &str> + '_ {
        self.sheets
            .iter()
            .filter(|(_, e)| !e.is_empty())
            .map(|(name, _)| name.as_str())
    }

    pub fn sheet(&self, sheet: &str) -> Option<&SheetEdits> {
        self.sheets.get(sheet)
    }

    /// Cell edits for `sheet` ordered by row, then column.
    pub fn entries_for<'a>(&'a self, sheet: &str) -> impl Iterator<Item = (CellRef, &'a CellEdit)> + 'a {
        self.sheets.get(sheet).into_iter().flat_map(SheetEdits::cells)
    }

    pub fn defined_names(&self) -> &BTreeMap<(String, NameScope), Option<DefinedName>> {
        &self.names
    }

    /// Sheets added in this session, in creation order.
    pub fn new_sheets(&self) -> &[String] {
        &self.new_sheets
    }

    pub fn clear(&mut self) {
        self.sheets.clear();
        self.names.clear();
        self.new_sheets.clear();
    }

    fn sheet_mut(&mut self, sheet: &str) -> &mut SheetEdits {
        self.sheets.entry(sheet.to_string()).or_default()
    }

    pub(crate) fn set_content(&mut self, sheet: &str, cell: CellRef, content: ContentEdit) {
        self.sheet_mut(sheet).set_content(cell, content);
    }

    pub(crate) fn set_style(&mut self, sheet: &str, cell: CellRef, style: StyleEdit) {
        self.sheet_mut(sheet).set_style(cell, style);
    }

    pub(crate) fn set_merges(&mut self, sheet: &str, merges: Vec<Range>) {
        self.sheet_mut(sheet).merges = Some(merges);
    }

    pub(crate) fn set_print_area(&mut self, sheet: &str, area: Option<Vec<Range>>) {
        self.sheet_mut(sheet).print_area = Some(area);
    }

    pub(crate) fn set_freeze_panes(&mut self, sheet: &str, top_left: Option<CellRef>) {
        self.sheet_mut(sheet).freeze_panes = Some(top_left);
    }

    pub(crate) fn upsert_name(&mut self, name: DefinedName) {
        self.names.insert(name.key(), Some(name));
    }

    pub(crate) fn remove_name(&mut self, key: (String, NameScope)) {
        self.names.insert(key, None);
    }

    pub(crate) fn add_sheet(&mut self, name: &str) {
        self.new_sheets.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use wolfxl_model::FontPatch;

    use super::*;

    fn cell(a1: &str) -> CellRef {
        CellRef::from_a1(a1).unwrap()
    }

    #[test]
    fn entries_are_row_major() {
        let mut changes = ChangeSet::new();
        assert!(changes.is_empty());
        for a1 in ["C2", "A10", "B2", "A1"] {
            changes.set_content("Data", cell(a1), ContentEdit::Value(CellValue::from(1.0)));
        }
        let order: Vec<String> = changes.entries_for("Data").map(|(c, _)| c.to_a1()).collect();
        assert_eq!(order, vec!["A1", "B2", "C2", "A10"]);
        assert_eq!(changes.entries_for("Other").count(), 0);
        assert!(!changes.is_empty());
    }

    #[test]
    fn content_and_style_are_independent() {
        let mut changes = ChangeSet::new();
        let a1 = cell("A1");
        changes.set_style("S", a1, StyleEdit::Patch(StylePatch::default().number_format("0%")));
        changes.set_content("S", a1, ContentEdit::Value(CellValue::from("x")));
        changes.set_content("S", a1, ContentEdit::Formula(Formula::new("=1+1")));

        let edit = changes.sheet("S").unwrap().cell(a1).unwrap();
        assert_eq!(edit.content, Some(ContentEdit::Formula(Formula::new("1+1"))));
        assert!(matches!(edit.style, Some(StyleEdit::Patch(_))));
    }

    #[test]
    fn style_edits_fold() {
        let mut changes = ChangeSet::new();
        let a1 = cell("A1");
        changes.set_style("S", a1, StyleEdit::Patch(StylePatch::default().number_format("0%")));
        changes.set_style(
            "S",
            a1,
            StyleEdit::Patch(StylePatch::default().font(FontPatch {
                bold: Some(true),
                ..FontPatch::default()
            })),
        );
        let edit = changes.sheet("S").unwrap().cell(a1).unwrap();
        let effective = edit.style.as_ref().unwrap().apply(&Style::default());
        assert!(effective.font.bold);
        assert_eq!(effective.number_format.as_deref(), Some("0%"));

        changes.set_style("S", a1, StyleEdit::Replace(Style::default()));
        let edit = changes.sheet("S").unwrap().cell(a1).unwrap();
        assert_eq!(edit.style, Some(StyleEdit::Replace(Style::default())));
    }

    #[test]
    fn clear_empties_everything() {
        let mut changes = ChangeSet::new();
        changes.set_merges("S", vec![Range::from_a1("A1:B2").unwrap()]);
        changes.add_sheet("New");
        changes.upsert_name(DefinedName::new("Rate", NameScope::Workbook, "0.07").unwrap());
        assert!(!changes.is_empty());
        assert_eq!(changes.sheets().collect::<Vec<_>>(), vec!["S"]);
        changes.clear();
        assert!(changes.is_empty());
    }
}
