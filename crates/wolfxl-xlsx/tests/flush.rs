mod common;

use std::io::{Cursor, Read};

use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use wolfxl_xlsx::model::{DefinedName, FontPatch, NameScope};
use wolfxl_xlsx::{
    CellRef, CellValue, ErrorKind, OpenOptions, Range, RecalcPolicy, Session, StylePatch,
};

use common::*;

fn cell<'a>(doc: &'a roxmltree::Document<'a>, r: &str) -> Option<roxmltree::Node<'a, 'a>> {
    doc.descendants()
        .find(|n| n.has_tag_name("c") && n.attribute("r") == Some(r))
}

fn cell_value(doc: &roxmltree::Document<'_>, r: &str) -> Option<String> {
    let c = cell(doc, r)?;
    c.children()
        .find(|n| n.has_tag_name("v"))
        .and_then(|v| v.text())
        .map(str::to_string)
}

/// Compressed bytes of every entry.
fn raw_entries(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut file = archive.by_index_raw(i).unwrap();
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).unwrap();
            (file.name().to_string(), buf)
        })
        .collect()
}

#[test]
fn editing_one_cell_rewrites_only_that_sheet() {
    let original = three_sheet_package();
    let (dir, path) = write_fixture(&original);
    let out = dir.path().join("out.xlsx");

    let mut session = Session::open_modify(&path).unwrap();
    session.set_value("Sheet2", "B1", 2.0).unwrap();
    let summary = session.flush(&out).unwrap();
    assert_eq!(summary.regenerated, vec!["xl/worksheets/sheet2.xml".to_string()]);
    assert!(summary.added.is_empty());
    assert!(summary.removed.is_empty());

    let written = std::fs::read(&out).unwrap();
    assert_eq!(entry_names(&written), entry_names(&original));

    let before = raw_entries(&original);
    let after = raw_entries(&written);
    for ((name, old), (_, new)) in before.iter().zip(&after) {
        if name != "xl/worksheets/sheet2.xml" {
            assert_eq!(old, new, "{name} changed");
        }
    }

    let expected = SHEET2.replace(r#"<c r="B1"><v>1</v></c>"#, r#"<c r="B1"><v>2</v></c>"#);
    assert_eq!(part_text(&written, "xl/worksheets/sheet2.xml"), expected);
}

#[test]
fn empty_flush_keeps_every_part() {
    let original = three_sheet_package();
    let (dir, path) = write_fixture(&original);
    let out = dir.path().join("out.xlsx");

    let mut session = Session::open_modify(&path).unwrap();
    let summary = session.flush(&out).unwrap();
    assert!(summary.regenerated.is_empty());
    assert_eq!(summary.raw_copied, entry_names(&original).len());
    assert_eq!(read_parts(&std::fs::read(&out).unwrap()), read_parts(&original));
}

#[test]
fn session_rebases_after_flush() {
    let (dir, path) = write_fixture(&three_sheet_package());
    let out = dir.path().join("out.xlsx");

    let mut session = Session::open_modify(&path).unwrap();
    session.set_value("Sheet1", "C1", "fresh").unwrap();
    session.flush(&out).unwrap();

    assert!(session.change_set().is_empty());
    assert_eq!(session.value("Sheet1", "C1").unwrap(), CellValue::from("fresh"));
    let cell = session.get("Sheet1", "C1").unwrap();
    assert_eq!(cell.shared_string, Some(2));
}

#[test]
fn dropping_a_string_reference_leaves_the_table_alone() {
    let original = three_sheet_package();
    let mut session = Session::from_bytes(original.clone(), true, OpenOptions::default()).unwrap();
    session.set_value("Sheet1", "A1", 5.0).unwrap();

    let mut out = Cursor::new(Vec::new());
    let summary = session.write_to(&mut out).unwrap();
    assert_eq!(summary.regenerated, vec!["xl/worksheets/sheet1.xml".to_string()]);

    let written = out.into_inner();
    assert_eq!(
        part_text(&written, "xl/sharedStrings.xml"),
        part_text(&original, "xl/sharedStrings.xml")
    );
    let sheet = part_text(&written, "xl/worksheets/sheet1.xml");
    let doc = roxmltree::Document::parse(&sheet).unwrap();
    assert_eq!(cell(&doc, "A1").unwrap().attribute("t"), None);
    assert_eq!(cell_value(&doc, "A1").as_deref(), Some("5"));
}

#[test]
fn replacing_a_shared_string_keeps_the_old_entry() {
    let original = three_sheet_package();
    let mut session = Session::from_bytes(original, true, OpenOptions::default()).unwrap();
    assert_eq!(session.get("Sheet2", "A1").unwrap().shared_string, Some(0));
    session.set_value("Sheet2", "A1", "zeta").unwrap();

    let mut out = Cursor::new(Vec::new());
    session.write_to(&mut out).unwrap();
    let written = out.into_inner();

    let sst = part_text(&written, "xl/sharedStrings.xml");
    let doc = roxmltree::Document::parse(&sst).unwrap();
    let items: Vec<&str> = doc
        .descendants()
        .filter(|n| n.has_tag_name("t"))
        .filter_map(|n| n.text())
        .collect();
    assert_eq!(items, vec!["alpha", "beta", "zeta"]);

    let sheet = part_text(&written, "xl/worksheets/sheet2.xml");
    let doc = roxmltree::Document::parse(&sheet).unwrap();
    assert_eq!(cell(&doc, "A1").unwrap().attribute("t"), Some("s"));
    assert_eq!(cell_value(&doc, "A1").as_deref(), Some("2"));

    let reopened = Session::from_bytes(written, false, OpenOptions::default()).unwrap();
    assert_eq!(reopened.value("Sheet1", "A1").unwrap(), CellValue::from("alpha"));
    assert_eq!(reopened.value("Sheet2", "A1").unwrap(), CellValue::from("zeta"));
    assert_eq!(reopened.get("Sheet1", "A1").unwrap().shared_string, Some(0));
    assert_eq!(reopened.get("Sheet2", "A1").unwrap().shared_string, Some(2));
}

#[test]
fn new_strings_append_and_old_indices_stay() {
    let original = three_sheet_package();
    let mut session = Session::from_bytes(original, true, OpenOptions::default()).unwrap();
    session.set_value("Sheet1", "A3", "gamma").unwrap();
    session.set_value("Sheet1", "B1", "alpha").unwrap();

    let mut out = Cursor::new(Vec::new());
    session.write_to(&mut out).unwrap();
    let written = out.into_inner();

    let sst = part_text(&written, "xl/sharedStrings.xml");
    let doc = roxmltree::Document::parse(&sst).unwrap();
    let items: Vec<&str> = doc
        .descendants()
        .filter(|n| n.has_tag_name("t"))
        .filter_map(|n| n.text())
        .collect();
    assert_eq!(items, vec!["alpha", "beta", "gamma"]);
    let root = doc.root_element();
    assert_eq!(root.attribute("uniqueCount"), Some("3"));
    assert_eq!(root.attribute("count"), Some("5"));

    let sheet = part_text(&written, "xl/worksheets/sheet1.xml");
    let doc = roxmltree::Document::parse(&sheet).unwrap();
    assert_eq!(cell_value(&doc, "A1").as_deref(), Some("0"));
    assert_eq!(cell_value(&doc, "A2").as_deref(), Some("1"));
    assert_eq!(cell_value(&doc, "A3").as_deref(), Some("2"));
    assert_eq!(cell_value(&doc, "B1").as_deref(), Some("0"));
    let dimension = doc.descendants().find(|n| n.has_tag_name("dimension")).unwrap();
    assert_eq!(dimension.attribute("ref"), Some("A1:B3"));

    // write_to leaves the queued edits in place.
    assert!(!session.change_set().is_empty());
}

#[test]
fn equal_formats_share_one_record() {
    let original = three_sheet_package();
    let mut session = Session::from_bytes(original, true, OpenOptions::default()).unwrap();
    let bold = StylePatch::default().font(FontPatch {
        bold: Some(true),
        ..Default::default()
    });
    session.patch_style("Sheet2", "B1", bold.clone()).unwrap();
    session.patch_style("Sheet3", "A1", bold.clone()).unwrap();
    session.patch_style("Sheet3", "D9", bold).unwrap();

    let mut out = Cursor::new(Vec::new());
    session.write_to(&mut out).unwrap();
    let written = out.into_inner();

    let styles = part_text(&written, "xl/styles.xml");
    let doc = roxmltree::Document::parse(&styles).unwrap();
    let count = |table: &str| {
        doc.descendants()
            .find(|n| n.has_tag_name(table))
            .and_then(|n| n.attribute("count"))
            .map(str::to_string)
    };
    assert_eq!(count("cellXfs").as_deref(), Some("3"));
    assert_eq!(count("fonts").as_deref(), Some("2"));

    let sheet3 = part_text(&written, "xl/worksheets/sheet3.xml");
    let doc = roxmltree::Document::parse(&sheet3).unwrap();
    assert_eq!(cell(&doc, "A1").unwrap().attribute("s"), Some("2"));
    assert_eq!(cell(&doc, "D9").unwrap().attribute("s"), Some("2"));
    // Style-only edits keep the value.
    assert_eq!(cell_value(&doc, "A1").as_deref(), Some("1"));

    // Reopened, the same request resolves to the record already there.
    let mut again = Session::from_bytes(written, true, OpenOptions::default()).unwrap();
    again
        .patch_style(
            "Sheet1",
            "B1",
            StylePatch::default().font(FontPatch {
                bold: Some(true),
                ..Default::default()
            }),
        )
        .unwrap();
    let existing = again.cell_style("Sheet1", "A1").unwrap();
    again.set_style("Sheet1", "A2", existing).unwrap();
    let summary = again.write_to(Cursor::new(Vec::new())).unwrap();
    assert_eq!(summary.regenerated, vec!["xl/worksheets/sheet1.xml".to_string()]);
}

#[test]
fn dates_read_and_write_through_number_formats() {
    let original = three_sheet_package();
    let mut session = Session::from_bytes(original, true, OpenOptions::default()).unwrap();
    let new_year = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    assert_eq!(session.value("Sheet2", "C1").unwrap(), CellValue::DateTime(new_year));

    let march = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    session.set_value("Sheet3", "B1", march).unwrap();
    let mut out = Cursor::new(Vec::new());
    session.write_to(&mut out).unwrap();

    let reopened = Session::from_bytes(out.into_inner(), false, OpenOptions::default()).unwrap();
    assert_eq!(
        reopened.value("Sheet3", "B1").unwrap(),
        CellValue::DateTime(march.and_hms_opt(0, 0, 0).unwrap())
    );
    assert_eq!(
        reopened.cell_style("Sheet3", "B1").unwrap().number_format.as_deref(),
        Some("yyyy-mm-dd")
    );
}

#[test]
fn formula_edits_drop_the_calc_chain_when_asked() {
    let original = three_sheet_package();
    let options = OpenOptions::default().with_recalc_policy(RecalcPolicy::RECALCULATE_ON_LOAD);
    let mut session = Session::from_bytes(original, true, options).unwrap();
    session.set_formula("Sheet1", "C1", "=B1+1", None).unwrap();

    let mut out = Cursor::new(Vec::new());
    let summary = session.write_to(&mut out).unwrap();
    let written = out.into_inner();
    assert_eq!(summary.removed, vec!["xl/calcChain.xml".to_string()]);

    let parts = read_parts(&written);
    assert!(!parts.contains_key("xl/calcChain.xml"));
    let rels = part_text(&written, "xl/_rels/workbook.xml.rels");
    assert!(!rels.contains("calcChain"), "{rels}");
    let types = part_text(&written, "[Content_Types].xml");
    assert!(!types.contains("calcChain"), "{types}");

    let workbook = part_text(&written, "xl/workbook.xml");
    let doc = roxmltree::Document::parse(&workbook).unwrap();
    let calc = doc.descendants().find(|n| n.has_tag_name("calcPr")).unwrap();
    assert_eq!(calc.attribute("fullCalcOnLoad"), Some("1"));

    let sheet = part_text(&written, "xl/worksheets/sheet1.xml");
    let doc = roxmltree::Document::parse(&sheet).unwrap();
    let f = cell(&doc, "C1")
        .unwrap()
        .children()
        .find(|n| n.has_tag_name("f"))
        .and_then(|n| n.text())
        .map(str::to_string);
    assert_eq!(f.as_deref(), Some("B1+1"));
}

#[test]
fn formula_edits_rewrite_only_their_sheet_by_default() {
    let original = three_sheet_package();
    let mut session = Session::from_bytes(original.clone(), true, OpenOptions::default()).unwrap();
    session.set_formula("Sheet3", "B1", "A1*2", None).unwrap();

    let mut out = Cursor::new(Vec::new());
    let summary = session.write_to(&mut out).unwrap();
    assert!(summary.removed.is_empty());
    assert_eq!(summary.regenerated, vec!["xl/worksheets/sheet3.xml".to_string()]);

    let written = out.into_inner();
    let before = read_parts(&original);
    let after = read_parts(&written);
    for name in ["xl/calcChain.xml", "xl/workbook.xml", "xl/_rels/workbook.xml.rels", "[Content_Types].xml"] {
        assert_eq!(after.get(name), before.get(name), "{name} changed");
    }
}

#[test]
fn value_edits_keep_the_calc_chain() {
    let original = three_sheet_package();
    let mut session = Session::from_bytes(original, true, OpenOptions::default()).unwrap();
    session.set_value("Sheet3", "A2", 5.0).unwrap();
    let summary = session.write_to(Cursor::new(Vec::new())).unwrap();
    assert!(summary.removed.is_empty());
    assert_eq!(summary.regenerated, vec!["xl/worksheets/sheet3.xml".to_string()]);
}

#[test]
fn shared_formula_groups() {
    let mut session = Session::from_bytes(three_sheet_package(), true, OpenOptions::default()).unwrap();
    match session.value("Sheet2", "B3").unwrap() {
        CellValue::Formula(f) => assert_eq!(f.text, "C1*2"),
        other => panic!("expected a formula, got {other:?}"),
    }

    let err = session.set_value("Sheet2", "A3", 1.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnresolvableEdit);
    assert!(session.change_set().is_empty());

    // Styling the anchor is fine.
    session
        .patch_style("Sheet2", "A3", StylePatch::default().number_format("0.00"))
        .unwrap();
}

#[test]
fn sheet_metadata_round_trips() {
    let (dir, path) = write_fixture(&three_sheet_package());
    let out = dir.path().join("out.xlsx");

    let mut session = Session::open_modify(&path).unwrap();
    assert_eq!(
        session.print_area("Sheet1").unwrap(),
        Some(vec![Range::from_a1("A1:B2").unwrap()])
    );
    assert_eq!(session.merged_ranges("Sheet2").unwrap(), vec![Range::from_a1("B2:C2").unwrap()]);

    session.merge_cells("Sheet3", "A1:B2").unwrap();
    session.unmerge_cells("Sheet2", "B2:C2").unwrap();
    session.set_print_area("Sheet2", Some("A1:C3")).unwrap();
    session.set_print_area("Sheet1", None).unwrap();
    session.set_freeze_panes("Sheet3", Some("B2")).unwrap();
    session
        .set_defined_name(DefinedName::new("Total", NameScope::Workbook, "Sheet1!$B$2").unwrap())
        .unwrap();
    session.remove_defined_name("rate", NameScope::Workbook).unwrap();
    session.flush(&out).unwrap();

    let reopened = Session::open(&out).unwrap();
    assert_eq!(reopened.merged_ranges("Sheet3").unwrap(), vec![Range::from_a1("A1:B2").unwrap()]);
    assert!(reopened.merged_ranges("Sheet2").unwrap().is_empty());
    assert_eq!(reopened.print_area("Sheet1").unwrap(), None);
    assert_eq!(
        reopened.print_area("Sheet2").unwrap(),
        Some(vec![Range::from_a1("A1:C3").unwrap()])
    );
    assert_eq!(reopened.freeze_panes("Sheet3").unwrap(), Some(CellRef { row: 2, col: 2 }));

    let mut names: Vec<String> = reopened
        .defined_names()
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["Total".to_string(), "_xlnm.Print_Area".to_string()]);

    // Cell content is untouched.
    assert_eq!(reopened.value("Sheet3", "A1").unwrap(), CellValue::Boolean(true));
    assert_eq!(reopened.value("Sheet2", "A2").unwrap(), CellValue::from("note"));
}

#[test]
fn added_sheets_are_appended() {
    let original = three_sheet_package();
    let mut session = Session::from_bytes(original.clone(), true, OpenOptions::default()).unwrap();
    session.add_sheet("Summary").unwrap();
    session.add_sheet("Blank").unwrap();
    session.set_value("Summary", "A1", "total").unwrap();
    assert_eq!(
        session.add_sheet("sheet2").unwrap_err().kind(),
        ErrorKind::UnresolvableEdit
    );

    let mut out = Cursor::new(Vec::new());
    let summary = session.write_to(&mut out).unwrap();
    let written = out.into_inner();
    assert_eq!(
        summary.added,
        vec![
            "xl/worksheets/sheet4.xml".to_string(),
            "xl/worksheets/sheet5.xml".to_string()
        ]
    );

    let names = entry_names(&written);
    assert_eq!(&names[..names.len() - 2], entry_names(&original).as_slice());

    let types = part_text(&written, "[Content_Types].xml");
    assert!(types.contains("/xl/worksheets/sheet4.xml"));
    assert!(types.contains("/xl/worksheets/sheet5.xml"));

    let reopened = Session::from_bytes(written, false, OpenOptions::default()).unwrap();
    assert_eq!(
        reopened.sheet_names().unwrap(),
        vec!["Sheet1", "Sheet2", "Sheet3", "Summary", "Blank"]
    );
    assert_eq!(reopened.value("Summary", "A1").unwrap(), CellValue::from("total"));
    assert_eq!(reopened.max_row("Blank").unwrap(), 0);
}

#[test]
fn failed_flush_keeps_source_and_changes() {
    let original = three_sheet_package();
    let (dir, path) = write_fixture(&original);
    let blocked = dir.path().join("blocked");
    std::fs::create_dir(&blocked).unwrap();

    let mut session = Session::open_modify(&path).unwrap();
    session.set_value("Sheet1", "B1", 99.0).unwrap();
    let err = session.flush(&blocked).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteFailure);

    assert!(!session.change_set().is_empty());
    assert_eq!(std::fs::read(&path).unwrap(), original);
    assert_eq!(session.value("Sheet1", "B1").unwrap(), CellValue::Number(99.0));

    // Retrying into the source path succeeds and rebases.
    session.flush(&path).unwrap();
    assert!(session.change_set().is_empty());
    let reopened = Session::open(&path).unwrap();
    assert_eq!(reopened.value("Sheet1", "B1").unwrap(), CellValue::Number(99.0));
}

#[test]
fn read_only_sessions_reject_writes() {
    let (dir, path) = write_fixture(&three_sheet_package());
    let mut session = Session::open(&path).unwrap();

    assert_eq!(session.value("Sheet1", "A1").unwrap(), CellValue::from("alpha"));
    assert_eq!(session.set_value("Sheet1", "A1", 1.0).unwrap_err().kind(), ErrorKind::Usage);
    assert_eq!(
        session.flush(dir.path().join("out.xlsx")).unwrap_err().kind(),
        ErrorKind::Usage
    );

    session.close();
    assert_eq!(session.value("Sheet1", "A1").unwrap_err().kind(), ErrorKind::Usage);
}

#[test]
fn new_workbooks_flush_through_the_patch_writer() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("new.xlsx");

    let mut session = Session::new().unwrap();
    session.append("Sheet1", ["name", "score"]).unwrap();
    session
        .append("Sheet1", [CellValue::from("ada"), CellValue::from(36.5)])
        .unwrap();
    session.set_formula("Sheet1", "B3", "SUM(B2:B2)", Some(CellValue::Number(36.5))).unwrap();
    session.flush(&out).unwrap();

    let reopened = Session::open(&out).unwrap();
    let rows: Vec<Vec<CellValue>> = reopened
        .iter_rows("Sheet1", Some(Range::from_a1("A1:B2").unwrap()))
        .unwrap()
        .values()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![CellValue::from("name"), CellValue::from("score")],
            vec![CellValue::from("ada"), CellValue::Number(36.5)],
        ]
    );
    assert_eq!(reopened.dimensions("Sheet1").unwrap(), Some(Range::from_a1("A1:B3").unwrap()));
    match reopened.value("Sheet1", "B3").unwrap() {
        CellValue::Formula(f) => {
            assert_eq!(f.text, "SUM(B2:B2)");
            assert_eq!(f.cached.as_deref(), Some(&CellValue::Number(36.5)));
        }
        other => panic!("expected a formula, got {other:?}"),
    }
}

#[test]
fn malformed_packages_fail_to_open() {
    let err = Session::from_bytes(b"not a zip".to_vec(), false, OpenOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedPackage);

    let broken = build_package(&[
        ("[Content_Types].xml", CONTENT_TYPES.as_bytes()),
        ("xl/workbook.xml", b"<workbook><sheets><sheet name=\"A\" sheetId=\"1\" r:id=\"rId9\"/></sheets></workbook>"),
    ]);
    let err = Session::from_bytes(broken, false, OpenOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedPackage);
}
