//! Minimal blank package that write-only sessions start from, and the worksheet part
//! used for sheets added during a session.

use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::xml::{RELATIONSHIPS_NS, SPREADSHEETML_NS, XML_DECLARATION};
use crate::XlsxError;

/// A one-sheet package (`Sheet1`) with default styles and an empty shared string table.
pub(crate) fn blank_package() -> Result<Vec<u8>, XlsxError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);

    for (name, xml) in [
        ("[Content_Types].xml", content_types_xml()),
        ("_rels/.rels", root_rels_xml()),
        ("xl/workbook.xml", workbook_xml()),
        ("xl/_rels/workbook.xml.rels", workbook_rels_xml()),
        ("xl/styles.xml", styles_xml()),
        ("xl/sharedStrings.xml", crate::shared_strings::empty_table_xml(SPREADSHEETML_NS)),
        ("xl/worksheets/sheet1.xml", worksheet_xml()),
    ] {
        zip.start_file(name, options)?;
        zip.write_all(xml.as_bytes())?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Empty worksheet part.
pub(crate) fn worksheet_xml() -> String {
    format!(
        r#"{XML_DECLARATION}
<worksheet xmlns="{SPREADSHEETML_NS}" xmlns:r="{RELATIONSHIPS_NS}"><dimension ref="A1"/><sheetViews><sheetView workbookViewId="0"/></sheetViews><sheetFormatPr defaultRowHeight="15"/><sheetData/><pageMargins left="0.7" right="0.7" top="0.75" bottom="0.75" header="0.3" footer="0.3"/></worksheet>"#
    )
}

fn content_types_xml() -> String {
    format!(
        r#"{XML_DECLARATION}
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="{}"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/><Override PartName="/xl/sharedStrings.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml"/></Types>"#,
        crate::relationships::WORKSHEET_CONTENT_TYPE
    )
}

fn root_rels_xml() -> String {
    format!(
        r#"{XML_DECLARATION}
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="{}" Target="xl/workbook.xml"/></Relationships>"#,
        crate::relationships::OFFICE_DOCUMENT_REL
    )
}

fn workbook_xml() -> String {
    format!(
        r#"{XML_DECLARATION}
<workbook xmlns="{SPREADSHEETML_NS}" xmlns:r="{RELATIONSHIPS_NS}"><workbookPr/><bookViews><workbookView/></bookViews><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets><calcPr calcId="191029"/></workbook>"#
    )
}

fn workbook_rels_xml() -> String {
    use crate::relationships::{SHARED_STRINGS_REL, STYLES_REL, WORKSHEET_REL};
    format!(
        r#"{XML_DECLARATION}
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="{WORKSHEET_REL}" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="{STYLES_REL}" Target="styles.xml"/><Relationship Id="rId3" Type="{SHARED_STRINGS_REL}" Target="sharedStrings.xml"/></Relationships>"#
    )
}

fn styles_xml() -> String {
    format!(
        r#"{XML_DECLARATION}
<styleSheet xmlns="{SPREADSHEETML_NS}"><fonts count="1"><font><sz val="11"/><color theme="1"/><name val="Calibri"/><family val="2"/><scheme val="minor"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/></cellXfs><cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles></styleSheet>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::PackageLimits;
    use crate::package::Package;

    #[test]
    fn blank_package_parses() {
        let mut pkg = Package::from_bytes(blank_package().unwrap(), PackageLimits::default()).unwrap();
        assert_eq!(pkg.partition().opaque, vec!["_rels/.rels"]);

        let styles = crate::styles::StylePool::parse(&pkg.read_required_part("xl/styles.xml").unwrap()).unwrap();
        assert_eq!(styles.len(), 1);
        let sst = crate::shared_strings::SharedStringTable::parse(
            &pkg.read_required_part("xl/sharedStrings.xml").unwrap(),
        )
        .unwrap();
        assert!(sst.is_empty());
        let sheet = crate::sheet::SheetView::parse(
            "xl/worksheets/sheet1.xml",
            pkg.read_required_part("xl/worksheets/sheet1.xml").unwrap(),
        )
        .unwrap();
        assert_eq!(sheet.max_row(), None);
    }
}
