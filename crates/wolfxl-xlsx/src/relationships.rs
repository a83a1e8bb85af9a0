//! `.rels` parts and `[Content_Types].xml`: parsing plus the small in-place rewrites the
//! writer needs (adding a worksheet, dropping the calc chain).

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::xml::{escape_attr, local_name};
use crate::XlsxError;

pub const OFFICE_DOCUMENT_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
pub const WORKSHEET_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
pub const SHARED_STRINGS_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings";
pub const STYLES_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles";
pub const CALC_CHAIN_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/calcChain";
pub const WORKSHEET_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub type_uri: String,
    pub target: String,
    pub target_mode: Option<String>,
}

impl Relationship {
    pub fn is_external(&self) -> bool {
        self.target_mode
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("External"))
    }
}

pub fn parse_relationships(xml: &[u8]) -> Result<Vec<Relationship>, XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut relationships = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) | Event::Empty(start)
                if local_name(start.name().as_ref()).eq_ignore_ascii_case(b"Relationship") =>
            {
                let mut id = None;
                let mut target = None;
                let mut type_uri = None;
                let mut target_mode = None;
                for attr in start.attributes() {
                    let attr = attr?;
                    let key = local_name(attr.key.as_ref());
                    let value = attr.unescape_value()?.into_owned();
                    if key.eq_ignore_ascii_case(b"Id") {
                        id = Some(value);
                    } else if key.eq_ignore_ascii_case(b"Target") {
                        target = Some(value);
                    } else if key.eq_ignore_ascii_case(b"Type") {
                        type_uri = Some(value);
                    } else if key.eq_ignore_ascii_case(b"TargetMode") {
                        target_mode = Some(value);
                    }
                }
                if let (Some(id), Some(target), Some(type_uri)) = (id, target, type_uri) {
                    relationships.push(Relationship {
                        id,
                        type_uri,
                        target,
                        target_mode,
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(relationships)
}

/// First unused `rIdN`.
pub fn next_relationship_id(existing: &[Relationship]) -> String {
    let max = existing
        .iter()
        .filter_map(|r| r.id.strip_prefix("rId")?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("rId{}", max + 1)
}

/// Rewrite a `.rels` part: drop relationships matching `remove`, append `add` before the
/// closing tag. Everything else is streamed through unchanged.
pub(crate) fn rewrite_relationships(
    xml: &[u8],
    remove: impl Fn(&Relationship) -> bool,
    add: &[Relationship],
) -> Result<Vec<u8>, XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + add.len() * 160));
    let mut skip_depth = 0usize;

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Eof => break,
            _ if skip_depth > 0 => match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                _ => {}
            },
            Event::Start(ref e) | Event::Empty(ref e)
                if local_name(e.name().as_ref()) == b"Relationship" =>
            {
                let rel = relationship_from_start(e)?;
                if rel.as_ref().is_some_and(&remove) {
                    if matches!(event, Event::Start(_)) {
                        skip_depth = 1;
                    }
                    continue;
                }
                writer.write_event(event)?;
            }
            Event::End(ref e) if local_name(e.name().as_ref()) == b"Relationships" => {
                for rel in add {
                    let mut out = format!(
                        r#"<Relationship Id="{}" Type="{}" Target="{}""#,
                        escape_attr(&rel.id),
                        escape_attr(&rel.type_uri),
                        escape_attr(&rel.target)
                    );
                    if let Some(mode) = &rel.target_mode {
                        out.push_str(&format!(r#" TargetMode="{}""#, escape_attr(mode)));
                    }
                    out.push_str("/>");
                    writer.get_mut().extend_from_slice(out.as_bytes());
                }
                writer.write_event(event)?;
            }
            other => writer.write_event(other)?,
        }
    }

    Ok(writer.into_inner())
}

fn relationship_from_start(e: &BytesStart<'_>) -> Result<Option<Relationship>, XlsxError> {
    let mut id = None;
    let mut target = None;
    let mut type_uri = None;
    let mut target_mode = None;
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.into_owned();
        match local_name(attr.key.as_ref()) {
            b"Id" => id = Some(value),
            b"Target" => target = Some(value),
            b"Type" => type_uri = Some(value),
            b"TargetMode" => target_mode = Some(value),
            _ => {}
        }
    }
    Ok(match (id, target, type_uri) {
        (Some(id), Some(target), Some(type_uri)) => Some(Relationship {
            id,
            type_uri,
            target,
            target_mode,
        }),
        _ => None,
    })
}

/// Rewrite `[Content_Types].xml`: drop `<Override>` entries for `remove_parts`, add
/// overrides for `add_parts` (`(part_name, content_type)`, part names without a leading `/`).
pub(crate) fn rewrite_content_types(
    xml: &[u8],
    remove_parts: &[String],
    add_parts: &[(String, String)],
) -> Result<Vec<u8>, XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + add_parts.len() * 160));
    let mut skip_depth = 0usize;

    loop {
        let event = reader.read_event()?;
        match event {
            Event::Eof => break,
            _ if skip_depth > 0 => match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                _ => {}
            },
            Event::Start(ref e) | Event::Empty(ref e)
                if local_name(e.name().as_ref()) == b"Override" =>
            {
                let part = crate::xml::attr_value(e, b"PartName")?.unwrap_or_default();
                let part = part.trim_start_matches('/');
                if remove_parts.iter().any(|r| r.eq_ignore_ascii_case(part)) {
                    if matches!(event, Event::Start(_)) {
                        skip_depth = 1;
                    }
                    continue;
                }
                writer.write_event(event)?;
            }
            Event::End(ref e) if local_name(e.name().as_ref()) == b"Types" => {
                for (part, content_type) in add_parts {
                    let out = format!(
                        r#"<Override PartName="/{}" ContentType="{}"/>"#,
                        escape_attr(part),
                        escape_attr(content_type)
                    );
                    writer.get_mut().extend_from_slice(out.as_bytes());
                }
                writer.write_event(event)?;
            }
            other => writer.write_event(other)?,
        }
    }

    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId7" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/calcChain" Target="calcChain.xml"/></Relationships>"#;

    #[test]
    fn parses_and_numbers_relationships() {
        let rels = parse_relationships(WORKBOOK_RELS.as_bytes()).unwrap();
        assert_eq!(rels.len(), 2);
        assert_eq!(rels[0].target, "worksheets/sheet1.xml");
        assert_eq!(next_relationship_id(&rels), "rId8");
    }

    #[test]
    fn rewrite_drops_and_appends() {
        let add = vec![Relationship {
            id: "rId8".into(),
            type_uri: WORKSHEET_REL.into(),
            target: "worksheets/sheet2.xml".into(),
            target_mode: None,
        }];
        let out = rewrite_relationships(
            WORKBOOK_RELS.as_bytes(),
            |r| r.type_uri == CALC_CHAIN_REL,
            &add,
        )
        .unwrap();
        let rels = parse_relationships(&out).unwrap();
        let ids: Vec<&str> = rels.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["rId1", "rId8"]);
    }

    #[test]
    fn content_types_overrides() {
        let xml = r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/calcChain.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.calcChain+xml"/></Types>"#;
        let out = rewrite_content_types(
            xml.as_bytes(),
            &["xl/calcChain.xml".to_string()],
            &[("xl/worksheets/sheet2.xml".to_string(), WORKSHEET_CONTENT_TYPE.to_string())],
        )
        .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(!out.contains("calcChain"));
        assert!(out.contains(r#"<Override PartName="/xl/worksheets/sheet2.xml""#));
        assert!(out.contains(r#"<Default Extension="xml""#));
    }
}
