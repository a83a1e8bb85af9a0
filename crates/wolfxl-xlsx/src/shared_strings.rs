//! Shared string table (`xl/sharedStrings.xml`).
//!
//! Existing entries are never renumbered or removed: a worksheet that is not rewritten still
//! refers to them by index. New strings are appended to the end of the table.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};

use crate::xml::{escape_attr, escape_text, needs_space_preserve, read_text};
use crate::XlsxError;

#[derive(Debug, Clone, Default)]
pub struct SharedStringTable {
    items: Vec<String>,
    /// Plain entries only. Rich-text entries carry formatting and are never reused for a
    /// plain write.
    index: HashMap<String, u32>,
    original_len: usize,
    original_count: Option<u64>,
    count_delta: i64,
}

impl SharedStringTable {
    pub fn parse(xml: &[u8]) -> Result<Self, XlsxError> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);

        let mut table = SharedStringTable::default();
        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sst" => {
                    table.original_count = crate::xml::attr_value(&e, b"count")?
                        .and_then(|v| v.parse::<u64>().ok());
                }
                Event::Start(e) if e.local_name().as_ref() == b"si" => {
                    let (text, plain) = parse_si(&mut reader)?;
                    table.push_existing(text, plain);
                }
                Event::Empty(e) if e.local_name().as_ref() == b"si" => {
                    table.push_existing(String::new(), true);
                }
                Event::Eof => break,
                _ => {}
            }
        }
        table.original_len = table.items.len();
        log::debug!("parsed shared string table: {} entries", table.items.len());
        Ok(table)
    }

    fn push_existing(&mut self, text: String, plain: bool) {
        let idx = self.items.len() as u32;
        if plain {
            // First occurrence wins when the producer stored duplicates.
            self.index.entry(text.clone()).or_insert(idx);
        }
        self.items.push(text);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Text of entry `idx`, or `None` when the index is out of range.
    pub fn materialize(&self, idx: u32) -> Option<&str> {
        self.items.get(idx as usize).map(String::as_str)
    }

    /// Index of an existing plain entry equal to `text`.
    pub fn lookup(&self, text: &str) -> Option<u32> {
        self.index.get(text).copied()
    }

    /// Index for `text`, appending a new entry if no plain entry matches.
    pub fn resolve(&mut self, text: &str) -> u32 {
        if let Some(idx) = self.lookup(text) {
            return idx;
        }
        let idx = self.items.len() as u32;
        self.items.push(text.to_string());
        self.index.insert(text.to_string(), idx);
        idx
    }

    /// Entries appended during this session, in index order.
    pub fn appended(&self) -> &[String] {
        &self.items[self.original_len..]
    }

    /// Whether the part needs to be regenerated. Only growth counts: a shifted reference
    /// count alone leaves the part as it was, and `count` is brought up to date the next
    /// time the table grows.
    pub fn is_dirty(&self) -> bool {
        self.items.len() != self.original_len
    }

    /// Record a change in the number of cells that reference the table.
    pub(crate) fn adjust_count(&mut self, delta: i64) {
        self.count_delta += delta;
    }

    /// Check that `idx` still materializes to `text`.
    pub(crate) fn verify(&self, idx: u32, text: &str) -> Result<(), XlsxError> {
        match self.materialize(idx) {
            Some(found) if found == text => Ok(()),
            found => Err(XlsxError::PoolInconsistency(format!(
                "shared string {idx} resolved to {found:?}, expected {text:?}"
            ))),
        }
    }

    /// Stream `original` through, appending new `<si>` entries and updating the counts.
    pub(crate) fn write(&self, original: &[u8]) -> Result<Vec<u8>, XlsxError> {
        let mut reader = Reader::from_reader(original);
        reader.config_mut().trim_text(false);
        let mut writer = Writer::new(Vec::with_capacity(original.len() + self.appended().len() * 32));
        let mut si_tag = "si".to_string();
        let mut t_tag = "t".to_string();

        loop {
            let event = reader.read_event()?;
            match event {
                Event::Eof => break,
                Event::Start(ref e) if e.local_name().as_ref() == b"sst" => {
                    (si_tag, t_tag) = child_tags(e);
                    writer.write_event(Event::Start(self.updated_sst_start(e)?))?;
                }
                Event::Empty(ref e) if e.local_name().as_ref() == b"sst" => {
                    (si_tag, t_tag) = child_tags(e);
                    let start = self.updated_sst_start(e)?;
                    let end = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    writer.write_event(Event::Start(start.borrow()))?;
                    self.write_appended(&mut writer, &si_tag, &t_tag);
                    writer.write_event(Event::End(quick_xml::events::BytesEnd::new(end)))?;
                }
                Event::End(ref e) if e.local_name().as_ref() == b"sst" => {
                    self.write_appended(&mut writer, &si_tag, &t_tag);
                    writer.write_event(event)?;
                }
                other => writer.write_event(other)?,
            }
        }

        Ok(writer.into_inner())
    }

    fn updated_sst_start(&self, e: &BytesStart<'_>) -> Result<BytesStart<'static>, XlsxError> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut start = BytesStart::new(tag);
        let unique = self.items.len().to_string();
        let mut saw_count = false;
        let mut saw_unique = false;
        for attr in e.attributes() {
            let attr = attr?;
            match attr.key.as_ref() {
                b"count" => {
                    saw_count = true;
                    let count = self.updated_count().to_string();
                    start.push_attribute(("count", count.as_str()));
                }
                b"uniqueCount" => {
                    saw_unique = true;
                    start.push_attribute(("uniqueCount", unique.as_str()));
                }
                _ => start.push_attribute(attr),
            }
        }
        if !saw_count && self.original_count.is_none() && self.count_delta > 0 {
            let count = self.updated_count().to_string();
            start.push_attribute(("count", count.as_str()));
        }
        if !saw_unique {
            start.push_attribute(("uniqueCount", unique.as_str()));
        }
        Ok(start)
    }

    fn updated_count(&self) -> u64 {
        let base = self.original_count.unwrap_or(0) as i64;
        (base + self.count_delta).max(0) as u64
    }

    fn write_appended(&self, writer: &mut Writer<Vec<u8>>, si_tag: &str, t_tag: &str) {
        let out = writer.get_mut();
        for text in self.appended() {
            let space = if needs_space_preserve(text) {
                r#" xml:space="preserve""#
            } else {
                ""
            };
            out.extend_from_slice(
                format!(
                    "<{si_tag}><{t_tag}{space}>{}</{t_tag}></{si_tag}>",
                    escape_text(text)
                )
                .as_bytes(),
            );
        }
    }
}

/// `<si>`/`<t>` tag names matching the prefix used on `<sst>`.
fn child_tags(sst: &BytesStart<'_>) -> (String, String) {
    let prefix = crate::xml::element_prefix(sst);
    (
        crate::xml::prefixed(prefix.as_deref(), "si"),
        crate::xml::prefixed(prefix.as_deref(), "t"),
    )
}

/// Visible text of one `<si>` and whether it is a plain (unformatted) entry.
fn parse_si(reader: &mut Reader<&[u8]>) -> Result<(String, bool), XlsxError> {
    let mut text = String::new();
    let mut plain = true;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => {
                text.push_str(&read_text(reader, e.name())?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"r" => {
                plain = false;
                text.push_str(&parse_run(reader, e.name())?);
            }
            Event::Start(e) => {
                // Phonetic runs and extensions are not part of the displayed string.
                reader.read_to_end(e.name())?;
            }
            Event::End(e) if e.local_name().as_ref() == b"si" => break,
            Event::Eof => return Err(XlsxError::malformed("sharedStrings.xml", "unexpected eof in <si>")),
            _ => {}
        }
    }
    Ok((text, plain))
}

fn parse_run(reader: &mut Reader<&[u8]>, end: QName<'_>) -> Result<String, XlsxError> {
    let end = end.as_ref().to_vec();
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => {
                text.push_str(&read_text(reader, e.name())?);
            }
            Event::Start(e) => {
                reader.read_to_end(e.name())?;
            }
            Event::End(e) if e.name().as_ref() == end.as_slice() => break,
            Event::Eof => return Err(XlsxError::malformed("sharedStrings.xml", "unexpected eof in <r>")),
            _ => {}
        }
    }
    Ok(text)
}

/// An empty `sst` part.
pub(crate) fn empty_table_xml(ns: &str) -> String {
    format!(
        r#"{}<sst xmlns="{}" count="0" uniqueCount="0"/>"#,
        crate::xml::XML_DECLARATION,
        escape_attr(ns)
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="5" uniqueCount="4"><si><t>Region</t></si><si><r><rPr><b/></rPr><t>Bold</t></r><r><t> tail</t></r></si><si><t>Base</t><rPh sb="0" eb="4"><t>PHO</t></rPh></si><si><t>Region</t></si></sst>"#;

    #[test]
    fn parses_plain_rich_and_phonetic_entries() {
        let table = SharedStringTable::parse(SST.as_bytes()).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.materialize(1), Some("Bold tail"));
        assert_eq!(table.materialize(2), Some("Base"));
        assert_eq!(table.materialize(9), None);
        // Duplicate plain entries resolve to the first one.
        assert_eq!(table.lookup("Region"), Some(0));
        // Rich entries are not reused for plain writes.
        assert_eq!(table.lookup("Bold tail"), None);
    }

    #[test]
    fn resolve_appends_and_existing_indices_stay_put() {
        let mut table = SharedStringTable::parse(SST.as_bytes()).unwrap();
        assert_eq!(table.resolve("Base"), 2);
        table.adjust_count(-1);
        assert!(!table.is_dirty());
        table.adjust_count(1);
        assert_eq!(table.resolve("North"), 4);
        assert_eq!(table.resolve("North"), 4);
        assert_eq!(table.appended(), ["North".to_string()]);
        table.adjust_count(1);

        let out = String::from_utf8(table.write(SST.as_bytes()).unwrap()).unwrap();
        assert!(out.contains(r#"count="6""#), "{out}");
        assert!(out.contains(r#"uniqueCount="5""#), "{out}");
        assert!(out.ends_with("<si><t>North</t></si></sst>"), "{out}");

        let reparsed = SharedStringTable::parse(out.as_bytes()).unwrap();
        for idx in 0..4 {
            assert_eq!(reparsed.materialize(idx), table.materialize(idx));
        }
        assert_eq!(reparsed.materialize(4), Some("North"));
    }

    #[test]
    fn whitespace_is_preserved_in_new_entries() {
        let mut table = SharedStringTable::default();
        table.resolve("  padded ");
        let xml = empty_table_xml(crate::xml::SPREADSHEETML_NS);
        let out = String::from_utf8(table.write(xml.as_bytes()).unwrap()).unwrap();
        assert!(out.contains(r#"<si><t xml:space="preserve">  padded </t></si>"#), "{out}");
    }

    #[test]
    fn verify_detects_drift() {
        let table = SharedStringTable::parse(SST.as_bytes()).unwrap();
        assert!(table.verify(0, "Region").is_ok());
        let err = table.verify(0, "Other").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PoolInconsistency);
    }
}
