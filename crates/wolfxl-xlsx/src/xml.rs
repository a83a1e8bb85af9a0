//! quick-xml helpers shared by the part parsers and patchers.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;

use crate::XlsxError;

pub(crate) const SPREADSHEETML_NS: &str =
    "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
pub(crate) const RELATIONSHIPS_NS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
pub(crate) const XML_DECLARATION: &str =
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

pub(crate) fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|b| *b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

/// Value of the attribute whose local name is `key`.
pub(crate) fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, XlsxError> {
    for attr in e.attributes().with_checks(false) {
        let attr = attr?;
        if local_name(attr.key.as_ref()) == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Text content up to the matching end tag.
pub(crate) fn read_text(reader: &mut Reader<&[u8]>, end: QName<'_>) -> Result<String, XlsxError> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(e) => {
                let t: Cow<'_, str> = e.unescape()?;
                text.push_str(&t);
            }
            Event::CData(e) => text.push_str(std::str::from_utf8(e.as_ref())?),
            Event::End(e) if e.name() == end => break,
            Event::Eof => return Err(XlsxError::malformed("xml", "unexpected eof in text")),
            _ => {}
        }
    }
    Ok(text)
}

/// Namespace prefix used for SpreadsheetML elements in a part (`x` for `<x:worksheet>`).
pub(crate) fn element_prefix(start: &BytesStart<'_>) -> Option<String> {
    let name = start.name();
    let raw = name.as_ref();
    raw.iter()
        .position(|b| *b == b':')
        .map(|idx| String::from_utf8_lossy(&raw[..idx]).into_owned())
}

pub(crate) fn prefixed(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}:{local}"),
        _ => local.to_string(),
    }
}

pub(crate) fn needs_space_preserve(text: &str) -> bool {
    text.starts_with(char::is_whitespace)
        || text.ends_with(char::is_whitespace)
        || text.contains('\n')
}

pub(crate) fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub(crate) fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

/// Format a float the way spreadsheet producers do: integers without a fraction, no exponent
/// for ordinary magnitudes.
pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        let s = format!("{n}");
        if s.contains("inf") || s.contains("NaN") {
            "0".to_string()
        } else {
            s
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_format_without_trailing_zero() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-3.5), "-3.5");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
    }

    #[test]
    fn prefix_detection() {
        let start = BytesStart::new("x:worksheet");
        assert_eq!(element_prefix(&start).as_deref(), Some("x"));
        assert_eq!(prefixed(Some("x"), "row"), "x:row");
        assert_eq!(prefixed(None, "row"), "row");
    }
}
