//! Part classification: which package entries the engine models and which it copies as bytes.
//!
//! Unknown parts are always opaque. Misclassifying a part as opaque only costs an
//! optimization; misclassifying it as managed could lose data.

use std::fmt;

/// Bumped whenever the rule table below changes meaning.
pub const CLASSIFIER_RULES_VERSION: u32 = 1;

/// Informational category for opaque parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpaqueKind {
    Relationships,
    DocProps,
    Theme,
    Media,
    Drawing,
    Chart,
    Table,
    Pivot,
    Vba,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartKind {
    Workbook,
    Worksheet,
    SharedStrings,
    Styles,
    WorkbookRelationships,
    ContentTypes,
    CalcChain,
    Opaque(OpaqueKind),
}

impl PartKind {
    pub fn is_managed(self) -> bool {
        !matches!(self, PartKind::Opaque(_))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PartKind::Workbook => "workbook",
            PartKind::Worksheet => "worksheet",
            PartKind::SharedStrings => "shared_strings",
            PartKind::Styles => "styles",
            PartKind::WorkbookRelationships => "workbook_rels",
            PartKind::ContentTypes => "content_types",
            PartKind::CalcChain => "calc_chain",
            PartKind::Opaque(OpaqueKind::Relationships) => "rels",
            PartKind::Opaque(OpaqueKind::DocProps) => "doc_props",
            PartKind::Opaque(OpaqueKind::Theme) => "theme",
            PartKind::Opaque(OpaqueKind::Media) => "media",
            PartKind::Opaque(OpaqueKind::Drawing) => "drawing",
            PartKind::Opaque(OpaqueKind::Chart) => "chart",
            PartKind::Opaque(OpaqueKind::Table) => "table",
            PartKind::Opaque(OpaqueKind::Pivot) => "pivot",
            PartKind::Opaque(OpaqueKind::Vba) => "vba",
            PartKind::Opaque(OpaqueKind::Other) => "other",
        }
    }
}

impl fmt::Display for PartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a single part name. Pure function of the name.
pub fn classify_part(part_name: &str) -> PartKind {
    let trimmed = part_name.trim_start_matches('/');
    if trimmed.eq_ignore_ascii_case("[Content_Types].xml") {
        return PartKind::ContentTypes;
    }

    let lower = trimmed.replace('\\', "/").to_ascii_lowercase();
    let part = lower.as_str();

    if part == "xl/_rels/workbook.xml.rels" {
        return PartKind::WorkbookRelationships;
    }
    if part.ends_with(".rels") {
        return PartKind::Opaque(OpaqueKind::Relationships);
    }
    if part == "xl/workbook.xml" {
        return PartKind::Workbook;
    }
    if let Some(rest) = part.strip_prefix("xl/worksheets/") {
        if !rest.contains('/') && rest.ends_with(".xml") {
            return PartKind::Worksheet;
        }
    }
    if part == "xl/sharedstrings.xml" {
        return PartKind::SharedStrings;
    }
    if part == "xl/styles.xml" {
        return PartKind::Styles;
    }
    if part == "xl/calcchain.xml" {
        return PartKind::CalcChain;
    }

    let opaque = if part.starts_with("docprops/") {
        OpaqueKind::DocProps
    } else if part.starts_with("xl/theme/") {
        OpaqueKind::Theme
    } else if part.starts_with("xl/media/") {
        OpaqueKind::Media
    } else if part.starts_with("xl/drawings/") {
        OpaqueKind::Drawing
    } else if part.starts_with("xl/charts/") || part.starts_with("xl/chartsheets/") {
        OpaqueKind::Chart
    } else if part.starts_with("xl/tables/") {
        OpaqueKind::Table
    } else if part.starts_with("xl/pivot") {
        OpaqueKind::Pivot
    } else if part == "xl/vbaproject.bin"
        || part == "xl/vbaprojectsignature.bin"
        || part.starts_with("xl/activex/")
        || part.starts_with("xl/ctrlprops/")
    {
        OpaqueKind::Vba
    } else {
        OpaqueKind::Other
    };
    PartKind::Opaque(opaque)
}

/// Managed and opaque part names, each in package order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartPartition {
    pub managed: Vec<String>,
    pub opaque: Vec<String>,
}

impl PartPartition {
    pub fn is_managed(&self, name: &str) -> bool {
        self.managed.iter().any(|m| m == name)
    }

    /// Treat `name` as managed even though its path is unconventional (e.g. a worksheet
    /// found through the workbook relationships at a non-standard location).
    pub(crate) fn promote(&mut self, name: &str) {
        if let Some(pos) = self.opaque.iter().position(|o| o == name) {
            let part = self.opaque.remove(pos);
            log::debug!("treating {part} as managed (referenced by workbook relationships)");
            self.managed.push(part);
        }
    }
}

pub fn classify_package<'a>(names: impl IntoIterator<Item = &'a str>) -> PartPartition {
    let mut partition = PartPartition::default();
    for name in names {
        if classify_part(name).is_managed() {
            partition.managed.push(name.to_string());
        } else {
            partition.opaque.push(name.to_string());
        }
    }
    partition
}
