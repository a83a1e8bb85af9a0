use serde::{Deserialize, Serialize};

/// A color reference as it appears in `styles.xml`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    /// `rgb="FFRRGGBB"`.
    Argb(u32),
    /// `theme="N"` with an optional `tint`, kept as written.
    Theme { index: u32, tint: Option<String> },
    /// Legacy palette index.
    Indexed(u32),
    /// `auto="1"`.
    Auto,
}

impl Color {
    /// Opaque color from `RRGGBB` (or `AARRGGBB`, with or without `#`).
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        let argb = match hex.len() {
            6 => 0xFF00_0000 | u32::from_str_radix(hex, 16).ok()?,
            8 => u32::from_str_radix(hex, 16).ok()?,
            _ => return None,
        };
        Some(Color::Argb(argb))
    }

    pub const fn black() -> Self {
        Color::Argb(0xFF00_0000)
    }
}

/// Underline variants supported by `<u val=".."/>`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Underline {
    Single,
    Double,
    SingleAccounting,
    DoubleAccounting,
}

impl Underline {
    pub fn as_ooxml(self) -> &'static str {
        match self {
            Underline::Single => "single",
            Underline::Double => "double",
            Underline::SingleAccounting => "singleAccounting",
            Underline::DoubleAccounting => "doubleAccounting",
        }
    }

    pub fn from_ooxml(val: Option<&str>) -> Option<Self> {
        match val.unwrap_or("single") {
            "single" => Some(Underline::Single),
            "double" => Some(Underline::Double),
            "singleAccounting" => Some(Underline::SingleAccounting),
            "doubleAccounting" => Some(Underline::DoubleAccounting),
            _ => None,
        }
    }
}

/// Font record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Font {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Font size in 1/100 points (e.g. 1100 = 11pt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_100pt: Option<u32>,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underline: Option<Underline>,
    #[serde(default)]
    pub strike: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
    /// `<family val="2"/>`, kept so regenerated fonts match the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<u32>,
    /// `<scheme val="minor"/>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

impl Font {
    pub fn size_pt(&self) -> Option<f64> {
        self.size_100pt.map(|s| s as f64 / 100.0)
    }

    pub fn set_size_pt(&mut self, pt: f64) {
        self.size_100pt = Some((pt * 100.0).round().max(0.0) as u32);
    }
}

/// Partial font edit: `Some` fields replace the base font's value.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct FontPatch {
    pub name: Option<String>,
    pub size_pt: Option<f64>,
    pub bold: Option<bool>,
    pub italic: Option<bool>,
    /// `Some(None)` removes an underline.
    pub underline: Option<Option<Underline>>,
    pub strike: Option<bool>,
    pub color: Option<Color>,
}

impl FontPatch {
    pub fn apply(&self, base: &Font) -> Font {
        let mut font = base.clone();
        if let Some(name) = &self.name {
            font.name = Some(name.clone());
            // A different face invalidates the theme font scheme.
            font.scheme = None;
        }
        if let Some(pt) = self.size_pt {
            font.set_size_pt(pt);
        }
        if let Some(bold) = self.bold {
            font.bold = bold;
        }
        if let Some(italic) = self.italic {
            font.italic = italic;
        }
        if let Some(underline) = self.underline {
            font.underline = underline;
        }
        if let Some(strike) = self.strike {
            font.strike = strike;
        }
        if let Some(color) = &self.color {
            font.color = Some(color.clone());
        }
        font
    }
}

/// `patternType` values.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    #[default]
    None,
    Solid,
    Gray125,
    /// Any other named pattern (`darkGrid`, `lightUp`, ...), kept as written.
    Other(String),
}

impl PatternType {
    pub fn as_ooxml(&self) -> &str {
        match self {
            PatternType::None => "none",
            PatternType::Solid => "solid",
            PatternType::Gray125 => "gray125",
            PatternType::Other(name) => name,
        }
    }

    pub fn from_ooxml(val: &str) -> Self {
        match val {
            "none" => PatternType::None,
            "solid" => PatternType::Solid,
            "gray125" => PatternType::Gray125,
            other => PatternType::Other(other.to_string()),
        }
    }
}

/// Fill record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fill {
    Pattern {
        pattern: PatternType,
        fg_color: Option<Color>,
        bg_color: Option<Color>,
    },
    /// Gradient fills are not modeled; the inner XML of `<fill>` is carried verbatim.
    Gradient(String),
}

impl Default for Fill {
    fn default() -> Self {
        Fill::Pattern {
            pattern: PatternType::None,
            fg_color: None,
            bg_color: None,
        }
    }
}

impl Fill {
    /// Solid background fill, the common "cell color" case.
    pub fn solid(color: Color) -> Self {
        Fill::Pattern {
            pattern: PatternType::Solid,
            fg_color: Some(color),
            bg_color: None,
        }
    }
}

/// Border line style (`style="..."` on a border edge).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderStyle {
    #[default]
    None,
    Thin,
    Medium,
    Dashed,
    Dotted,
    Thick,
    Double,
    Hair,
    MediumDashed,
    DashDot,
    MediumDashDot,
    DashDotDot,
    MediumDashDotDot,
    SlantDashDot,
}

impl BorderStyle {
    pub fn as_ooxml(self) -> Option<&'static str> {
        let name = match self {
            BorderStyle::None => return None,
            BorderStyle::Thin => "thin",
            BorderStyle::Medium => "medium",
            BorderStyle::Dashed => "dashed",
            BorderStyle::Dotted => "dotted",
            BorderStyle::Thick => "thick",
            BorderStyle::Double => "double",
            BorderStyle::Hair => "hair",
            BorderStyle::MediumDashed => "mediumDashed",
            BorderStyle::DashDot => "dashDot",
            BorderStyle::MediumDashDot => "mediumDashDot",
            BorderStyle::DashDotDot => "dashDotDot",
            BorderStyle::MediumDashDotDot => "mediumDashDotDot",
            BorderStyle::SlantDashDot => "slantDashDot",
        };
        Some(name)
    }

    pub fn from_ooxml(val: &str) -> Self {
        match val {
            "thin" => BorderStyle::Thin,
            "medium" => BorderStyle::Medium,
            "dashed" => BorderStyle::Dashed,
            "dotted" => BorderStyle::Dotted,
            "thick" => BorderStyle::Thick,
            "double" => BorderStyle::Double,
            "hair" => BorderStyle::Hair,
            "mediumDashed" => BorderStyle::MediumDashed,
            "dashDot" => BorderStyle::DashDot,
            "mediumDashDot" => BorderStyle::MediumDashDot,
            "dashDotDot" => BorderStyle::DashDotDot,
            "mediumDashDotDot" => BorderStyle::MediumDashDotDot,
            "slantDashDot" => BorderStyle::SlantDashDot,
            _ => BorderStyle::None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BorderEdge {
    pub style: BorderStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
}

impl BorderEdge {
    pub fn new(style: BorderStyle, color: Option<Color>) -> Self {
        Self { style, color }
    }

    pub fn is_none(&self) -> bool {
        self.style == BorderStyle::None
    }
}

/// Border record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Border {
    #[serde(default)]
    pub left: BorderEdge,
    #[serde(default)]
    pub right: BorderEdge,
    #[serde(default)]
    pub top: BorderEdge,
    #[serde(default)]
    pub bottom: BorderEdge,
    #[serde(default)]
    pub diagonal: BorderEdge,
    #[serde(default)]
    pub diagonal_up: bool,
    #[serde(default)]
    pub diagonal_down: bool,
}

impl Border {
    /// Same edge on all four sides.
    pub fn outline(edge: BorderEdge) -> Self {
        Self {
            left: edge.clone(),
            right: edge.clone(),
            top: edge.clone(),
            bottom: edge,
            ..Self::default()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalAlignment {
    General,
    Left,
    Center,
    Right,
    Fill,
    Justify,
    CenterContinuous,
    Distributed,
}

impl HorizontalAlignment {
    pub fn as_ooxml(self) -> &'static str {
        match self {
            HorizontalAlignment::General => "general",
            HorizontalAlignment::Left => "left",
            HorizontalAlignment::Center => "center",
            HorizontalAlignment::Right => "right",
            HorizontalAlignment::Fill => "fill",
            HorizontalAlignment::Justify => "justify",
            HorizontalAlignment::CenterContinuous => "centerContinuous",
            HorizontalAlignment::Distributed => "distributed",
        }
    }

    pub fn from_ooxml(val: &str) -> Option<Self> {
        Some(match val {
            "general" => HorizontalAlignment::General,
            "left" => HorizontalAlignment::Left,
            "center" => HorizontalAlignment::Center,
            "right" => HorizontalAlignment::Right,
            "fill" => HorizontalAlignment::Fill,
            "justify" => HorizontalAlignment::Justify,
            "centerContinuous" => HorizontalAlignment::CenterContinuous,
            "distributed" => HorizontalAlignment::Distributed,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalAlignment {
    Top,
    Center,
    Bottom,
    Justify,
    Distributed,
}

impl VerticalAlignment {
    pub fn as_ooxml(self) -> &'static str {
        match self {
            VerticalAlignment::Top => "top",
            VerticalAlignment::Center => "center",
            VerticalAlignment::Bottom => "bottom",
            VerticalAlignment::Justify => "justify",
            VerticalAlignment::Distributed => "distributed",
        }
    }

    pub fn from_ooxml(val: &str) -> Option<Self> {
        Some(match val {
            "top" => VerticalAlignment::Top,
            "center" => VerticalAlignment::Center,
            "bottom" => VerticalAlignment::Bottom,
            "justify" => VerticalAlignment::Justify,
            "distributed" => VerticalAlignment::Distributed,
            _ => return None,
        })
    }
}

/// Alignment record (`<alignment>` inside a cell format).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Alignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal: Option<HorizontalAlignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical: Option<VerticalAlignment>,
    #[serde(default)]
    pub wrap_text: bool,
    #[serde(default)]
    pub shrink_to_fit: bool,
    /// Degrees: `0..=180`, or `255` for vertical stacked text.
    #[serde(default)]
    pub text_rotation: u32,
    #[serde(default)]
    pub indent: u32,
}

impl Alignment {
    pub fn is_default(&self) -> bool {
        *self == Alignment::default()
    }
}

/// The canonical tuple a cell format is compared by.
///
/// `number_format` is the format *code*; `None` means `General`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Style {
    #[serde(default)]
    pub font: Font,
    #[serde(default)]
    pub fill: Fill,
    #[serde(default)]
    pub border: Border,
    #[serde(default)]
    pub alignment: Alignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_format: Option<String>,
}

impl Style {
    pub fn with_font(mut self, font: Font) -> Self {
        self.font = font;
        self
    }

    pub fn with_fill(mut self, fill: Fill) -> Self {
        self.fill = fill;
        self
    }

    pub fn with_border(mut self, border: Border) -> Self {
        self.border = border;
        self
    }

    pub fn with_alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_number_format(mut self, code: impl Into<String>) -> Self {
        self.number_format = normalize_number_format(Some(code.into()));
        self
    }
}

/// Partial style edit layered over a cell's current format.
///
/// Components left as `None` keep whatever the cell already has.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct StylePatch {
    #[serde(default)]
    pub font: Option<FontPatch>,
    #[serde(default)]
    pub fill: Option<Fill>,
    #[serde(default)]
    pub border: Option<Border>,
    #[serde(default)]
    pub alignment: Option<Alignment>,
    /// `Some("General")` resets to the default format.
    #[serde(default)]
    pub number_format: Option<String>,
}

impl StylePatch {
    pub fn is_empty(&self) -> bool {
        self.font.is_none()
            && self.fill.is_none()
            && self.border.is_none()
            && self.alignment.is_none()
            && self.number_format.is_none()
    }

    pub fn font(mut self, font: FontPatch) -> Self {
        self.font = Some(font);
        self
    }

    pub fn fill(mut self, fill: Fill) -> Self {
        self.fill = Some(fill);
        self
    }

    pub fn border(mut self, border: Border) -> Self {
        self.border = Some(border);
        self
    }

    pub fn alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = Some(alignment);
        self
    }

    pub fn number_format(mut self, code: impl Into<String>) -> Self {
        self.number_format = Some(code.into());
        self
    }

    /// Merge a later patch over this one; later components win.
    pub fn merged_with(mut self, later: StylePatch) -> Self {
        if let Some(font) = later.font {
            self.font = Some(match self.font.take() {
                Some(earlier) => FontPatch {
                    name: font.name.or(earlier.name),
                    size_pt: font.size_pt.or(earlier.size_pt),
                    bold: font.bold.or(earlier.bold),
                    italic: font.italic.or(earlier.italic),
                    underline: font.underline.or(earlier.underline),
                    strike: font.strike.or(earlier.strike),
                    color: font.color.or(earlier.color),
                },
                None => font,
            });
        }
        if later.fill.is_some() {
            self.fill = later.fill;
        }
        if later.border.is_some() {
            self.border = later.border;
        }
        if later.alignment.is_some() {
            self.alignment = later.alignment;
        }
        if later.number_format.is_some() {
            self.number_format = later.number_format;
        }
        self
    }

    /// Overlay this patch on `base`.
    pub fn apply(&self, base: &Style) -> Style {
        let mut style = base.clone();
        if let Some(font) = &self.font {
            style.font = font.apply(&base.font);
        }
        if let Some(fill) = &self.fill {
            style.fill = fill.clone();
        }
        if let Some(border) = &self.border {
            style.border = border.clone();
        }
        if let Some(alignment) = &self.alignment {
            style.alignment = alignment.clone();
        }
        if let Some(code) = &self.number_format {
            style.number_format = normalize_number_format(Some(code.clone()));
        }
        style
    }
}

fn normalize_number_format(code: Option<String>) -> Option<String> {
    code.filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("general"))
}
