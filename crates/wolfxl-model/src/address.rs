use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of rows in an OOXML worksheet.
pub const EXCEL_MAX_ROWS: u32 = 1_048_576;
/// Number of columns in an OOXML worksheet (`XFD`).
pub const EXCEL_MAX_COLS: u32 = 16_384;

/// A reference to a single cell within a worksheet.
///
/// Rows and columns are **1-based**, matching what users see:
/// - `row = 1` is the first row
/// - `col = 1` is column `A`
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    /// Construct a new [`CellRef`], validating both coordinates.
    pub fn new(row: u32, col: u32) -> Result<Self, A1ParseError> {
        if row == 0 || row > EXCEL_MAX_ROWS {
            return Err(A1ParseError::InvalidRow);
        }
        if col == 0 || col > EXCEL_MAX_COLS {
            return Err(A1ParseError::InvalidColumn);
        }
        Ok(Self { row, col })
    }

    /// Convert to A1 notation (e.g. `A1`, `BC32`).
    pub fn to_a1(self) -> String {
        format!("{}{}", column_letters(self.col), self.row)
    }

    /// Absolute A1 notation (`$A$1`), as used in defined names.
    pub fn to_absolute_a1(self) -> String {
        format!("${}${}", column_letters(self.col), self.row)
    }

    /// Parse an A1-style reference (e.g. `A1`, `$B$2`).
    pub fn from_a1(a1: &str) -> Result<Self, A1ParseError> {
        let s = a1.trim();
        if s.is_empty() {
            return Err(A1ParseError::Empty);
        }

        let bytes = s.as_bytes();
        let mut idx = 0usize;
        if bytes.get(idx) == Some(&b'$') {
            idx += 1;
        }

        let col_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_alphabetic() {
            idx += 1;
        }
        if idx == col_start {
            return Err(A1ParseError::MissingColumn);
        }
        let col_str = &s[col_start..idx];

        if bytes.get(idx) == Some(&b'$') {
            idx += 1;
        }

        let row_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if idx == row_start {
            return Err(A1ParseError::MissingRow);
        }
        if idx != bytes.len() {
            return Err(A1ParseError::TrailingCharacters);
        }

        let col = column_index(col_str)?;
        let row: u32 = s[row_start..idx]
            .parse()
            .map_err(|_| A1ParseError::InvalidRow)?;
        Self::new(row, col)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

/// Convert a 1-based column index to its letters (`1 -> A`, `28 -> AB`).
pub fn column_letters(col: u32) -> String {
    let mut n = col;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Convert column letters to a 1-based index (`A -> 1`, `xfd -> 16384`).
pub fn column_index(letters: &str) -> Result<u32, A1ParseError> {
    let letters = letters.trim();
    if letters.is_empty() {
        return Err(A1ParseError::MissingColumn);
    }
    let mut col: u32 = 0;
    for b in letters.bytes() {
        if !b.is_ascii_alphabetic() {
            return Err(A1ParseError::InvalidColumn);
        }
        let v = (b.to_ascii_uppercase() - b'A') as u32 + 1;
        col = col
            .checked_mul(26)
            .and_then(|c| c.checked_add(v))
            .ok_or(A1ParseError::InvalidColumn)?;
        if col > EXCEL_MAX_COLS {
            return Err(A1ParseError::InvalidColumn);
        }
    }
    Ok(col)
}

/// Anything that names a single cell: `"B3"`, `(3, 2)`, `(3, "B")`, or a [`CellRef`].
pub trait IntoCellRef {
    fn into_cell_ref(self) -> Result<CellRef, A1ParseError>;
}

impl IntoCellRef for CellRef {
    fn into_cell_ref(self) -> Result<CellRef, A1ParseError> {
        Ok(self)
    }
}

impl IntoCellRef for &str {
    fn into_cell_ref(self) -> Result<CellRef, A1ParseError> {
        CellRef::from_a1(self)
    }
}

impl IntoCellRef for &String {
    fn into_cell_ref(self) -> Result<CellRef, A1ParseError> {
        CellRef::from_a1(self)
    }
}

impl IntoCellRef for (u32, u32) {
    fn into_cell_ref(self) -> Result<CellRef, A1ParseError> {
        CellRef::new(self.0, self.1)
    }
}

impl IntoCellRef for (u32, &str) {
    fn into_cell_ref(self) -> Result<CellRef, A1ParseError> {
        CellRef::new(self.0, column_index(self.1)?)
    }
}

/// A rectangular region within a worksheet.
///
/// The range is inclusive and always normalized so that `start` is the top-left corner.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: CellRef,
    pub end: CellRef,
}

impl Range {
    /// Construct a new range, normalizing corners if needed.
    pub fn new(a: CellRef, b: CellRef) -> Self {
        Self {
            start: CellRef {
                row: a.row.min(b.row),
                col: a.col.min(b.col),
            },
            end: CellRef {
                row: a.row.max(b.row),
                col: a.col.max(b.col),
            },
        }
    }

    pub fn single(cell: CellRef) -> Self {
        Self {
            start: cell,
            end: cell,
        }
    }

    #[inline]
    pub fn contains(&self, cell: CellRef) -> bool {
        cell.row >= self.start.row
            && cell.row <= self.end.row
            && cell.col >= self.start.col
            && cell.col <= self.end.col
    }

    #[inline]
    pub fn intersects(&self, other: &Range) -> bool {
        self.start.row <= other.end.row
            && other.start.row <= self.end.row
            && self.start.col <= other.end.col
            && other.start.col <= self.end.col
    }

    /// Smallest range covering both `self` and `other`.
    pub fn union(&self, other: &Range) -> Range {
        Range {
            start: CellRef {
                row: self.start.row.min(other.start.row),
                col: self.start.col.min(other.start.col),
            },
            end: CellRef {
                row: self.end.row.max(other.end.row),
                col: self.end.col.max(other.end.col),
            },
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    #[inline]
    pub fn is_single_cell(&self) -> bool {
        self.start == self.end
    }

    /// Absolute form (`$A$1:$C$3`), as stored in defined names.
    pub fn to_absolute_a1(&self) -> String {
        if self.is_single_cell() {
            self.start.to_absolute_a1()
        } else {
            format!("{}:{}", self.start.to_absolute_a1(), self.end.to_absolute_a1())
        }
    }

    /// Parse `A1:B2`, a single cell like `C3`, or whole-column / whole-row spans
    /// such as `$A:$C` and `$1:$5`.
    pub fn from_a1(a1: &str) -> Result<Self, RangeParseError> {
        let s = a1.trim();
        if s.is_empty() {
            return Err(RangeParseError::Empty);
        }

        match s.split_once(':') {
            None => {
                let cell = CellRef::from_a1(s)?;
                Ok(Range::single(cell))
            }
            Some((a, b)) => {
                if let (Some(a), Some(b)) = (whole_column(a), whole_column(b)) {
                    let (start, end) = (a?, b?);
                    return Ok(Range::new(
                        CellRef { row: 1, col: start },
                        CellRef {
                            row: EXCEL_MAX_ROWS,
                            col: end,
                        },
                    ));
                }
                if let (Some(a), Some(b)) = (whole_row(a), whole_row(b)) {
                    let (start, end) = (a?, b?);
                    return Ok(Range::new(
                        CellRef { row: start, col: 1 },
                        CellRef {
                            row: end,
                            col: EXCEL_MAX_COLS,
                        },
                    ));
                }
                let start = CellRef::from_a1(a)?;
                let end = CellRef::from_a1(b)?;
                Ok(Range::new(start, end))
            }
        }
    }

    /// Cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        (self.start.row..=self.end.row).flat_map(move |row| {
            (self.start.col..=self.end.col).map(move |col| CellRef { row, col })
        })
    }
}

fn whole_column(s: &str) -> Option<Result<u32, A1ParseError>> {
    let s = s.trim().trim_start_matches('$');
    (!s.is_empty() && s.bytes().all(|b| b.is_ascii_alphabetic())).then(|| column_index(s))
}

fn whole_row(s: &str) -> Option<Result<u32, A1ParseError>> {
    let s = s.trim().trim_start_matches('$');
    (!s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())).then(|| {
        match s.parse::<u32>() {
            Ok(row) if (1..=EXCEL_MAX_ROWS).contains(&row) => Ok(row),
            _ => Err(A1ParseError::InvalidRow),
        }
    })
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_cell() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// Errors that can occur when parsing an A1 cell reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum A1ParseError {
    #[error("empty A1 reference")]
    Empty,
    #[error("missing column in A1 reference")]
    MissingColumn,
    #[error("missing row in A1 reference")]
    MissingRow,
    #[error("invalid column in A1 reference")]
    InvalidColumn,
    #[error("invalid row in A1 reference")]
    InvalidRow,
    #[error("trailing characters in A1 reference")]
    TrailingCharacters,
}

/// Errors that can occur when parsing an A1 range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum RangeParseError {
    #[error("empty range")]
    Empty,
    #[error(transparent)]
    Cell(#[from] A1ParseError),
}
