//! Core value types for the wolfxl workbook engine.
//!
//! Everything here is plain data: coordinates, cell values, style records, and
//! defined names. Package I/O lives in `wolfxl-xlsx`.

mod address;
mod date;
mod names;
mod number_format;
mod style;
mod value;

pub use address::{
    column_index, column_letters, A1ParseError, CellRef, IntoCellRef, Range, RangeParseError,
    EXCEL_MAX_COLS, EXCEL_MAX_ROWS,
};
pub use date::{datetime_to_serial, serial_to_datetime, DateSystem};
pub use names::{DefinedName, NameError, NameScope, PRINT_AREA_NAME};
pub use number_format::{
    builtin_format_code, builtin_format_id, is_builtin_date_format, is_date_format_code,
    FIRST_CUSTOM_NUMFMT_ID,
};
pub use style::{
    Alignment, Border, BorderEdge, BorderStyle, Color, Fill, Font, FontPatch,
    HorizontalAlignment, PatternType, Style, StylePatch, Underline, VerticalAlignment,
};
pub use value::{CellValue, ErrorValue, Formula};
