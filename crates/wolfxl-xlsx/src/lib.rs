//! Surgical modify engine for XLSX packages.
//!
//! A [`Session`] opens an existing package, serves cell reads lazily from the
//! worksheet parts, and queues writes in a [`ChangeSet`]. Flushing regenerates only
//! the parts that changed and raw-copies everything else.
//!
//! ```no_run
//! use wolfxl_xlsx::Session;
//!
//! # fn main() -> Result<(), wolfxl_xlsx::XlsxError> {
//! let mut session = Session::open_modify("report.xlsx")?;
//! session.set_value("Summary", "B2", 42.0)?;
//! session.flush("report.xlsx")?;
//! # Ok(())
//! # }
//! ```

mod blank;
pub mod change_set;
pub mod classify;
mod error;
mod options;
mod package;
mod patch;
mod path;
mod persist;
pub mod relationships;
mod session;
pub mod shared_strings;
pub mod sheet;
pub mod styles;
pub mod workbook;
mod xml;

pub use change_set::{CellEdit, ChangeSet, ContentEdit, SheetEdits, StyleEdit};
pub use classify::{classify_package, classify_part, OpaqueKind, PartKind, PartPartition};
pub use error::{ErrorKind, XlsxError};
pub use options::{OpenOptions, PackageLimits, RecalcPolicy, StringPolicy};
pub use package::Package;
pub use patch::FlushSummary;
pub use session::{Cell, RowIter, Session, SessionMode};
pub use shared_strings::SharedStringTable;
pub use styles::{PoolSnapshot, StylePool};

pub use wolfxl_model as model;
pub use wolfxl_model::{CellRef, CellValue, Range, Style, StylePatch};
