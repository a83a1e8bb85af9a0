use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CellRef;

/// Built-in defined name holding a sheet's print area.
pub const PRINT_AREA_NAME: &str = "_xlnm.Print_Area";

/// Where a defined name is visible.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameScope {
    Workbook,
    /// Local to the named sheet (`localSheetId`).
    Sheet(String),
}

/// A `<definedName>` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinedName {
    pub name: String,
    pub scope: NameScope,
    /// Formula text without a leading `=` (e.g. `Sheet1!$A$1:$B$4`).
    pub refers_to: String,
    #[serde(default)]
    pub hidden: bool,
}

impl DefinedName {
    pub fn new(
        name: impl Into<String>,
        scope: NameScope,
        refers_to: impl Into<String>,
    ) -> Result<Self, NameError> {
        let name = name.into();
        validate_name(&name)?;
        let refers_to = refers_to.into();
        let refers_to = refers_to
            .strip_prefix('=')
            .map(str::to_string)
            .unwrap_or(refers_to);
        if refers_to.trim().is_empty() {
            return Err(NameError::EmptyReference);
        }
        Ok(Self {
            name,
            scope,
            refers_to,
            hidden: false,
        })
    }

    /// Names compare case-insensitively within a scope.
    pub fn key(&self) -> (String, NameScope) {
        (self.name.to_ascii_lowercase(), self.scope.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("defined name is empty")]
    Empty,
    #[error("defined name {0:?} contains invalid characters")]
    InvalidCharacters(String),
    #[error("defined name {0:?} collides with a cell reference")]
    LooksLikeCellReference(String),
    #[error("defined name refers to nothing")]
    EmptyReference,
}

fn validate_name(name: &str) -> Result<(), NameError> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(NameError::Empty);
    };
    if !(first.is_alphabetic() || first == '_' || first == '\\') {
        return Err(NameError::InvalidCharacters(name.to_string()));
    }
    if !chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '\\' | '?')) {
        return Err(NameError::InvalidCharacters(name.to_string()));
    }
    if CellRef::from_a1(name).is_ok() {
        return Err(NameError::LooksLikeCellReference(name.to_string()));
    }
    Ok(())
}
