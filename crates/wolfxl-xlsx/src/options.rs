use serde::{Deserialize, Serialize};

/// Default maximum uncompressed size for any single part inflated into memory.
pub const DEFAULT_MAX_PART_BYTES: u64 = 256 * 1024 * 1024;
/// Default maximum number of entries in a package.
pub const DEFAULT_MAX_PARTS: usize = 100_000;

/// Guardrails against hostile containers (zip bombs, forged size fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageLimits {
    pub max_part_bytes: u64,
    pub max_parts: usize,
}

impl Default for PackageLimits {
    fn default() -> Self {
        Self {
            max_part_bytes: DEFAULT_MAX_PART_BYTES,
            max_parts: DEFAULT_MAX_PARTS,
        }
    }
}

/// How the writer makes consumers recalculate after formula edits.
///
/// Cached `<v>` results and `xl/calcChain.xml` go stale once a formula changes. By default
/// the writer leaves calculation metadata alone so a single-sheet edit only rewrites that
/// sheet; [`RecalcPolicy::RECALCULATE_ON_LOAD`] opts into both fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecalcPolicy {
    /// Set `<calcPr fullCalcOnLoad="1"/>` in `xl/workbook.xml`.
    pub force_full_calc_on_formula_change: bool,
    /// Remove `xl/calcChain.xml` together with its relationship and content type override.
    pub drop_calc_chain_on_formula_change: bool,
}

impl RecalcPolicy {
    /// Drop the calc chain and ask for a full calculation when any formula is written.
    pub const RECALCULATE_ON_LOAD: Self = Self {
        force_full_calc_on_formula_change: true,
        drop_calc_chain_on_formula_change: true,
    };
}

/// Storage chosen for a string written to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringPolicy {
    /// Follow the cell's existing form, then the sheet's convention, then the package's.
    #[default]
    MatchPart,
    /// Use the shared string table whenever the package has one.
    PreferShared,
    /// Always write inline strings.
    PreferInline,
}

/// Options fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenOptions {
    #[serde(default)]
    pub limits: PackageLimits,
    #[serde(default)]
    pub recalc: RecalcPolicy,
    #[serde(default)]
    pub strings: StringPolicy,
}

impl OpenOptions {
    pub fn with_limits(mut self, limits: PackageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_recalc_policy(mut self, recalc: RecalcPolicy) -> Self {
        self.recalc = recalc;
        self
    }

    pub fn with_string_policy(mut self, strings: StringPolicy) -> Self {
        self.strings = strings;
        self
    }
}
