//! Systematic identity and physical column naming
//!
//! A [`BranchNamer`] maps `(logical column, systematic)` to the physical
//! column the backend reads or writes. All naming policy lives here so the
//! rest of the crate never special-cases variations.

use std::collections::HashMap;
use std::fmt;

use crate::domain::error::NamingError;

/// One systematic variation. Nominal orders before every named variation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Systematic {
    Nominal,
    Variation(String),
}

impl Systematic {
    pub fn variation(name: impl Into<String>) -> Self {
        Systematic::Variation(name.into())
    }

    /// Interpret a user-facing label; `nominal_label` maps to [`Systematic::Nominal`].
    pub fn parse(label: &str, nominal_label: &str) -> Self {
        if label == nominal_label {
            Systematic::Nominal
        } else {
            Systematic::Variation(label.to_string())
        }
    }

    pub fn is_nominal(&self) -> bool {
        matches!(self, Systematic::Nominal)
    }

    /// User-facing label, with nominal rendered as `nominal_label`.
    pub fn label<'a>(&'a self, nominal_label: &'a str) -> &'a str {
        match self {
            Systematic::Nominal => nominal_label,
            Systematic::Variation(name) => name,
        }
    }
}

impl fmt::Display for Systematic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label("nominal"))
    }
}

/// Naming policy: `(logical, systematic) -> physical`.
///
/// Implementations must be deterministic and pure. The validation hooks are
/// run once per schedule build, never per lookup.
pub trait BranchNamer: Send + Sync + fmt::Debug {
    fn physical_name(&self, logical: &str, systematic: &Systematic) -> String;

    /// Inverse of [`physical_name`](Self::physical_name) for dataset columns.
    fn parse_physical(&self, physical: &str) -> Result<(String, Systematic), NamingError>;

    fn validate_systematic(&self, _name: &str) -> Result<(), NamingError> {
        Ok(())
    }

    fn validate_logical(&self, _name: &str) -> Result<(), NamingError> {
        Ok(())
    }
}

/// Nominal naming only: every systematic reads and writes the logical name.
#[derive(Debug, Clone, Default)]
pub struct DefaultNamer;

impl BranchNamer for DefaultNamer {
    fn physical_name(&self, logical: &str, _systematic: &Systematic) -> String {
        logical.to_string()
    }

    fn parse_physical(&self, physical: &str) -> Result<(String, Systematic), NamingError> {
        Ok((physical.to_string(), Systematic::Nominal))
    }
}

/// Variation-aware naming: `jet_pt` / `jet_pt__JES_up` (or `JES_up__jet_pt`).
///
/// Names must be identifiers, must not contain the separator and must not
/// start or end with a separator character. Under those rules the split of
/// a physical name into logical part and systematic is unique, so distinct
/// pairs never collide and nominal names never look like variations.
#[derive(Debug, Clone)]
pub struct ScheduleNamer {
    separator: String,
    systematic_first: bool,
}

pub const DEFAULT_SEPARATOR: &str = "__";

impl Default for ScheduleNamer {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR, false)
    }
}

impl ScheduleNamer {
    pub fn new(separator: impl Into<String>, systematic_first: bool) -> Self {
        let separator = separator.into();
        let separator = if separator.is_empty() {
            DEFAULT_SEPARATOR.to_string()
        } else {
            separator
        };
        Self {
            separator,
            systematic_first,
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    fn policy_violation(&self, name: &str) -> Option<String> {
        if name.is_empty() {
            return Some("name is empty".to_string());
        }
        if !is_identifier(name) {
            return Some("only ASCII letters, digits and '_' are allowed".to_string());
        }
        if name.contains(&self.separator) {
            return Some(format!("contains the separator '{}'", self.separator));
        }
        let touches = |c: Option<char>| c.is_some_and(|c| self.separator.contains(c));
        if touches(name.chars().next()) || touches(name.chars().last()) {
            return Some(format!(
                "starts or ends with a character of the separator '{}'",
                self.separator
            ));
        }
        None
    }
}

impl BranchNamer for ScheduleNamer {
    fn physical_name(&self, logical: &str, systematic: &Systematic) -> String {
        match systematic {
            Systematic::Nominal => logical.to_string(),
            Systematic::Variation(syst) if self.systematic_first => {
                format!("{syst}{}{logical}", self.separator)
            }
            Systematic::Variation(syst) => format!("{logical}{}{syst}", self.separator),
        }
    }

    fn parse_physical(&self, physical: &str) -> Result<(String, Systematic), NamingError> {
        let Some((head, tail)) = physical.split_once(&self.separator) else {
            self.validate_logical(physical)?;
            return Ok((physical.to_string(), Systematic::Nominal));
        };
        let (logical, syst) = if self.systematic_first {
            (tail, head)
        } else {
            (head, tail)
        };
        self.validate_logical(logical)?;
        self.validate_systematic(syst)?;
        Ok((logical.to_string(), Systematic::variation(syst)))
    }

    fn validate_systematic(&self, name: &str) -> Result<(), NamingError> {
        match self.policy_violation(name) {
            Some(reason) => Err(NamingError::InvalidSystematic {
                name: name.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn validate_logical(&self, name: &str) -> Result<(), NamingError> {
        match self.policy_violation(name) {
            Some(reason) => Err(NamingError::InvalidColumn {
                name: name.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Build-time collision check over every physical name a schedule assigns.
///
/// The same `(logical, systematic)` may be registered repeatedly (one column
/// defined on several branches), but one physical name must never serve two
/// different pairs, and defined columns must not shadow dataset columns.
#[derive(Debug, Default)]
pub struct NameRegistry {
    assigned: HashMap<String, (String, Systematic)>,
    dataset: HashMap<String, String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a column read straight from the dataset under `owner`'s name.
    pub fn register_dataset(&mut self, physical: &str, owner: &str) {
        self.dataset
            .entry(physical.to_string())
            .or_insert_with(|| owner.to_string());
    }

    pub fn register(
        &mut self,
        physical: &str,
        logical: &str,
        systematic: &Systematic,
    ) -> Result<(), NamingError> {
        if let Some(owner) = self.dataset.get(physical) {
            return Err(NamingError::Collision {
                physical: physical.to_string(),
                first: format!("dataset column of '{owner}'"),
                second: format!("'{logical}' under '{systematic}'"),
            });
        }
        match self.assigned.get(physical) {
            Some((l, s)) if l == logical && s == systematic => Ok(()),
            Some((l, s)) => Err(NamingError::Collision {
                physical: physical.to_string(),
                first: format!("'{l}' under '{s}'"),
                second: format!("'{logical}' under '{systematic}'"),
            }),
            None => {
                self.assigned.insert(
                    physical.to_string(),
                    (logical.to_string(), systematic.clone()),
                );
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}
