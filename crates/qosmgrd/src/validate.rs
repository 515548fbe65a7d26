//! Pure field validators for macro values
//!
//! Each validator takes the raw value (if the macro was present at all), a
//! human-readable context for diagnostics, and reports its outcome as a
//! [`Validated`] value. Problems are logged through the injected
//! [`Diagnostics`] sink and never returned as errors.

use once_cell::sync::Lazy;
use qosmgr_common::{Diagnostics, Severity};
use regex::Regex;

use crate::tables::defaults::MAX_PRIORITY;
use crate::types::{ClassId, Rate};

/// `<number>[.<fraction>] [whitespace] bit|kbit|mbit|gbit`, case-insensitive
static RATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9]+(\.[0-9]+)?\s*(kbit|mbit|gbit|bit)$").expect("Invalid regex pattern")
});

const HEX_PREFIX: &str = "0x";

/// Outcome of validating one field or one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validated<T> {
    /// The value was present and well-formed
    Valid(T),
    /// The value was absent or malformed and a default was substituted
    Defaulted { value: T, reason: String },
    /// The value was absent and has no default
    Missing,
    /// The value was present but malformed and has no default
    Rejected { reason: String },
}

impl<T> Validated<T> {
    /// Returns the usable value, if any.
    pub fn value(self) -> Option<T> {
        match self {
            Validated::Valid(v) | Validated::Defaulted { value: v, .. } => Some(v),
            Validated::Missing | Validated::Rejected { .. } => None,
        }
    }

    pub fn as_ref(&self) -> Option<&T> {
        match self {
            Validated::Valid(v) | Validated::Defaulted { value: v, .. } => Some(v),
            Validated::Missing | Validated::Rejected { .. } => None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.as_ref().is_some()
    }
}

/// How much a field matters to its owning unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Absence or invalidity drops the owning unit
    Critical,
    /// Absence or invalidity degrades to a default or drops only a sub-unit
    Optional,
}

impl Criticality {
    /// Severity used when the field fails validation
    pub fn severity(&self) -> Severity {
        match self {
            Criticality::Critical => Severity::Error,
            Criticality::Optional => Severity::Warning,
        }
    }
}

fn reject<T>(diag: &mut Diagnostics, severity: Severity, reason: String) -> Validated<T> {
    diag.record(severity, reason.clone());
    Validated::Rejected { reason }
}

/// Validates a rate or ceiling such as `10mbit` or `10.5 mbit`.
///
/// The input string is kept unchanged on success.
pub fn validate_rate(
    raw: Option<&str>,
    context: &str,
    criticality: Criticality,
    diag: &mut Diagnostics,
) -> Validated<Rate> {
    let Some(value) = raw else {
        return Validated::Missing;
    };

    if RATE_RE.is_match(value) {
        Validated::Valid(Rate::new_unchecked(value))
    } else {
        reject(
            diag,
            criticality.severity(),
            format!("Invalid bandwidth format/unit for {}: '{}'", context, value),
        )
    }
}

/// Validates a priority in `[0, 15]`, substituting `default` when the value
/// is absent, unparsable or out of range.
pub fn validate_priority(
    raw: Option<&str>,
    context: &str,
    default: u8,
    diag: &mut Diagnostics,
) -> Validated<u8> {
    let Some(value) = raw else {
        return Validated::Defaulted {
            value: default,
            reason: format!("{} not set", context),
        };
    };

    match value.trim().parse::<i64>() {
        Ok(prio) if (0..=MAX_PRIORITY).contains(&prio) => Validated::Valid(prio as u8),
        Ok(_) => {
            let reason = format!(
                "Priority '{}' for {} out of range (0-{}). Using default {}",
                value, context, MAX_PRIORITY, default
            );
            diag.warning(reason.clone());
            Validated::Defaulted {
                value: default,
                reason,
            }
        }
        Err(_) => {
            let reason = format!(
                "Invalid priority value '{}' for {}. Using default {}",
                value, context, default
            );
            diag.warning(reason.clone());
            Validated::Defaulted {
                value: default,
                reason,
            }
        }
    }
}

/// Validates a firewall mark written as hexadecimal with a `0x` prefix.
pub fn validate_mark(raw: Option<&str>, context: &str, diag: &mut Diagnostics) -> Validated<u32> {
    let Some(value) = raw else {
        return Validated::Missing;
    };

    let trimmed = value.trim();
    let has_prefix = trimmed
        .get(..HEX_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(HEX_PREFIX));
    if !has_prefix {
        return reject(
            diag,
            Severity::Error,
            format!(
                "Invalid mark for {}: '{}' (must be a hex string, e.g. '0x10')",
                context, value
            ),
        );
    }

    let digits = &trimmed[HEX_PREFIX.len()..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return reject(
            diag,
            Severity::Error,
            format!("Invalid hexadecimal mark for {}: '{}'", context, value),
        );
    }

    match u32::from_str_radix(digits, 16) {
        Ok(mark) => Validated::Valid(mark),
        Err(_) => reject(
            diag,
            Severity::Error,
            format!("Mark for {} does not fit in 32 bits: '{}'", context, value),
        ),
    }
}

/// Validates a class id suffix (all ASCII digits).
pub fn validate_suffix(
    raw: Option<&str>,
    context: &str,
    diag: &mut Diagnostics,
) -> Validated<String> {
    let Some(value) = raw else {
        return Validated::Missing;
    };

    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        Validated::Valid(value.to_string())
    } else {
        reject(
            diag,
            Severity::Error,
            format!(
                "Invalid class_id_suffix for {}: '{}' (must be numeric)",
                context, value
            ),
        )
    }
}

/// Validates a `major:minor` class id with a numeric minor.
pub fn validate_class_id(
    raw: Option<&str>,
    context: &str,
    diag: &mut Diagnostics,
) -> Validated<ClassId> {
    let Some(value) = raw else {
        return Validated::Missing;
    };

    match value.parse::<ClassId>() {
        Ok(id) => Validated::Valid(id),
        Err(e) => reject(diag, Severity::Error, format!("{} for {}", e, context)),
    }
}
