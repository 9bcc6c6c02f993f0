//! String coercion helpers used while resolving configuration.

use std::fmt::Display;
use std::str::FromStr;

use crate::CoreError;

/// Trim `value` and return it, or `None` when nothing is left.
#[must_use]
pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Interpret common truthy/falsy spellings. Returns `None` for anything else.
#[must_use]
pub fn to_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a trimmed number, reporting `key` in the error.
///
/// # Errors
/// Returns [`CoreError::InvalidValue`] if `value` does not parse as `T`.
pub fn to_number<T>(key: &str, value: &str) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| CoreError::invalid(key, value, e))
}
