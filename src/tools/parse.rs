use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::{Params, ToolError};

/// Deserialize `params` into the schema type `T`.
pub(crate) fn parse_params<T: DeserializeOwned>(tool: &str, params: &Params) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| ToolError::invalid(tool, e.to_string()))
}

/// The `action` discriminator, if present and a string.
pub(crate) fn action(params: &Params) -> Option<&str> {
    params.get("action").and_then(Value::as_str)
}

pub(crate) fn default_timeout_ms() -> u64 {
    30_000
}

/// A millisecond timeout given as any positive JSON number. Fractions round up.
pub(crate) fn positive_timeout_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let ms = f64::deserialize(deserializer)?;
    if !ms.is_finite() || ms <= 0.0 {
        return Err(D::Error::custom(format!("timeout must be a positive number, got {ms}")));
    }
    Ok(ms.ceil() as u64)
}

pub(crate) fn require_positive(tool: &str, field: &str, value: u64) -> Result<u64, ToolError> {
    if value == 0 {
        return Err(ToolError::invalid(tool, format!("{field} must be positive")));
    }
    Ok(value)
}
