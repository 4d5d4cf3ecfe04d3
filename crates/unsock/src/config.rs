//! Environment channel between the loader and the preloaded core.
//!
//! The loader encodes the validated rule list as JSON into `__UNSOCK_RULES`
//! and a verbosity integer into `__UNSOCK_VERBOSITY` before exec'ing the
//! target. The core only ever reads these.

use crate::error::RuleError;
use crate::rule::RuleSet;

/// Environment variable carrying the JSON rule list.
pub const RULES_ENV: &str = "__UNSOCK_RULES";

/// Environment variable carrying the verbosity level (0 = errors only).
pub const VERBOSITY_ENV: &str = "__UNSOCK_VERBOSITY";

/// Decode the rule list from the environment. An unset or empty variable
/// yields an empty set (nothing is intercepted).
pub fn rules_from_env() -> Result<RuleSet, RuleError> {
    match std::env::var(RULES_ENV) {
        Ok(raw) if !raw.trim().is_empty() => RuleSet::decode(&raw),
        _ => Ok(RuleSet::empty()),
    }
}

/// Verbosity from the environment; malformed values fall back to 0.
#[must_use]
pub fn verbosity_from_env() -> u8 {
    std::env::var(VERBOSITY_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}
