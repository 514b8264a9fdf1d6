//! North American phone numbers, normalised to E.164.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Tolerates parentheses, dashes, dots, spaces and an optional `+1`/`1` prefix.
static PHONE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\d+])(?:\+?1[\s.\-]?)?\(?([2-9]\d{2})\)?[\s.\-]?(\d{3})[\s.\-]?(\d{4})(?:$|\D)")
        .expect("phone pattern compiles")
});

/// A validated phone number in canonical `+1NPAXXXXXXX` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Validate and normalise a number given on its own.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
        let allowed = input
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '(' | ')' | '-' | '.' | ' '));
        if !allowed {
            return Err(ValidationError::InvalidPhone);
        }
        let national = match digits.len() {
            10 => digits.as_str(),
            11 if digits.starts_with('1') => &digits[1..],
            _ => return Err(ValidationError::InvalidPhone),
        };
        // Area codes never start with 0 or 1.
        if national.as_bytes()[0] < b'2' {
            return Err(ValidationError::InvalidPhone);
        }
        Ok(Self(format!("+1{national}")))
    }

    /// Find the first phone number in free text.
    pub fn extract(text: &str) -> Option<Self> {
        let caps = PHONE_PATTERN.captures(text)?;
        Some(Self(format!("+1{}{}{}", &caps[1], &caps[2], &caps[3])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last four digits only, for logs.
    pub fn masked(&self) -> String {
        format!("***{}", &self.0[self.0.len() - 4..])
    }
}

impl std::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.masked())
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}
