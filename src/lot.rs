use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// ASCII letters and digits only
    Strict,
    /// Letters and digits, plus `-`, `_` and `.` after the first character
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LotPolicy {
    pub mode: ValidationMode,
    pub max_len: usize,
}

impl Default for LotPolicy {
    fn default() -> Self {
        Self {
            mode: ValidationMode::Strict,
            max_len: 32,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LotError {
    #[error("Lot number is required")]
    Missing,
    #[error("Lot number must be at most {max} characters")]
    TooLong { max: usize },
    #[error("Lot number contains characters that are not allowed")]
    InvalidCharacters,
}

/// A validated lot identifier, safe to substitute into outbound URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LotQuery(String);

impl LotQuery {
    pub fn parse(raw: &str, policy: &LotPolicy) -> Result<Self, LotError> {
        let lot = raw.trim();
        if lot.is_empty() {
            return Err(LotError::Missing);
        }
        if lot.chars().count() > policy.max_len {
            return Err(LotError::TooLong { max: policy.max_len });
        }

        let allowed = match policy.mode {
            ValidationMode::Strict => lot.chars().all(|c| c.is_ascii_alphanumeric()),
            ValidationMode::Lenient => {
                let mut chars = lot.chars();
                chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
                    && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            }
        };
        if !allowed {
            return Err(LotError::InvalidCharacters);
        }

        Ok(Self(lot.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LotQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
