use std::fmt;
use std::str::FromStr;

/// How often filesystem metadata and contents are hashed and compared,
/// measured in operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPeriods {
    pub metadata: u64,
    pub content: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PeriodsError {
    #[error("want 2 comma-separated ints, got {0} tokens")]
    TokenCount(usize),

    #[error("invalid period: {0}")]
    Parse(#[from] std::num::ParseIntError),

    #[error("both periods must be positive integers")]
    NonPositive,

    #[error("the content period must be a multiple of the metadata period")]
    NotMultiple,
}

impl HashPeriods {
    pub fn new(metadata: u64, content: u64) -> Result<Self, PeriodsError> {
        if metadata == 0 || content == 0 {
            return Err(PeriodsError::NonPositive);
        }
        if content % metadata != 0 {
            return Err(PeriodsError::NotMultiple);
        }
        Ok(HashPeriods { metadata, content })
    }

    /// Whether the digest after operation `id` includes metadata and
    /// whether it includes file contents.
    pub fn toggles(&self, id: u64) -> (bool, bool) {
        (id % self.metadata == 0, id % self.content == 0)
    }
}

impl Default for HashPeriods {
    fn default() -> Self {
        HashPeriods { metadata: 1, content: 250 }
    }
}

impl fmt::Display for HashPeriods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{metadata={},contents={}}}", self.metadata, self.content)
    }
}

impl FromStr for HashPeriods {
    type Err = PeriodsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 2 {
            return Err(PeriodsError::TokenCount(parts.len()));
        }
        HashPeriods::new(parts[0].parse()?, parts[1].parse()?)
    }
}
