use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use std::{fmt::Display, ops::Deref};
use ulid::Ulid;

/// Opaque item identifier. ULIDs are lexicographically sortable by creation
/// time, which keeps tie-breaking on equal similarity scores deterministic.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct Eid(String);

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(Ulid::new().to_string())
    }

    /// The 128-bit form, used by the embedding store's fixed-width records.
    pub fn as_u128(&self) -> Option<u128> {
        Ulid::from_string(&self.0).ok().map(u128::from)
    }

    pub fn from_u128(raw: u128) -> Eid {
        Eid(Ulid::from(raw).to_string())
    }
}

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Eid {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Eid(s.to_string()))
    }
}

impl Deref for Eid {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Eid {
    fn from(fr: &str) -> Self {
        Eid(fr.to_string())
    }
}

impl From<String> for Eid {
    fn from(fr: String) -> Self {
        Eid(fr)
    }
}

impl From<Eid> for String {
    fn from(fr: Eid) -> Self {
        fr.0
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u128_round_trip() {
        let eid = Eid::new();
        let raw = eid.as_u128().unwrap();
        assert_eq!(Eid::from_u128(raw), eid);
    }

    #[test]
    fn test_non_ulid_string_has_no_u128_form() {
        let eid = Eid::from("not-a-ulid");
        assert!(eid.as_u128().is_none());
    }
}
