use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Stable, opaque identity of a signed-in user as handed out by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidParticipantId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParticipantId::new(s)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = Error;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        ParticipantId::new(value)
    }
}

impl TryFrom<&str> for ParticipantId {
    type Error = Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        ParticipantId::new(value)
    }
}

impl AsRef<str> for ParticipantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use super::ParticipantId;

    #[test]
    fn rejects_blank_identity() {
        assert!(ParticipantId::new("").is_err());
        assert!(ParticipantId::new("   ").is_err());
        assert_eq!(ParticipantId::new("u1").unwrap().as_str(), "u1");
    }

    #[test]
    fn serializes_as_plain_string() -> anyhow::Result<()> {
        let id: ParticipantId = "abc".parse()?;
        assert_eq!(serde_json::to_string(&id)?, "\"abc\"");
        let back: ParticipantId = serde_json::from_str("\"abc\"")?;
        assert_eq!(back, id);
        Ok(())
    }
}
