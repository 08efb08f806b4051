use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Windows-style globally unique identifier. Serialized as `{uuid}` with
/// braces, matching the event log's own rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(Uuid);

impl Guid {
    pub fn new(uuid: Uuid) -> Self {
        Guid(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0)
    }
}

impl FromStr for Guid {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(value);
        Ok(Guid(Uuid::parse_str(trimmed)?))
    }
}

impl From<Uuid> for Guid {
    fn from(uuid: Uuid) -> Self {
        Guid(uuid)
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_braces() {
        let guid: Guid = "{69884110-5b41-41cc-93c7-02ce8e8882f6}".parse().unwrap();
        let encoded = serde_json::to_string(&guid).unwrap();
        assert_eq!(encoded, "\"{69884110-5b41-41cc-93c7-02ce8e8882f6}\"");
        let decoded: Guid = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, guid);
    }

    #[test]
    fn parses_without_braces() {
        let guid: Guid = "69884110-5b41-41cc-93c7-02ce8e8882f6".parse().unwrap();
        assert_eq!(
            guid.to_string(),
            "{69884110-5b41-41cc-93c7-02ce8e8882f6}"
        );
    }
}
