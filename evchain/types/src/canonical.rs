use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    #[error("canonical encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serializes a value to canonical JSON bytes: object keys in sorted order,
/// integers in plain decimal, no insignificant whitespace.
///
/// Every hash that replicas must agree on (event ids, off-chain payload
/// hashes, the retention policy structural hash) is computed over this
/// encoding, so it must stay byte-stable across versions.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    // Round-tripping through `Value` sorts object keys: serde_json's map is
    // BTreeMap-backed unless the preserve_order feature is enabled.
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Unordered {
        zebra: u32,
        alpha: &'static str,
        middle: Option<u32>,
    }

    #[test]
    fn sorts_object_keys() {
        let bytes = canonical_json(&Unordered {
            zebra: 1,
            alpha: "a",
            middle: None,
        })
        .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":"a","middle":null,"zebra":1}"#
        );
    }

    #[test]
    fn stable_across_invocations() {
        let value = Unordered {
            zebra: 42,
            alpha: "x",
            middle: Some(7),
        };
        assert_eq!(canonical_json(&value).unwrap(), canonical_json(&value).unwrap());
    }
}
