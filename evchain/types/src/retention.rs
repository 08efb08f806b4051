use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::canonical::{canonical_json, CanonicalJsonError};
use crate::guid::Guid;
use crate::identity::Principal;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetentionPolicyError {
    #[error("no filters defined")]
    NoFilters,
    #[error("only one count filter can be defined")]
    MultipleCountFilters,
    #[error("count filter volume must be greater than 0")]
    CountFilterZeroVolume,
    #[error("count filter cannot have a retention period")]
    CountFilterWithPeriod,
    #[error("count filter requires a rule group of 'global' or 'principal'")]
    CountFilterMissingRuleGroup,
    #[error("timestamp filter retention period must be greater than 0")]
    TimestampFilterZeroPeriod,
    #[error("timestamp filter cannot have a volume")]
    TimestampFilterWithVolume,
    #[error("timestamp filter cannot have a non-global rule group")]
    TimestampFilterRuleGroup,
}

/// How a count filter buckets events before applying its volume cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleGroup {
    Global,
    Principal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    Timestamp,
    Count,
}

/// Which events a filter applies to. Empty match rules apply to everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    pub channel: Option<String>,
    pub event_id: Option<u32>,
    #[serde(rename = "provider")]
    pub provider_guid: Option<Guid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAction {
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    pub rule_group: Option<RuleGroup>,
    /// Used by timestamp filters. Zero means unset.
    #[serde(default)]
    pub retention_period_secs: u64,
    /// Used by count filters. Zero means unset.
    #[serde(default)]
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionFilter {
    pub label: String,
    #[serde(rename = "match")]
    pub match_rule: MatchRule,
    pub policy: PolicyAction,
}

/// Ordered list of retention filters. Set once on chain, immutable after.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub filters: Vec<RetentionFilter>,
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), RetentionPolicyError> {
        if self.filters.is_empty() {
            return Err(RetentionPolicyError::NoFilters);
        }

        let mut has_count_filter = false;
        for filter in &self.filters {
            match filter.policy.policy_type {
                PolicyType::Count => {
                    if has_count_filter {
                        return Err(RetentionPolicyError::MultipleCountFilters);
                    }
                    has_count_filter = true;

                    if filter.policy.volume == 0 {
                        return Err(RetentionPolicyError::CountFilterZeroVolume);
                    }
                    if filter.policy.retention_period_secs != 0 {
                        return Err(RetentionPolicyError::CountFilterWithPeriod);
                    }
                    if filter.policy.rule_group.is_none() {
                        return Err(RetentionPolicyError::CountFilterMissingRuleGroup);
                    }
                }
                PolicyType::Timestamp => {
                    if filter.policy.retention_period_secs == 0 {
                        return Err(RetentionPolicyError::TimestampFilterZeroPeriod);
                    }
                    if filter.policy.volume != 0 {
                        return Err(RetentionPolicyError::TimestampFilterWithVolume);
                    }
                    if matches!(filter.policy.rule_group, Some(RuleGroup::Principal)) {
                        return Err(RetentionPolicyError::TimestampFilterRuleGroup);
                    }
                }
            }
        }

        Ok(())
    }
}

/// The singleton retention policy plus authorship metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPolicy {
    pub policy: RetentionPolicy,
    pub author: Principal,
    pub applied_at: DateTime<Utc>,
}

/// Structural hash of an optional stored policy, used as the retention
/// sub-app's root: first eight bytes of the SHA-256 over the canonical JSON
/// of the value (the nil value hashes too, so an unset policy still has a
/// well-defined root).
pub fn policy_structural_hash(
    policy: &Option<StoredPolicy>,
) -> Result<u64, CanonicalJsonError> {
    let bytes = canonical_json(policy)?;
    let digest: [u8; 32] = Sha256::digest(&bytes).into();
    Ok(u64::from_le_bytes(digest[..8].try_into().expect("8 bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timestamp_filter(label: &str, secs: u64) -> RetentionFilter {
        RetentionFilter {
            label: label.into(),
            match_rule: MatchRule::default(),
            policy: PolicyAction {
                policy_type: PolicyType::Timestamp,
                rule_group: None,
                retention_period_secs: secs,
                volume: 0,
            },
        }
    }

    fn count_filter(label: &str, volume: u64, group: RuleGroup) -> RetentionFilter {
        RetentionFilter {
            label: label.into(),
            match_rule: MatchRule::default(),
            policy: PolicyAction {
                policy_type: PolicyType::Count,
                rule_group: Some(group),
                retention_period_secs: 0,
                volume,
            },
        }
    }

    #[test]
    fn accepts_mixed_valid_policy() {
        let policy = RetentionPolicy {
            filters: vec![
                timestamp_filter("security-90d", 90 * 24 * 3600),
                count_filter("cap", 10_000, RuleGroup::Principal),
            ],
        };
        assert_eq!(policy.validate(), Ok(()));
    }

    #[test]
    fn rejects_empty_policy() {
        assert_eq!(
            RetentionPolicy::default().validate(),
            Err(RetentionPolicyError::NoFilters)
        );
    }

    #[test]
    fn rejects_second_count_filter() {
        let policy = RetentionPolicy {
            filters: vec![
                count_filter("a", 10, RuleGroup::Global),
                count_filter("b", 10, RuleGroup::Global),
            ],
        };
        assert_eq!(
            policy.validate(),
            Err(RetentionPolicyError::MultipleCountFilters)
        );
    }

    #[test]
    fn rejects_zero_volume_count_filter() {
        let policy = RetentionPolicy {
            filters: vec![count_filter("a", 0, RuleGroup::Global)],
        };
        assert_eq!(
            policy.validate(),
            Err(RetentionPolicyError::CountFilterZeroVolume)
        );
    }

    #[test]
    fn rejects_timestamp_filter_with_volume_or_group() {
        let mut with_volume = timestamp_filter("a", 60);
        with_volume.policy.volume = 5;
        assert_eq!(
            RetentionPolicy {
                filters: vec![with_volume]
            }
            .validate(),
            Err(RetentionPolicyError::TimestampFilterWithVolume)
        );

        let mut with_group = timestamp_filter("b", 60);
        with_group.policy.rule_group = Some(RuleGroup::Principal);
        assert_eq!(
            RetentionPolicy {
                filters: vec![with_group]
            }
            .validate(),
            Err(RetentionPolicyError::TimestampFilterRuleGroup)
        );
    }

    #[test]
    fn structural_hash_distinguishes_unset_from_set() {
        let unset = policy_structural_hash(&None).unwrap();
        let set = policy_structural_hash(&Some(StoredPolicy {
            policy: RetentionPolicy {
                filters: vec![timestamp_filter("a", 60)],
            },
            author: Principal::new("admin").unwrap(),
            applied_at: DateTime::from_timestamp(0, 0).unwrap(),
        }))
        .unwrap();
        assert_ne!(unset, set);
        assert_eq!(unset, policy_structural_hash(&None).unwrap());
    }
}
