//! Attribute merge policies and status canonicalization.
//!
//! `merge_attributes` is the only place attribute values of an existing
//! entity are combined with a new observation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use onemap_core::Attributes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The newest observation replaces the stored value; an empty observation clears it.
    #[default]
    LatestWins,
    /// The newest non-empty observation replaces the stored value.
    NonEmptyWins,
    /// The first observed value is kept forever.
    PreserveFirst,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPolicies {
    pub default: MergePolicy,
    pub fields: BTreeMap<String, MergePolicy>,
}

impl FieldPolicies {
    pub fn with_field(mut self, field: &str, policy: MergePolicy) -> Self {
        self.fields.insert(field.to_string(), policy);
        self
    }

    pub fn policy_for(&self, field: &str) -> MergePolicy {
        self.fields.get(field).copied().unwrap_or(self.default)
    }
}

/// Folds `incoming` into `current`. Fields missing from `incoming` were not
/// observed and stay as they are. Returns whether `current` changed.
pub fn merge_attributes(current: &mut Attributes, incoming: &Attributes, policies: &FieldPolicies) -> bool {
    let mut changed = false;
    for (field, value) in incoming {
        let value = value.trim();
        match policies.policy_for(field) {
            MergePolicy::LatestWins if value.is_empty() => {
                changed |= current.remove(field).is_some();
            }
            MergePolicy::LatestWins | MergePolicy::NonEmptyWins => {
                if value.is_empty() || current.get(field).map(String::as_str) == Some(value) {
                    continue;
                }
                current.insert(field.clone(), value.to_string());
                changed = true;
            }
            MergePolicy::PreserveFirst => {
                if value.is_empty() || current.contains_key(field) {
                    continue;
                }
                current.insert(field.clone(), value.to_string());
                changed = true;
            }
        }
    }
    changed
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalizationMode {
    #[default]
    Exact,
    Trim,
    TrimCaseFold,
}

/// Decides whether two status strings denote the same status.
#[derive(Clone, Default)]
pub enum StatusCanonicalizer {
    #[default]
    Exact,
    Trim,
    TrimCaseFold,
    Custom(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl fmt::Debug for StatusCanonicalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => f.write_str("Exact"),
            Self::Trim => f.write_str("Trim"),
            Self::TrimCaseFold => f.write_str("TrimCaseFold"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<CanonicalizationMode> for StatusCanonicalizer {
    fn from(mode: CanonicalizationMode) -> Self {
        match mode {
            CanonicalizationMode::Exact => Self::Exact,
            CanonicalizationMode::Trim => Self::Trim,
            CanonicalizationMode::TrimCaseFold => Self::TrimCaseFold,
        }
    }
}

impl StatusCanonicalizer {
    pub fn custom(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub fn canonicalize(&self, status: &str) -> String {
        match self {
            Self::Exact => status.to_string(),
            Self::Trim => status.trim().to_string(),
            Self::TrimCaseFold => status.trim().to_lowercase(),
            Self::Custom(f) => f(status),
        }
    }

    pub fn same(&self, a: &str, b: &str) -> bool {
        match self {
            Self::Exact => a == b,
            _ => self.canonicalize(a) == self.canonicalize(b),
        }
    }
}
