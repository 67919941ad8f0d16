//! Unique local names for new mirrors.
//!
//! Callers hold the `(kind keyword, "name")` lock around generation and the
//! insert that uses the name.

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::error::{Result, SyncError};
use crate::model::ResourceKind;
use crate::store::ResourceStore;

/// Lock key shared by every name allocation of a kind.
pub const NAME_LOCK_KEY: &str = "name";

#[derive(Debug, Clone, Copy)]
pub struct NamePolicy {
    pub retry_limit: usize,
    pub suffix_len: usize,
}

impl Default for NamePolicy {
    fn default() -> Self {
        Self {
            retry_limit: 20,
            suffix_len: 6,
        }
    }
}

pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// `base` if it is free within `(kind, domain_id)`, otherwise
/// `base-<suffix>` for the first free random suffix.
pub async fn generate_name(
    store: &dyn ResourceStore,
    kind: ResourceKind,
    domain_id: &str,
    base: &str,
    policy: &NamePolicy,
) -> Result<String> {
    if !store.name_in_use(kind, domain_id, base).await? {
        return Ok(base.to_string());
    }
    for _ in 0..policy.retry_limit {
        let candidate = format!("{}-{}", base, random_suffix(policy.suffix_len));
        if !store.name_in_use(kind, domain_id, &candidate).await? {
            return Ok(candidate);
        }
    }
    Err(SyncError::NameExhausted {
        base: base.to_string(),
        attempts: policy.retry_limit,
    })
}
