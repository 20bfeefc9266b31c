//! Secret model for `vault-init`.
//!
//! A [`Secret`] wraps one response from the secret store: the logical path it
//! was read from, the payload map, and the lease/auth envelope. Two flavors
//! are distinguished at runtime by which fields are populated: versioned
//! KV v2 secrets carry `metadata.version` inside the payload, leased secrets
//! carry a non-empty `lease_id` (and tokens additionally carry [`AuthInfo`]).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::client::{LeaseRenewal, VaultClient};
use crate::error::ClientError;

/// Dynamic payload tree: string keys over scalars and nested containers.
pub type DataMap = serde_json::Map<String, Value>;

/// A secret shared between its single writer (renewer consumer or watcher)
/// and the snapshot renderer.
pub type SharedSecret = Arc<RwLock<Secret>>;

/// Auth portion of a secret, present on token-shaped responses.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthInfo {
    pub client_token: String,
    pub accessor: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
}

/// One secret retrieved from the store.
#[derive(Debug, Clone, Default)]
pub struct Secret {
    /// Logical path this secret was read from.
    pub path: String,
    /// Lease ID, empty for non-leased secrets.
    pub lease_id: String,
    /// Lease duration in seconds.
    pub lease_duration: u64,
    /// Whether the lease declares itself renewable.
    pub renewable: bool,
    /// The response payload. For KV v2 reads this holds the `data` and
    /// `metadata` sub-maps.
    pub data: DataMap,
    /// Auth envelope, present for tokens.
    pub auth: Option<AuthInfo>,
}

impl Secret {
    /// Wrap a payload read from `path`.
    #[must_use]
    pub fn new(path: impl Into<String>, data: DataMap) -> Self {
        Self {
            path: path.into(),
            data,
            ..Self::default()
        }
    }

    /// Whether this secret can be kept fresh by a renewer instead of
    /// version polling. True if either the lease or the auth portion
    /// declares itself renewable.
    #[must_use]
    pub fn is_renewable(&self) -> bool {
        self.renewable || self.auth.as_ref().is_some_and(|auth| auth.renewable)
    }

    /// The token carried in the auth envelope, if any.
    #[must_use]
    pub fn token_id(&self) -> Option<&str> {
        self.auth.as_ref().map(|auth| auth.client_token.as_str())
    }

    /// The token accessor carried in the auth envelope, if any.
    #[must_use]
    pub fn token_accessor(&self) -> Option<&str> {
        self.auth.as_ref().map(|auth| auth.accessor.as_str())
    }

    /// The KV v2 `metadata.version` of the payload, if present.
    #[must_use]
    pub fn metadata_version(&self) -> Option<u64> {
        self.data
            .get("metadata")
            .and_then(Value::as_object)
            .and_then(|metadata| metadata.get("version"))
            .and_then(Value::as_u64)
    }

    /// Compare this secret against a freshly fetched copy and take over its
    /// payload iff the fetched metadata version is strictly greater.
    ///
    /// Returns whether the payload was replaced. Secrets without metadata on
    /// both sides are not updatable through this path (they are expected to
    /// be renewable or fetched as leases) and always return `false`.
    pub fn update(&mut self, next: Secret) -> bool {
        let (Some(current_version), Some(next_version)) =
            (self.metadata_version(), next.metadata_version())
        else {
            debug!(path = %self.path, "secret carries no version metadata, skipping update check");
            return false;
        };

        if current_version < next_version {
            debug!(
                path = %self.path,
                from = current_version,
                to = next_version,
                "secret updated to newer version"
            );
            self.data = next.data;
            self.lease_id = next.lease_id;
            self.lease_duration = next.lease_duration;
            self.renewable = next.renewable;
            return true;
        }

        false
    }

    /// Apply a renewal message from this secret's renewer: refresh the
    /// lease/auth envelope, keeping the data payload when the renewal
    /// carries none (lease renewals return no data).
    pub fn apply_renewal(&mut self, renewal: &LeaseRenewal) {
        if !renewal.lease_id.is_empty() {
            self.lease_id.clone_from(&renewal.lease_id);
        }
        self.lease_duration = renewal.lease_duration;
        self.renewable = renewal.renewable;
        if let Some(auth) = &renewal.auth {
            self.auth = Some(auth.clone());
        }
        if let Some(data) = &renewal.data {
            self.data.clone_from(data);
        }
    }

    /// Nest the payload under this secret's path components: the path is
    /// split on `/`, blank components skipped, `-` replaced with `_`, and
    /// the payload wrapped right-to-left so that `kv/app/db` yields
    /// `{kv: {app: {db: <payload>}}}`.
    #[must_use]
    pub fn data_map(&self) -> DataMap {
        let mut data = self.data.clone();

        for component in self.path.split('/').rev() {
            if component.is_empty() {
                continue;
            }

            let mut wrapper = DataMap::new();
            wrapper.insert(component.replace('-', "_"), Value::Object(data));
            data = wrapper;
        }

        data
    }

    /// Revoke this secret through the client: by token accessor if it is an
    /// auth secret, by lease ID if it is leased, otherwise a warning no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::RevokeFailed`] if the store rejects the
    /// revocation.
    pub async fn revoke(&self, client: &dyn VaultClient) -> Result<(), ClientError> {
        if let Some(accessor) = self.token_accessor() {
            return client.revoke_token_accessor(accessor).await;
        }

        if !self.lease_id.is_empty() {
            return client.revoke_lease(&self.lease_id).await;
        }

        warn!(
            path = %self.path,
            "secret can not be revoked; it is neither an auth nor a leased secret"
        );
        Ok(())
    }
}

/// Recursively merge `incoming` into `target`. Maps merge key-wise, any
/// other value replaces the existing entry. The watcher folds every
/// secret's [`data_map`](Secret::data_map) into the template context with
/// this; later secrets win at conflicting leaf keys.
pub fn deep_merge(target: &mut DataMap, incoming: DataMap) {
    for (key, value) in incoming {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> DataMap {
        match value {
            Value::Object(map) => map,
            _ => DataMap::new(),
        }
    }

    fn versioned_secret(path: &str, version: u64, password: &str) -> Secret {
        Secret::new(
            path,
            payload(json!({
                "data": { "password": password },
                "metadata": { "version": version },
            })),
        )
    }

    #[test]
    fn data_map_nests_under_path_components() {
        let secret = Secret::new("a/b/c", payload(json!({"k": "v"})));
        let nested = secret.data_map();
        assert_eq!(
            Value::Object(nested),
            json!({"a": {"b": {"c": {"k": "v"}}}})
        );
    }

    #[test]
    fn data_map_skips_blank_components_and_rewrites_dashes() {
        let secret = Secret::new("/kv//my-app/", payload(json!({"k": "v"})));
        let nested = secret.data_map();
        assert_eq!(Value::Object(nested), json!({"kv": {"my_app": {"k": "v"}}}));
    }

    #[test]
    fn update_replaces_payload_on_newer_version() {
        let mut current = versioned_secret("kv/app", 1, "old");
        let next = versioned_secret("kv/app", 2, "new");

        assert!(current.update(next));
        assert_eq!(current.metadata_version(), Some(2));
        assert_eq!(current.data["data"]["password"], "new");
    }

    #[test]
    fn update_ignores_equal_and_older_versions() {
        let mut current = versioned_secret("kv/app", 2, "current");

        assert!(!current.update(versioned_secret("kv/app", 2, "same")));
        assert!(!current.update(versioned_secret("kv/app", 1, "older")));
        assert_eq!(current.data["data"]["password"], "current");
    }

    #[test]
    fn update_without_metadata_is_a_no_op() {
        let mut current = Secret::new("otp/code", payload(json!({"code": "1"})));
        let next = Secret::new("otp/code", payload(json!({"code": "2"})));

        assert!(!current.update(next));
        assert_eq!(current.data["code"], "1");
    }

    #[test]
    fn renewability_comes_from_lease_or_auth() {
        let mut secret = Secret::new("db/creds", DataMap::new());
        assert!(!secret.is_renewable());

        secret.renewable = true;
        assert!(secret.is_renewable());

        secret.renewable = false;
        secret.auth = Some(AuthInfo {
            client_token: "s.token".to_owned(),
            accessor: "accessor".to_owned(),
            policies: vec![],
            lease_duration: 60,
            renewable: true,
        });
        assert!(secret.is_renewable());
    }

    #[test]
    fn data_maps_merge_with_last_writer_wins() {
        let first = Secret::new("kv/app", payload(json!({"a": 1, "shared": "first"})));
        let second = Secret::new("kv/app", payload(json!({"b": 2, "shared": "second"})));

        let mut merged = first.data_map();
        deep_merge(&mut merged, second.data_map());
        assert_eq!(
            Value::Object(merged),
            json!({"kv": {"app": {"a": 1, "b": 2, "shared": "second"}}})
        );
    }
}
