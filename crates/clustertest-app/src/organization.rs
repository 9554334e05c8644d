//! Organizations: the tenancy boundary a cluster lives in.
//!
//! Creating an Organization object makes an external controller provision
//! its `org-<name>` namespace. Organizations this run creates carry the
//! deletion-safe annotation; attached ones never do.

use std::collections::BTreeMap;

use clustertest_common::kube_utils::dynamic_object;
use clustertest_common::{ObjectRef, DELETE_ANNOTATION, ORG_NAMESPACE_PREFIX};
use kube::api::DynamicObject;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// apiVersion of the Organization resource
pub const ORGANIZATION_API_VERSION: &str = "security.giantswarm.io/v1alpha1";

/// Kind of the Organization resource
pub const ORGANIZATION_KIND: &str = "Organization";

const RANDOM_NAME_PREFIX: &str = "t-";
const RANDOM_NAME_LEN: usize = 20;

/// An organization and whether this run may delete it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    name: String,
    deletion_safe: bool,
}

impl Organization {
    /// An organization this run will create and may delete
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deletion_safe: true,
        }
    }

    /// An organization with a random name, created and owned by this run
    pub fn random() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_NAME_LEN - RANDOM_NAME_PREFIX.len())
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        Self::new(format!("{}{}", RANDOM_NAME_PREFIX, suffix))
    }

    /// A pre-existing organization that must never be deleted by this run
    pub fn existing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deletion_safe: false,
        }
    }

    /// A pre-existing organization identified by its namespace
    pub fn from_namespace(namespace: &str) -> Self {
        Self::existing(
            namespace
                .strip_prefix(ORG_NAMESPACE_PREFIX)
                .unwrap_or(namespace),
        )
    }

    /// Organization name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace provisioned for the organization
    pub fn namespace(&self) -> String {
        format!("{}{}", ORG_NAMESPACE_PREFIX, self.name)
    }

    /// Whether this run created the organization and may delete it
    pub fn deletion_safe(&self) -> bool {
        self.deletion_safe
    }

    /// Reference to the Organization object
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::cluster_scoped(ORGANIZATION_API_VERSION, ORGANIZATION_KIND, &self.name)
    }

    /// Render the Organization object to create
    pub fn to_object(&self, labels: &BTreeMap<String, String>) -> DynamicObject {
        let mut obj = dynamic_object(ORGANIZATION_API_VERSION, ORGANIZATION_KIND, &self.name, None);
        if !labels.is_empty() {
            obj.metadata.labels = Some(labels.clone());
        }
        if self.deletion_safe {
            obj.metadata.annotations = Some(BTreeMap::from([(
                DELETE_ANNOTATION.to_string(),
                "true".to_string(),
            )]));
        }
        obj.data = serde_json::json!({ "spec": {} });
        obj
    }
}

/// True if a persisted object carries the deletion-safe marker
pub fn is_safe_to_delete(object: &DynamicObject) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(DELETE_ANNOTATION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_is_prefixed() {
        assert_eq!(Organization::new("acme").namespace(), "org-acme");
    }

    #[test]
    fn test_random_name_shape() {
        let org = Organization::random();
        assert_eq!(org.name().len(), RANDOM_NAME_LEN);
        assert!(org.name().starts_with("t-"));
        assert!(org
            .name()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(org.deletion_safe());
    }

    #[test]
    fn test_from_namespace_is_not_deletion_safe() {
        let org = Organization::from_namespace("org-t-abc");
        assert_eq!(org.name(), "t-abc");
        assert!(!org.deletion_safe());
    }

    #[test]
    fn test_created_object_carries_marker() {
        let obj = Organization::new("acme").to_object(&BTreeMap::new());
        assert!(is_safe_to_delete(&obj));
        assert_eq!(obj.metadata.name.as_deref(), Some("acme"));
        assert!(obj.metadata.namespace.is_none());
    }

    #[test]
    fn test_existing_object_has_no_marker() {
        let obj = Organization::existing("shared").to_object(&BTreeMap::new());
        assert!(!is_safe_to_delete(&obj));
    }
}
