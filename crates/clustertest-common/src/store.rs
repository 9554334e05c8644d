//! The object store seam.
//!
//! Everything in clustertest talks to a cluster through [`ObjectStore`]: five
//! operations over untyped objects plus a closed error classification. The
//! kube-rs adapter lives in [`crate::kube_utils`]; tests substitute mocks.

use std::fmt;

use async_trait::async_trait;
use kube::api::DynamicObject;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Classification of object store failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The object does not exist
    NotFound,
    /// An object with the same identity already exists
    AlreadyExists,
    /// The server is unavailable or still settling; retrying may succeed
    Transient,
    /// Anything else; retrying will not help
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

/// Error returned by an [`ObjectStore`]
///
/// `code` is set only when the server answered with a well-formed API status.
/// Connection-level failures carry no code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    /// Failure classification
    pub kind: ErrorKind,
    /// HTTP status code of the API response, if the server answered
    pub code: Option<u16>,
    /// Human-readable description
    pub message: String,
}

impl StoreError {
    /// Create an error of the given kind without a status code
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Create an error for a well-formed API status response
    pub fn api(kind: ErrorKind, code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: Some(code),
            message: message.into(),
        }
    }

    /// Shorthand for a 404 API response
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::api(ErrorKind::NotFound, 404, message)
    }

    /// Shorthand for a 409 AlreadyExists API response
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::api(ErrorKind::AlreadyExists, 409, message)
    }

    /// Shorthand for a connection-level failure (no API response)
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// True if the object does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// True if the object already exists
    pub fn is_already_exists(&self) -> bool {
        self.kind == ErrorKind::AlreadyExists
    }

    /// True if the failure is expected to clear on its own
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    /// True if the server produced a well-formed API response.
    ///
    /// Any API response, including 403 or 404, proves the transport and
    /// authentication path to the server work.
    pub fn is_api_response(&self) -> bool {
        self.code.is_some()
    }
}

/// Identity of a single object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// apiVersion, e.g. `v1` or `cluster.x-k8s.io/v1beta1`
    pub api_version: String,
    /// Kind, e.g. `Secret`
    pub kind: String,
    /// Object name
    pub name: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ObjectRef {
    /// Reference a cluster-scoped object
    pub fn cluster_scoped(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: None,
        }
    }

    /// Reference a namespaced object
    pub fn namespaced(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Reference a core/v1 Namespace
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::cluster_scoped("v1", "Namespace", name)
    }

    /// Reference a core/v1 Secret
    pub fn secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::namespaced("v1", "Secret", namespace, name)
    }

    /// Reference a core/v1 ConfigMap
    pub fn config_map(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::namespaced("v1", "ConfigMap", namespace, name)
    }

    /// Derive the reference of an object from its type and metadata.
    ///
    /// Returns `None` if the object carries no type information or no name.
    pub fn from_object(object: &DynamicObject) -> Option<Self> {
        let types = object.types.as_ref()?;
        Some(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            name: object.metadata.name.clone()?,
            namespace: object.metadata.namespace.clone(),
        })
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Selection of objects of one kind for a list call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    /// apiVersion of the listed kind
    pub api_version: String,
    /// Listed kind
    pub kind: String,
    /// Namespace to list in, `None` lists across all namespaces
    pub namespace: Option<String>,
    /// Kubernetes label selector expression, e.g. `app=foo,tier!=db`
    pub label_selector: Option<String>,
}

impl Selector {
    /// Select every object of a kind
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: None,
            label_selector: None,
        }
    }

    /// Restrict the selection to one namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restrict the selection with a label selector expression
    pub fn with_labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ns) = &self.namespace {
            write!(f, " in {}", ns)?;
        }
        if let Some(labels) = &self.label_selector {
            write!(f, " matching {}", labels)?;
        }
        Ok(())
    }
}

/// Minimal object CRUD used by every component.
///
/// Updates are expressed as merge patches; callers that need optimistic
/// concurrency include `metadata.resourceVersion` in the patch body.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a single object
    async fn get(&self, object: &ObjectRef) -> Result<DynamicObject, StoreError>;

    /// List objects matching a selector
    async fn list(&self, selector: &Selector) -> Result<Vec<DynamicObject>, StoreError>;

    /// Create an object; it must carry type information and a name
    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Apply a JSON merge patch to an object
    async fn patch(
        &self,
        object: &ObjectRef,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject, StoreError>;

    /// Delete an object
    async fn delete(&self, object: &ObjectRef) -> Result<(), StoreError>;
}

/// Fetch an object, mapping "not found" to `None`
pub async fn get_opt(
    store: &dyn ObjectStore,
    object: &ObjectRef,
) -> Result<Option<DynamicObject>, StoreError> {
    match store.get(object).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Delete an object, treating "not found" as success.
///
/// Returns `true` if the object existed.
pub async fn delete_if_exists(
    store: &dyn ObjectStore,
    object: &ObjectRef,
) -> Result<bool, StoreError> {
    match store.delete(object).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
