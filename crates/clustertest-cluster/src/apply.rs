//! Create-or-update over the object store.

use clustertest_common::{Error, ObjectRef, ObjectStore, Result};
use kube::api::DynamicObject;
use tracing::debug;

/// Create `object`, or update it in place if it already exists.
///
/// The update is a merge patch of the desired object carrying the current
/// `resourceVersion`, so running the same apply twice leaves one object
/// with the same identity.
pub async fn create_or_update(store: &dyn ObjectStore, object: &DynamicObject) -> Result<DynamicObject> {
    let target = ObjectRef::from_object(object).ok_or_else(|| {
        Error::validation("object to apply must carry apiVersion, kind and name")
    })?;

    match store.create(object).await {
        Ok(created) => {
            debug!(object = %target, "Created");
            Ok(created)
        }
        Err(e) if e.is_already_exists() => {
            let current = store.get(&target).await?;
            let mut patch = serde_json::to_value(object)?;
            if let Some(version) = current.metadata.resource_version {
                patch["metadata"]["resourceVersion"] = serde_json::Value::String(version);
            }
            let updated = store.patch(&target, &patch).await?;
            debug!(object = %target, "Updated existing object");
            Ok(updated)
        }
        Err(e) => Err(e.into()),
    }
}

/// Create `object`, leaving an existing object untouched
pub async fn create_if_absent(store: &dyn ObjectStore, object: &DynamicObject) -> Result<()> {
    match store.create(object).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
