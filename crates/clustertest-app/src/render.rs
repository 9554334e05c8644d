//! Rendering installable units into objects.

use std::collections::BTreeMap;

use clustertest_common::kube_utils::dynamic_object;
use clustertest_common::{Error, Result, DELETE_ANNOTATION};
use kube::api::DynamicObject;
use serde_json::{json, Map, Value};

use crate::application::Application;

/// apiVersion of the App resource
pub const APP_API_VERSION: &str = "application.giantswarm.io/v1alpha1";

/// Kind of the App resource
pub const APP_KIND: &str = "App";

/// Data key holding values in a values ConfigMap
pub const VALUES_KEY: &str = "values";

/// A unit's manifest and the values object it references
#[derive(Debug, Clone)]
pub struct RenderedUnit {
    /// The unit manifest (an App)
    pub manifest: DynamicObject,
    /// The values artifact (a ConfigMap); applied before the manifest
    pub values: DynamicObject,
}

/// Turns a resolved [`Application`] into objects
pub trait ManifestRenderer: Send + Sync {
    /// Render the manifest and values objects for a resolved unit
    fn render(&self, app: &Application) -> Result<RenderedUnit>;
}

/// Renders App resources and userconfig ConfigMaps
#[derive(Debug, Clone, Default)]
pub struct AppCatalogRenderer {
    base_labels: BTreeMap<String, String>,
}

impl AppCatalogRenderer {
    /// A renderer adding `base_labels` to everything it renders
    pub fn new(base_labels: BTreeMap<String, String>) -> Self {
        Self { base_labels }
    }

    fn labels(&self, unit_labels: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
        let mut labels = self.base_labels.clone();
        labels.extend(unit_labels.clone());
        (!labels.is_empty()).then_some(labels)
    }

    fn kube_config(app: &Application) -> Value {
        if app.in_cluster {
            return json!({ "inCluster": true });
        }
        let mut kube_config = json!({ "inCluster": false });
        if let Some(context) = &app.cluster_context {
            kube_config["context"] = json!({ "name": context });
            kube_config["secret"] = json!({
                "name": format!("{}-kubeconfig", context.rsplit('@').next().unwrap_or(context)),
                "namespace": app.namespace,
            });
        }
        kube_config
    }
}

impl ManifestRenderer for AppCatalogRenderer {
    fn render(&self, app: &Application) -> Result<RenderedUnit> {
        app.validate()?;
        if !app.is_resolved() {
            return Err(Error::validation_field(
                "version",
                format!("{} has no resolved version", app.install_name),
            ));
        }

        let config_map_name = app.values_config_map_name();

        let mut values = dynamic_object("v1", "ConfigMap", &config_map_name, Some(&app.namespace));
        values.metadata.labels = self.labels(&app.config_map_labels);
        values.metadata.annotations = Some(BTreeMap::from([(
            DELETE_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        values.data = json!({ "data": { VALUES_KEY: app.values } });

        let mut user_config = Map::new();
        user_config.insert(
            "configMap".to_string(),
            json!({ "name": config_map_name, "namespace": app.namespace }),
        );
        if let Some(secret) = &app.user_config_secret {
            user_config.insert(
                "secret".to_string(),
                json!({ "name": secret, "namespace": app.namespace }),
            );
        }

        let mut spec = json!({
            "catalog": app.catalog,
            "name": app.app_name,
            "namespace": app.namespace,
            "version": app.version,
            "kubeConfig": Self::kube_config(app),
            "userConfig": Value::Object(user_config),
        });
        if let Some(config_map) = &app.config_map {
            spec["config"] = json!({
                "configMap": { "name": config_map, "namespace": app.namespace }
            });
        }
        if !app.extra_configs.is_empty() {
            spec["extraConfigs"] = serde_json::to_value(&app.extra_configs)?;
        }

        let mut manifest =
            dynamic_object(APP_API_VERSION, APP_KIND, &app.install_name, Some(&app.namespace));
        manifest.metadata.labels = self.labels(&app.app_labels);
        manifest.data = json!({ "spec": spec });

        Ok(RenderedUnit { manifest, values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ExtraConfig;
    use clustertest_common::ObjectRef;

    fn resolved_app() -> Application {
        Application::new("acme", "cluster-aws")
            .with_version("v2.0.0")
            .with_namespace("org-t-org")
            .with_app_labels(BTreeMap::from([(
                "giantswarm.io/cluster".to_string(),
                "acme".to_string(),
            )]))
    }

    #[test]
    fn test_render_app_and_config_map() {
        let renderer = AppCatalogRenderer::new(BTreeMap::from([(
            "cicd.giantswarm.io/pr".to_string(),
            "42".to_string(),
        )]));
        let unit = renderer.render(&resolved_app()).unwrap();

        assert_eq!(
            ObjectRef::from_object(&unit.values).unwrap(),
            ObjectRef::config_map("org-t-org", "acme-userconfig")
        );
        assert_eq!(unit.values.data["data"]["values"], "\n");

        let spec = &unit.manifest.data["spec"];
        assert_eq!(spec["name"], "cluster-aws");
        assert_eq!(spec["catalog"], "cluster");
        assert_eq!(spec["version"], "v2.0.0");
        assert_eq!(spec["kubeConfig"]["inCluster"], true);
        assert_eq!(spec["userConfig"]["configMap"]["name"], "acme-userconfig");

        let labels = unit.manifest.metadata.labels.unwrap();
        assert_eq!(labels["giantswarm.io/cluster"], "acme");
        assert_eq!(labels["cicd.giantswarm.io/pr"], "42");
    }

    #[test]
    fn test_values_config_map_is_deletion_safe() {
        let unit = AppCatalogRenderer::default().render(&resolved_app()).unwrap();
        assert!(unit
            .values
            .metadata
            .annotations
            .unwrap()
            .contains_key(DELETE_ANNOTATION));
    }

    #[test]
    fn test_unresolved_unit_is_rejected() {
        let app = Application::new("acme", "cluster-aws");
        assert!(AppCatalogRenderer::default().render(&app).is_err());
    }

    #[test]
    fn test_remote_install_references_context() {
        let app = resolved_app()
            .with_in_cluster(false)
            .with_cluster_context("acme-admin@acme")
            .with_extra_configs(vec![ExtraConfig {
                kind: "configMap".to_string(),
                name: "acme-cluster-values".to_string(),
                namespace: "org-t-org".to_string(),
                priority: 25,
            }]);
        let unit = AppCatalogRenderer::default().render(&app).unwrap();
        let spec = &unit.manifest.data["spec"];
        assert_eq!(spec["kubeConfig"]["inCluster"], false);
        assert_eq!(spec["kubeConfig"]["context"]["name"], "acme-admin@acme");
        assert_eq!(spec["kubeConfig"]["secret"]["name"], "acme-kubeconfig");
        assert_eq!(spec["extraConfigs"][0]["name"], "acme-cluster-values");
    }
}
