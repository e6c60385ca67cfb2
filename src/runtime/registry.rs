//! Function registry for workflows and activities.
//!
//! Workflows are registered either under a plain name or as versions of a
//! canonical name (one of which may be marked latest). Activities are
//! registered by name only. A [`RegistryBuilder`] collects registrations at
//! process start and fails fast on duplicates; [`RegistryBuilder::build`]
//! freezes it into an immutable, cheaply clonable [`Registry`].

use super::{ActivityHandler, FnActivity, FnWorkflow, WorkflowHandler};
use crate::_typed_codec::{Codec, Json};
use crate::{ActivityContext, OrchestrationContext};
use semver::Version;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow '{0}' is already registered")]
    DuplicateWorkflow(String),
    #[error("workflow '{name}' version '{version}' is already registered")]
    DuplicateWorkflowVersion { name: String, version: String },
    #[error("activity '{0}' is already registered")]
    DuplicateActivity(String),
    #[error("workflow '{name}' has no registered version matching {}", .version.as_deref().unwrap_or("latest"))]
    UnsupportedVersion { name: String, version: Option<String> },
    #[error("workflow '{0}' is not registered")]
    WorkflowNotFound(String),
    #[error("activity '{0}' is not registered")]
    ActivityNotFound(String),
}

#[derive(Clone)]
enum WorkflowEntry {
    Plain(Arc<dyn WorkflowHandler>),
    Versioned {
        versions: BTreeMap<String, Arc<dyn WorkflowHandler>>,
        latest: Option<String>,
    },
}

/// A workflow handler together with the version it was resolved to.
#[derive(Clone)]
pub struct ResolvedWorkflow {
    /// `Some` for versioned workflows.
    pub version: Option<String>,
    pub handler: Arc<dyn WorkflowHandler>,
}

impl fmt::Debug for ResolvedWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedWorkflow").field("version", &self.version).finish()
    }
}

/// Name of a workflow known to be registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowRef(String);

/// Name of an activity known to be registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivityRef(String);

impl AsRef<str> for WorkflowRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ActivityRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ActivityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Orders version strings semantically when both parse as semver (a leading
/// `v` is ignored), lexically otherwise.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| Version::parse(s.strip_prefix(['v', 'V']).unwrap_or(s)).ok();
    match (parse(a), parse(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

/// Immutable set of registered workflows and activities.
#[derive(Clone, Default)]
pub struct Registry {
    workflows: Arc<HashMap<String, WorkflowEntry>>,
    activities: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

// ============================================================================
// Registry
// ============================================================================

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Start a builder seeded with this registry's contents.
    pub fn builder_from(reg: &Registry) -> RegistryBuilder {
        RegistryBuilder {
            workflows: reg.workflows.as_ref().clone(),
            activities: reg.activities.as_ref().clone(),
        }
    }

    /// Resolve a workflow by name.
    ///
    /// With `version`, only that exact version of a canonical name matches.
    /// Without it, the plain registration or the version marked latest is used.
    pub fn resolve_workflow(&self, name: &str, version: Option<&str>) -> Result<ResolvedWorkflow, RegistryError> {
        let result = match (self.workflows.get(name), version) {
            (None, _) => Err(RegistryError::WorkflowNotFound(name.to_string())),
            (Some(WorkflowEntry::Plain(handler)), None) => Ok(ResolvedWorkflow {
                version: None,
                handler: handler.clone(),
            }),
            (Some(WorkflowEntry::Plain(_)), Some(v)) => Err(RegistryError::UnsupportedVersion {
                name: name.to_string(),
                version: Some(v.to_string()),
            }),
            (Some(WorkflowEntry::Versioned { versions, latest }), requested) => {
                let wanted = requested.or(latest.as_deref());
                wanted
                    .and_then(|v| versions.get(v).map(|h| (v, h)))
                    .map(|(v, h)| ResolvedWorkflow {
                        version: Some(v.to_string()),
                        handler: h.clone(),
                    })
                    .ok_or_else(|| RegistryError::UnsupportedVersion {
                        name: name.to_string(),
                        version: requested.map(str::to_string),
                    })
            }
        };
        if result.is_err() {
            self.log_registry_miss("workflow", name, version);
        }
        result
    }

    pub fn activity(&self, name: &str) -> Result<Arc<dyn ActivityHandler>, RegistryError> {
        match self.activities.get(name) {
            Some(h) => Ok(h.clone()),
            None => {
                self.log_registry_miss("activity", name, None);
                Err(RegistryError::ActivityNotFound(name.to_string()))
            }
        }
    }

    /// Checked handle for a registered workflow name.
    pub fn workflow_ref(&self, name: &str) -> Result<WorkflowRef, RegistryError> {
        if self.workflows.contains_key(name) {
            Ok(WorkflowRef(name.to_string()))
        } else {
            Err(RegistryError::WorkflowNotFound(name.to_string()))
        }
    }

    /// Checked handle for a registered activity name.
    pub fn activity_ref(&self, name: &str) -> Result<ActivityRef, RegistryError> {
        if self.activities.contains_key(name) {
            Ok(ActivityRef(name.to_string()))
        } else {
            Err(RegistryError::ActivityNotFound(name.to_string()))
        }
    }

    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn activity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.activities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered versions of a canonical name, oldest first.
    pub fn workflow_versions(&self, name: &str) -> Vec<String> {
        match self.workflows.get(name) {
            Some(WorkflowEntry::Versioned { versions, .. }) => {
                let mut v: Vec<String> = versions.keys().cloned().collect();
                v.sort_by(|a, b| compare_versions(a, b));
                v
            }
            _ => Vec::new(),
        }
    }

    /// Version marked latest for a canonical name.
    pub fn latest_version(&self, name: &str) -> Option<String> {
        match self.workflows.get(name) {
            Some(WorkflowEntry::Versioned { latest, .. }) => latest.clone(),
            _ => None,
        }
    }

    pub fn has_workflow(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    pub fn has_activity(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    // Debug helpers
    fn debug_dump(&self) -> BTreeMap<String, Vec<String>> {
        self.workflows
            .keys()
            .map(|name| (name.clone(), self.workflow_versions(name)))
            .collect()
    }

    fn log_registry_miss(&self, kind: &str, name: &str, requested_version: Option<&str>) {
        tracing::debug!(
            target: "durotask::runtime::registry",
            kind = %kind,
            requested_name = %name,
            requested_version = ?requested_version,
            available_versions_for_name = ?self.workflow_versions(name),
            workflow_count = self.workflows.len(),
            activity_count = self.activities.len(),
            workflows = ?self.debug_dump(),
            activities = ?self.activity_names(),
            "Registry lookup miss - dumping full registry state"
        );
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Collects registrations; see [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    workflows: HashMap<String, WorkflowEntry>,
    activities: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl RegistryBuilder {
    pub fn build(self) -> Registry {
        Registry {
            workflows: Arc::new(self.workflows),
            activities: Arc::new(self.activities),
        }
    }

    fn insert_workflow(&mut self, name: String, handler: Arc<dyn WorkflowHandler>) -> Result<&mut Self, RegistryError> {
        if self.workflows.contains_key(&name) {
            return Err(RegistryError::DuplicateWorkflow(name));
        }
        self.workflows.insert(name, WorkflowEntry::Plain(handler));
        Ok(self)
    }

    fn insert_workflow_version(
        &mut self,
        name: String,
        version: String,
        is_latest: bool,
        handler: Arc<dyn WorkflowHandler>,
    ) -> Result<&mut Self, RegistryError> {
        let entry = self
            .workflows
            .entry(name.clone())
            .or_insert_with(|| WorkflowEntry::Versioned {
                versions: BTreeMap::new(),
                latest: None,
            });
        let WorkflowEntry::Versioned { versions, latest } = entry else {
            return Err(RegistryError::DuplicateWorkflow(name));
        };
        if versions.contains_key(&version) {
            return Err(RegistryError::DuplicateWorkflowVersion { name, version });
        }
        versions.insert(version.clone(), handler);
        if is_latest {
            if let Some(previous) = latest.replace(version.clone()) {
                tracing::debug!(
                    target: "durotask::runtime::registry",
                    workflow = %name,
                    previous = %previous,
                    latest = %version,
                    "latest workflow version replaced"
                );
            }
        }
        Ok(self)
    }

    fn insert_activity(&mut self, name: String, handler: Arc<dyn ActivityHandler>) -> Result<&mut Self, RegistryError> {
        if self.activities.contains_key(&name) {
            return Err(RegistryError::DuplicateActivity(name));
        }
        self.activities.insert(name, handler);
        Ok(self)
    }

    pub fn add_workflow<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_workflow(name.into(), Arc::new(FnWorkflow(f)))
    }

    /// Register `version` of the canonical workflow `name`.
    pub fn add_versioned_workflow<F, Fut>(
        &mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        is_latest: bool,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_workflow_version(name.into(), version.into(), is_latest, Arc::new(FnWorkflow(f)))
    }

    /// Register a workflow whose input and output are JSON-(de)serialized.
    pub fn add_workflow_typed<In, Out, F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<&mut Self, RegistryError>
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert_workflow(name.into(), Arc::new(FnWorkflow(wrapper)))
    }

    pub fn add_activity<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_activity(name.into(), Arc::new(FnActivity(f)))
    }

    /// Register an activity whose input and output are JSON-(de)serialized.
    pub fn add_activity_typed<In, Out, F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<&mut Self, RegistryError>
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert_activity(name.into(), Arc::new(FnActivity(wrapper)))
    }

    /// Merge every registration of `other` into this builder.
    pub fn merge(&mut self, other: &Registry) -> Result<&mut Self, RegistryError> {
        for (name, handler) in other.activities.iter() {
            self.insert_activity(name.clone(), handler.clone())?;
        }
        for (name, entry) in other.workflows.iter() {
            match entry {
                WorkflowEntry::Plain(handler) => {
                    self.insert_workflow(name.clone(), handler.clone())?;
                }
                WorkflowEntry::Versioned { versions, latest } => {
                    for (version, handler) in versions {
                        let is_latest = latest.as_deref() == Some(version.as_str());
                        self.insert_workflow_version(name.clone(), version.clone(), is_latest, handler.clone())?;
                    }
                }
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_with_orders() -> RegistryBuilder {
        let mut b = Registry::builder();
        b.add_versioned_workflow("Order", "v1", false, |_ctx, _input| async move { Ok("v1".to_string()) })
            .unwrap()
            .add_versioned_workflow("Order", "v2", false, |_ctx, _input| async move { Ok("v2".to_string()) })
            .unwrap()
            .add_versioned_workflow("Order", "v3", true, |_ctx, _input| async move { Ok("v3".to_string()) })
            .unwrap();
        b
    }

    #[test]
    fn duplicates_fail_fast() {
        let mut b = builder_with_orders();
        let err = b
            .add_versioned_workflow("Order", "v2", false, |_ctx, _input| async move { Ok(String::new()) })
            .err();
        assert_eq!(
            err,
            Some(RegistryError::DuplicateWorkflowVersion {
                name: "Order".into(),
                version: "v2".into()
            })
        );
        let err = b.add_workflow("Order", |_ctx, _input| async move { Ok(String::new()) }).err();
        assert_eq!(err, Some(RegistryError::DuplicateWorkflow("Order".into())));

        b.add_activity("A", |_ctx, s| async move { Ok(s) }).unwrap();
        let err = b.add_activity("A", |_ctx, s| async move { Ok(s) }).err();
        assert_eq!(err, Some(RegistryError::DuplicateActivity("A".into())));
    }

    #[test]
    fn versioned_resolution() {
        let reg = builder_with_orders().build();
        assert_eq!(reg.resolve_workflow("Order", None).unwrap().version.as_deref(), Some("v3"));
        assert_eq!(reg.resolve_workflow("Order", Some("v1")).unwrap().version.as_deref(), Some("v1"));
        assert!(matches!(
            reg.resolve_workflow("Order", Some("v9")),
            Err(RegistryError::UnsupportedVersion { .. })
        ));
        assert!(matches!(
            reg.resolve_workflow("Missing", None),
            Err(RegistryError::WorkflowNotFound(_))
        ));
        assert_eq!(reg.workflow_versions("Order"), vec!["v1", "v2", "v3"]);
    }

    #[test]
    fn versioned_without_latest_is_unsupported() {
        let mut b = Registry::builder();
        b.add_versioned_workflow("W", "1.0.0", false, |_ctx, _input| async move { Ok(String::new()) })
            .unwrap();
        let reg = b.build();
        assert!(matches!(
            reg.resolve_workflow("W", None),
            Err(RegistryError::UnsupportedVersion { version: None, .. })
        ));
    }

    #[test]
    fn semver_ordering_for_listing() {
        assert_eq!(compare_versions("v1.10.0", "v1.2.0"), Ordering::Greater);
        assert_eq!(compare_versions("2.0.0", "10.0.0"), Ordering::Less);
        assert_eq!(compare_versions("beta", "alpha"), Ordering::Greater);
    }

    #[test]
    fn refs_and_merge() {
        let mut a = Registry::builder();
        a.add_activity("Greet", |_ctx, s| async move { Ok(s) }).unwrap();
        let a = a.build();
        let mut b = builder_with_orders();
        b.merge(&a).unwrap();
        let merged = b.build();
        assert_eq!(merged.activity_ref("Greet").unwrap().as_ref(), "Greet");
        assert!(merged.activity_ref("Nope").is_err());
        assert_eq!(merged.workflow_ref("Order").unwrap().to_string(), "Order");
        assert_eq!(merged.latest_version("Order").as_deref(), Some("v3"));

        let mut again = Registry::builder_from(&merged);
        assert!(again.merge(&a).is_err());
    }
}
