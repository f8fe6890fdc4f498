use super::{FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;
use crate::_typed_codec::{Codec, Json};
use async_trait::async_trait;
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Version every unversioned registration gets.
pub const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// Immutable registry mapping orchestration names to versioned handlers.
///
/// New instances start on the version picked by the name's [`VersionPolicy`];
/// the chosen version is written into `OrchestratorStarted` and every later
/// pass resolves that exact version, so redeploying a newer handler never
/// changes the code an in-flight instance replays against.
#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<dyn OrchestrationHandler>>>>,
    pub(crate) policy: Arc<HashMap<String, VersionPolicy>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn resolve_for_start(&self, name: &str) -> Option<(Version, Arc<dyn OrchestrationHandler>)> {
        let versions = self.inner.get(name)?;
        match self.policy.get(name).unwrap_or(&VersionPolicy::Latest) {
            VersionPolicy::Latest => {
                let (v, h) = versions.iter().next_back()?;
                Some((v.clone(), h.clone()))
            }
            VersionPolicy::Exact(v) => {
                let h = versions.get(v)?.clone();
                Some((v.clone(), h))
            }
        }
    }

    pub fn resolve_exact(&self, name: &str, v: &Version) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name)?.get(v).cloned()
    }

    pub fn list_orchestration_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, BTreeMap<Version, Arc<dyn OrchestrationHandler>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    fn insert(mut self, name: String, v: Version, handler: Arc<dyn OrchestrationHandler>) -> Self {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&v) {
            self.errors
                .push(format!("duplicate orchestration registration: {name}@{v}"));
            return self;
        }
        if let Some((latest, _)) = entry.iter().next_back()
            && &v <= latest
        {
            self.errors.push(format!(
                "non-monotonic orchestration version for {name}: {v} is not later than existing latest {latest}"
            ));
            return self;
        }
        entry.insert(v, handler);
        self
    }

    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)))
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        match Version::parse(version.as_ref()) {
            Ok(v) => self.insert(name, v, Arc::new(FnOrchestration(f))),
            Err(e) => {
                self.errors
                    .push(format!("invalid version {:?} for {name}: {e}", version.as_ref()));
                self
            }
        }
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }

    /// Build, ignoring registration errors (the offending entries are skipped).
    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
            policy: Arc::new(self.policy),
        }
    }

    pub fn build_result(self) -> Result<OrchestrationRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

// ---------------- Activity registry

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

/// Name to handler map consulted by the worker pool.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }
    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f_clone = Arc::new(f);
        let wrapper = move |input_s: String| {
            let f_inner = f_clone.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = (f_inner)(input).await?;
                Json::encode(&out)
            }
        };
        self.map.insert(name.into(), Arc::new(FnActivity(wrapper)));
        self
    }
    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}
