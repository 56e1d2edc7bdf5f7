use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single GPU-bearing backend at a provider, self-hosted or rented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInstance {
    pub id: String,
    pub provider: String,
    pub model_name: String,
    pub gpu_count: u32,
    pub vram_gb: u32,
    pub cpu_cores: u32,
    pub ram_gb: u32,
    pub storage_gb: u32,
    pub price_per_hour: f64,
    pub location: String,
    pub available: bool,
    #[serde(default)]
    pub specifications: serde_json::Value,
}

/// Instance-creation parameters forwarded to the vendor control API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub fallback_max_price_pct: Option<f64>,
}

impl CreateConfig {
    /// `fallback_max_price_pct` is validated but advisory; no proxy path
    /// consumes it.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if let Some(pct) = self.fallback_max_price_pct {
            if !(0.0..=100.0).contains(&pct) {
                return Err(ProviderError::InvalidConfig(format!(
                    "fallback_max_price_pct out of range: {pct}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("instance '{0}' not found")]
    UnknownInstance(String),
    #[error("instance '{0}' is not available")]
    Unavailable(String),
    #[error("invalid instance config: {0}")]
    InvalidConfig(String),
    #[error("provider call failed: {0}")]
    Upstream(String),
}

/// The capability each vendor integration exposes to the core. Vendor REST
/// clients live outside the core; they only have to speak this trait.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider tag, e.g. "vastai".
    fn tag(&self) -> &str;
    async fn list(&self) -> Result<Vec<GpuInstance>, ProviderError>;
    async fn create(&self, instance_id: &str, config: &CreateConfig)
        -> Result<String, ProviderError>;
    async fn destroy(&self, instance_id: &str) -> Result<(), ProviderError>;
}

/// Tag-keyed adapter registry.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.tag().to_string(), adapter);
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(tag)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(tag.to_string()))
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.adapters.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn all(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.adapters.values().cloned().collect()
    }
}

/// Adapter over a fixed fleet of self-hosted backends declared at startup.
/// `create` marks an instance reserved so later picks skip it; `destroy`
/// releases it. Contract ids are synthetic.
pub struct StaticProvider {
    tag: String,
    instances: Mutex<HashMap<String, (GpuInstance, bool)>>,
}

impl StaticProvider {
    pub fn new(tag: impl Into<String>, instances: Vec<GpuInstance>) -> Self {
        let map = instances
            .into_iter()
            .map(|instance| (instance.id.clone(), (instance, false)))
            .collect();
        Self { tag: tag.into(), instances: Mutex::new(map) }
    }
}

#[async_trait]
impl ProviderAdapter for StaticProvider {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn list(&self) -> Result<Vec<GpuInstance>, ProviderError> {
        let guard = self.instances.lock().expect("mutex poisoned");
        Ok(guard
            .values()
            .map(|(instance, reserved)| {
                let mut instance = instance.clone();
                instance.available = instance.available && !reserved;
                instance
            })
            .collect())
    }

    async fn create(
        &self,
        instance_id: &str,
        config: &CreateConfig,
    ) -> Result<String, ProviderError> {
        config.validate()?;
        let mut guard = self.instances.lock().expect("mutex poisoned");
        let (instance, reserved) = guard
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::UnknownInstance(instance_id.to_string()))?;
        if !instance.available || *reserved {
            return Err(ProviderError::Unavailable(instance_id.to_string()));
        }
        *reserved = true;
        Ok(format!("{}-{}", self.tag, instance_id))
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), ProviderError> {
        let mut guard = self.instances.lock().expect("mutex poisoned");
        let (_, reserved) = guard
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::UnknownInstance(instance_id.to_string()))?;
        *reserved = false;
        Ok(())
    }
}
