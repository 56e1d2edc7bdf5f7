use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::load_balancer::LoadBalancer;
use crate::port_alloc::{PortAllocator, PortClass};
use crate::providers::{CreateConfig, GpuInstance, ProviderError, ProviderRegistry};

pub const MAX_RESERVE_COUNT: usize = 16;
pub const MAX_BATCH_PER_PROVIDER: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default)]
    pub min_vram: Option<u32>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub gpu_model: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &GpuInstance) -> bool {
        if let Some(min_vram) = self.min_vram {
            if instance.vram_gb < min_vram {
                return false;
            }
        }
        if let Some(max_price) = self.max_price {
            if instance.price_per_hour > max_price {
                return false;
            }
        }
        if let Some(model) = &self.gpu_model {
            if !instance.model_name.eq_ignore_ascii_case(model) {
                return false;
            }
        }
        if let Some(location) = &self.location {
            if !instance.location.eq_ignore_ascii_case(location) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListOutcome {
    pub instances: Vec<GpuInstance>,
    pub errors: Vec<ProviderFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Pending,
    Active,
    Terminated,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    pub instance_id: String,
    pub contract_id: String,
    pub port: u16,
    pub state: ReservationState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cost_per_hour: f64,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotError {
    pub slot: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReserveOutcome {
    pub reservations: Vec<Reservation>,
    pub errors: Vec<SlotError>,
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("count must be within 1..={max}, got {got}")]
    BadCount { got: usize, max: usize },
    #[error("no instances match the requested filters")]
    NoCandidates,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Uniform multi-provider inventory: fan-out listing, filtering, reservation
/// and teardown. The load balancer is injected so the reserve path can pick
/// without the inventory owning balancer state.
pub struct GpuInventory {
    registry: ProviderRegistry,
    lb: Arc<LoadBalancer>,
    ports: Arc<PortAllocator>,
    reservations: Mutex<HashMap<Uuid, Reservation>>,
}

impl GpuInventory {
    pub fn new(registry: ProviderRegistry, lb: Arc<LoadBalancer>, ports: Arc<PortAllocator>) -> Self {
        Self { registry, lb, ports, reservations: Mutex::new(HashMap::new()) }
    }

    pub fn provider_tags(&self) -> Vec<String> {
        self.registry.tags()
    }

    /// Fan-out list across the selected adapters. A failed adapter
    /// contributes no instances plus an error entry; partial success is fine.
    pub async fn list(&self, provider: Option<&str>) -> Result<ListOutcome, InventoryError> {
        let adapters = match provider {
            Some(tag) => vec![self.registry.get(tag)?],
            None => self.registry.all(),
        };
        let mut instances = Vec::new();
        let mut errors = Vec::new();
        for adapter in adapters {
            match adapter.list().await {
                Ok(mut listed) => instances.append(&mut listed),
                Err(err) => {
                    warn!(provider = adapter.tag(), ?err, "provider list failed");
                    errors.push(ProviderFailure {
                        provider: adapter.tag().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(ListOutcome { instances, errors })
    }

    pub fn filter(instances: Vec<GpuInstance>, filter: &InstanceFilter) -> Vec<GpuInstance> {
        instances.into_iter().filter(|instance| filter.matches(instance)).collect()
    }

    pub async fn create(
        &self,
        provider: &str,
        instance_id: &str,
        config: &CreateConfig,
    ) -> Result<String, InventoryError> {
        let adapter = self.registry.get(provider)?;
        Ok(adapter.create(instance_id, config).await?)
    }

    /// Destroy delegates to the adapter and terminates any active
    /// reservation for the instance, returning its port.
    pub async fn destroy(&self, provider: &str, instance_id: &str) -> Result<(), InventoryError> {
        let adapter = self.registry.get(provider)?;
        adapter.destroy(instance_id).await?;
        let mut guard = self.reservations.lock().expect("mutex poisoned");
        for reservation in guard.values_mut() {
            if reservation.provider == provider
                && reservation.instance_id == instance_id
                && reservation.state == ReservationState::Active
            {
                reservation.state = ReservationState::Terminated;
                reservation.ended_at = Some(Utc::now());
                self.ports.release(reservation.port);
            }
        }
        Ok(())
    }

    /// Reserve `count` distinct instances: list + filter, one LB pick per
    /// slot without replacement, create each. Per-slot failures are reported
    /// next to the successes; earlier successes are never rolled back. The
    /// port-exhaustion path is the exception: its freshly-created provider
    /// resource is destroyed best-effort before the slot is reported failed.
    pub async fn reserve(
        &self,
        tenant_id: Uuid,
        count: usize,
        filter: &InstanceFilter,
        config: &CreateConfig,
    ) -> Result<ReserveOutcome, InventoryError> {
        if count == 0 || count > MAX_RESERVE_COUNT {
            return Err(InventoryError::BadCount { got: count, max: MAX_RESERVE_COUNT });
        }
        config.validate()?;

        let listed = self.list(None).await?;
        let mut candidates: Vec<GpuInstance> = Self::filter(listed.instances, filter)
            .into_iter()
            .filter(|instance| instance.available)
            .collect();
        if candidates.is_empty() {
            return Err(InventoryError::NoCandidates);
        }

        let port_class = match config.protocol.as_deref() {
            Some("external") => PortClass::Cloud,
            _ => PortClass::SelfHosted,
        };

        let mut reservations = Vec::new();
        let mut errors = Vec::new();
        for slot in 0..count {
            let Ok(picked) = self.lb.pick(&candidates) else {
                errors.push(SlotError { slot, message: "no remaining candidates".into() });
                continue;
            };
            candidates.retain(|candidate| candidate.id != picked.id);

            let adapter = match self.registry.get(&picked.provider) {
                Ok(adapter) => adapter,
                Err(err) => {
                    errors.push(SlotError { slot, message: err.to_string() });
                    continue;
                }
            };
            let contract_id = match adapter.create(&picked.id, config).await {
                Ok(contract_id) => contract_id,
                Err(err) => {
                    errors.push(SlotError { slot, message: err.to_string() });
                    continue;
                }
            };
            let port = match self.ports.allocate(port_class) {
                Ok(port) => port,
                Err(err) => {
                    if let Err(destroy_err) = adapter.destroy(&picked.id).await {
                        warn!(
                            instance = %picked.id,
                            ?destroy_err,
                            "rollback destroy failed after port exhaustion"
                        );
                    }
                    errors.push(SlotError { slot, message: err.to_string() });
                    continue;
                }
            };

            let reservation = Reservation {
                id: Uuid::new_v4(),
                tenant_id,
                provider: picked.provider.clone(),
                instance_id: picked.id.clone(),
                contract_id,
                port,
                state: ReservationState::Active,
                started_at: Utc::now(),
                ended_at: None,
                cost_per_hour: picked.price_per_hour,
                protocol: config.protocol.clone().unwrap_or_else(|| "http".to_string()),
            };
            self.reservations
                .lock()
                .expect("mutex poisoned")
                .insert(reservation.id, reservation.clone());
            reservations.push(reservation);
        }
        Ok(ReserveOutcome { reservations, errors })
    }

    /// Bulk create against one provider: take the first `count` available
    /// offers and create each, accumulating per-slot errors.
    pub async fn bulk_create(
        &self,
        provider: &str,
        count: usize,
        config: &CreateConfig,
    ) -> Result<ReserveOutcome, InventoryError> {
        if count > MAX_BATCH_PER_PROVIDER {
            return Err(InventoryError::BadCount { got: count, max: MAX_BATCH_PER_PROVIDER });
        }
        if count == 0 {
            return Ok(ReserveOutcome { reservations: Vec::new(), errors: Vec::new() });
        }
        let adapter = self.registry.get(provider)?;
        let offers: Vec<GpuInstance> = adapter
            .list()
            .await?
            .into_iter()
            .filter(|instance| instance.available)
            .take(count)
            .collect();

        let mut reservations = Vec::new();
        let mut errors = Vec::new();
        for (slot, offer) in offers.iter().enumerate() {
            match adapter.create(&offer.id, config).await {
                Ok(contract_id) => reservations.push(Reservation {
                    id: Uuid::new_v4(),
                    tenant_id: Uuid::nil(),
                    provider: provider.to_string(),
                    instance_id: offer.id.clone(),
                    contract_id,
                    port: 0,
                    state: ReservationState::Pending,
                    started_at: Utc::now(),
                    ended_at: None,
                    cost_per_hour: offer.price_per_hour,
                    protocol: config.protocol.clone().unwrap_or_else(|| "http".to_string()),
                }),
                Err(err) => errors.push(SlotError { slot, message: err.to_string() }),
            }
        }
        for slot in offers.len()..count {
            errors.push(SlotError { slot, message: "no available offer".into() });
        }
        Ok(ReserveOutcome { reservations, errors })
    }

    pub fn active_reservations(&self) -> Vec<Reservation> {
        self.reservations
            .lock()
            .expect("mutex poisoned")
            .values()
            .filter(|reservation| reservation.state == ReservationState::Active)
            .cloned()
            .collect()
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.lb
    }
}
