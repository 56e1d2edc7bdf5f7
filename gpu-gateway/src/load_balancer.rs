use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::GpuInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    EqualWeighted,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::EqualWeighted => "equal_weighted",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::LeastResponseTime => "least_response_time",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown load balancing strategy '{0}'")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "round_robin" => Ok(Strategy::RoundRobin),
            "equal_weighted" => Ok(Strategy::EqualWeighted),
            "weighted_round_robin" => Ok(Strategy::WeightedRoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "least_response_time" => Ok(Strategy::LeastResponseTime),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// Live counters for one backend instance. Strategy-independent; swapping the
/// strategy keeps the table.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceLoad {
    pub provider: String,
    pub active_connections: u64,
    pub total_connections: u64,
    pub last_response_time_ms: Option<f64>,
    pub avg_response_time_ms: Option<f64>,
    pub weight: u32,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl InstanceLoad {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            active_connections: 0,
            total_connections: 0,
            last_response_time_ms: None,
            avg_response_time_ms: None,
            weight: 0,
            last_used_at: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PickError {
    #[error("no backend capacity for the request")]
    NoCapacity,
}

/// Static weight from hardware tier and price. Bigger VRAM ranks higher,
/// cheaper instances get a bonus.
fn static_weight(instance: &GpuInstance) -> u32 {
    let vram = match instance.vram_gb {
        vram if vram >= 80 => 100,
        vram if vram >= 40 => 60,
        vram if vram >= 24 => 40,
        vram if vram >= 16 => 30,
        _ => 20,
    };
    let price_bonus = if instance.price_per_hour < 1.0 {
        20
    } else if instance.price_per_hour < 2.0 {
        10
    } else {
        0
    };
    vram + price_bonus
}

pub struct LoadBalancer {
    loads: Mutex<HashMap<String, InstanceLoad>>,
    cursor: AtomicUsize,
    strategy: RwLock<Strategy>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            loads: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
            strategy: RwLock::new(strategy),
        }
    }

    pub fn strategy(&self) -> Strategy {
        *self.strategy.read().expect("rwlock poisoned")
    }

    /// Runtime swap; the load table survives.
    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.write().expect("rwlock poisoned") = strategy;
    }

    pub fn pick(&self, candidates: &[GpuInstance]) -> Result<GpuInstance, PickError> {
        if candidates.is_empty() {
            return Err(PickError::NoCapacity);
        }
        let strategy = self.strategy();
        let chosen = match strategy {
            Strategy::RoundRobin => {
                let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[slot].clone()
            }
            Strategy::EqualWeighted => {
                let guard = self.loads.lock().expect("mutex poisoned");
                candidates
                    .iter()
                    .min_by_key(|candidate| {
                        guard.get(&candidate.id).map(|load| load.total_connections).unwrap_or(0)
                    })
                    .expect("non-empty candidates")
                    .clone()
            }
            Strategy::WeightedRoundRobin => {
                // Ties resolve to the first candidate in input order.
                let mut best = &candidates[0];
                for candidate in &candidates[1..] {
                    if static_weight(candidate) > static_weight(best) {
                        best = candidate;
                    }
                }
                best.clone()
            }
            Strategy::LeastConnections => {
                let guard = self.loads.lock().expect("mutex poisoned");
                candidates
                    .iter()
                    .min_by_key(|candidate| {
                        guard.get(&candidate.id).map(|load| load.active_connections).unwrap_or(0)
                    })
                    .expect("non-empty candidates")
                    .clone()
            }
            Strategy::LeastResponseTime => {
                let guard = self.loads.lock().expect("mutex poisoned");
                // An unmeasured candidate wins ahead of any measured one so
                // new instances get explored.
                candidates
                    .iter()
                    .min_by(|a, b| {
                        let time_a = guard.get(&a.id).and_then(|load| load.avg_response_time_ms);
                        let time_b = guard.get(&b.id).and_then(|load| load.avg_response_time_ms);
                        match (time_a, time_b) {
                            (None, None) => std::cmp::Ordering::Equal,
                            (None, Some(_)) => std::cmp::Ordering::Less,
                            (Some(_), None) => std::cmp::Ordering::Greater,
                            (Some(a), Some(b)) => {
                                a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
                            }
                        }
                    })
                    .expect("non-empty candidates")
                    .clone()
            }
        };
        Ok(chosen)
    }

    pub fn on_dispatch(&self, instance: &GpuInstance) {
        let mut guard = self.loads.lock().expect("mutex poisoned");
        let load = guard
            .entry(instance.id.clone())
            .or_insert_with(|| InstanceLoad::new(&instance.provider));
        load.active_connections += 1;
        load.total_connections += 1;
        load.weight = static_weight(instance);
        load.last_used_at = Some(Utc::now());
    }

    /// Saturating decrement; an underflow is a bookkeeping bug upstream but
    /// never a panic here.
    pub fn on_release(&self, instance_id: &str) {
        let mut guard = self.loads.lock().expect("mutex poisoned");
        if let Some(load) = guard.get_mut(instance_id) {
            load.active_connections = load.active_connections.saturating_sub(1);
        }
    }

    pub fn on_response_time(&self, instance: &GpuInstance, elapsed: Duration) {
        let sample_ms = elapsed.as_secs_f64() * 1000.0;
        let mut guard = self.loads.lock().expect("mutex poisoned");
        let load = guard
            .entry(instance.id.clone())
            .or_insert_with(|| InstanceLoad::new(&instance.provider));
        load.last_response_time_ms = Some(sample_ms);
        load.avg_response_time_ms = Some(match load.avg_response_time_ms {
            Some(avg) => (avg + sample_ms) / 2.0,
            None => sample_ms,
        });
    }

    /// Defensive copy of the load table.
    pub fn loads(&self) -> HashMap<String, InstanceLoad> {
        self.loads.lock().expect("mutex poisoned").clone()
    }

    pub fn active_connections(&self, instance_id: &str) -> u64 {
        self.loads
            .lock()
            .expect("mutex poisoned")
            .get(instance_id)
            .map(|load| load.active_connections)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, vram: u32, price: f64) -> GpuInstance {
        GpuInstance {
            id: id.into(),
            provider: "test".into(),
            model_name: "A100".into(),
            gpu_count: 1,
            vram_gb: vram,
            cpu_cores: 8,
            ram_gb: 64,
            storage_gb: 256,
            price_per_hour: price,
            location: "us".into(),
            available: true,
            specifications: serde_json::Value::Null,
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let candidates = vec![instance("a", 24, 1.0), instance("b", 24, 1.0)];
        assert_eq!(lb.pick(&candidates).unwrap().id, "a");
        assert_eq!(lb.pick(&candidates).unwrap().id, "b");
        assert_eq!(lb.pick(&candidates).unwrap().id, "a");
    }

    #[test]
    fn empty_candidates_is_no_capacity() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        assert_eq!(lb.pick(&[]), Err(PickError::NoCapacity));
    }

    #[test]
    fn least_connections_prefers_idle() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        let candidates = vec![instance("a", 24, 1.0), instance("b", 24, 1.0)];
        lb.on_dispatch(&candidates[0]);
        assert_eq!(lb.pick(&candidates).unwrap().id, "b");
        lb.on_release("a");
        // Tie resolves to input order.
        assert_eq!(lb.pick(&candidates).unwrap().id, "a");
    }

    #[test]
    fn weighted_round_robin_prefers_vram_then_price() {
        let lb = LoadBalancer::new(Strategy::WeightedRoundRobin);
        let candidates =
            vec![instance("small", 24, 0.5), instance("big", 80, 2.5), instance("mid", 40, 0.9)];
        assert_eq!(lb.pick(&candidates).unwrap().id, "big");
        let cheap_tie =
            vec![instance("pricey", 40, 2.5), instance("cheap", 40, 0.5)];
        assert_eq!(lb.pick(&cheap_tie).unwrap().id, "cheap");
        let exact_tie = vec![instance("first", 40, 0.5), instance("second", 40, 0.5)];
        assert_eq!(lb.pick(&exact_tie).unwrap().id, "first", "tie resolves to input order");
    }

    #[test]
    fn least_response_time_bootstraps_unmeasured() {
        let lb = LoadBalancer::new(Strategy::LeastResponseTime);
        let candidates = vec![instance("a", 24, 1.0), instance("b", 24, 1.0)];
        lb.on_response_time(&candidates[0], Duration::from_millis(10));
        // b was never measured, so it wins even though a is fast.
        assert_eq!(lb.pick(&candidates).unwrap().id, "b");
        lb.on_response_time(&candidates[1], Duration::from_millis(40));
        assert_eq!(lb.pick(&candidates).unwrap().id, "a");
    }

    #[test]
    fn response_time_uses_half_half_average() {
        let lb = LoadBalancer::new(Strategy::LeastResponseTime);
        let a = instance("a", 24, 1.0);
        lb.on_response_time(&a, Duration::from_millis(100));
        lb.on_response_time(&a, Duration::from_millis(50));
        let loads = lb.loads();
        assert_eq!(loads["a"].avg_response_time_ms, Some(75.0));
        assert_eq!(loads["a"].last_response_time_ms, Some(50.0));
    }

    #[test]
    fn release_saturates_at_zero() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let a = instance("a", 24, 1.0);
        lb.on_dispatch(&a);
        lb.on_release("a");
        lb.on_release("a");
        assert_eq!(lb.active_connections("a"), 0);
    }

    #[test]
    fn strategy_swap_keeps_load_table() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let a = instance("a", 24, 1.0);
        lb.on_dispatch(&a);
        lb.set_strategy(Strategy::LeastConnections);
        assert_eq!(lb.strategy(), Strategy::LeastConnections);
        assert_eq!(lb.loads()["a"].total_connections, 1);
    }
}
