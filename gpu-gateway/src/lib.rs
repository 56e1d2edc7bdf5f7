pub mod app;
pub mod app_state;
pub mod audit_store;
pub mod auth;
pub mod auth_handlers;
pub mod config;
pub mod gpu_handlers;
pub mod guardrails;
pub mod guardrails_handlers;
pub mod inventory;
pub mod ip_access;
pub mod lb_handlers;
pub mod load_balancer;
pub mod metrics;
pub mod pipeline;
pub mod port_alloc;
pub mod providers;
pub mod proxy;
pub mod resilience;
pub mod usage;

// Re-export key types for tests
pub use crate::app_state::AppState;
pub use crate::config::GatewayConfig;
pub use crate::guardrails::{GuardRails, InMemorySpendStore, SpendStore, SPENDING_WINDOWS};
pub use crate::inventory::{GpuInventory, InstanceFilter, Reservation, ReservationState};
pub use crate::load_balancer::{LoadBalancer, Strategy};
pub use crate::metrics::GatewayMetrics;
pub use crate::port_alloc::{PortAllocator, PortClass};
pub use crate::providers::{GpuInstance, ProviderAdapter, ProviderError, ProviderRegistry};
pub use uuid::Uuid;
