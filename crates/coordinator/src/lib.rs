//! Switchyard Coordinator
//!
//! Routes chat inference requests across a fleet of heterogeneous model
//! backends. Each request passes per-caller admission, prefix cache lookup
//! and the routing policy before it is forwarded to exactly one backend.
//! The coordinator also owns backend lifecycle: staggered startup, health
//! probing and graceful shutdown.

pub mod admission;
pub mod backend_client;
pub mod descriptor;
pub mod dispatch;
pub mod health;
pub mod ops_server;
pub mod policy;
pub mod prefix_cache;
pub mod router;
pub mod supervisor;

pub use admission::{AdmissionController, AdmissionTicket, QuotaUsage};
pub use backend_client::BackendClient;
pub use descriptor::{BackendDescriptor, DescriptorStore};
pub use dispatch::{Dispatcher, GenerationBackend};
pub use health::{BackendProbe, BackendSnapshot, FleetAlert, HealthTracker};
pub use ops_server::{OpsServer, OpsState};
pub use policy::{CandidateFilter, FilterChain, RouteContext};
pub use prefix_cache::{CacheLookup, PrefixCache, PrefixChain, PrefixKey};
pub use router::{Router, RoutingDecision};
pub use supervisor::{
    BackendProcess, CommandLauncher, LifecycleSupervisor, ProcessLauncher, ShutdownReport, StartupReport,
};
