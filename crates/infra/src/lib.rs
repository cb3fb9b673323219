//! Infrastructure layer: event stores, command orchestration, distribution,
//! streaming, caching and read models.

pub mod cache;
pub mod command_orchestrator;
pub mod event_store;
pub mod projections;
pub mod relay;
pub mod retry;
pub mod stream;
pub mod workers;


pub use command_orchestrator::{CommandError, CommandOrchestrator, OrchestratorConfig};
pub use relay::{CommitNotifier, EventRelay, RelayConfig};
pub use retry::RetryPolicy;
