//! tagpilot orchestration engine: scheduling, bounded dispatch and the
//! cycle/continuous drivers.

pub mod dispatcher;
pub mod driver;
mod error;
pub mod ports;
pub mod run_state;
mod runtime;
pub mod selector;
pub mod worker;

pub use dispatcher::{
    is_due, resolve_concurrency, AppResult, AppWork, DispatchOptions, Dispatcher, InFlight,
    InFlightGuard, PassContext, PassCounters, PassResult,
};
pub use driver::{ContinuousScheduler, Driver};
pub use error::{EngineError, OrchestratorError, ResolveError};
pub use ports::{
    AlwaysHealthy, Collaborators, HealthMonitor, NoopObserver, Observer, OrchestratorClient,
    PassKind, RegistryResolver, SkipReason,
};
pub use run_state::{RunState, RunStats};
pub use runtime::{init_tracing, start_blocking};
pub use selector::{ApplicationSelector, COOLDOWN_PENALTY};
pub use worker::UpdateWorker;
