//! Session fabric
//!
//! The registry maps call ids to live sessions and enforces tenant
//! concurrency limits; the runner drives one call's pipeline from ingress
//! to playback, honouring the single cancellation handle on every path.

mod cancel;
mod registry;
mod runner;
mod session;

pub use cancel::CancellationHandle;
pub use registry::{AuditSink, PersistenceBackend, RegistryBackend, SessionRegistry};
pub use runner::{CallRunner, NullSink, RunnerDeps, RunnerInput, TurnSink};
pub use session::{Session, SessionError};
