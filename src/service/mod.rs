/// Service lifecycle: command queue, orchestration and host reporting
pub mod host;
pub mod orchestrator;
pub mod signal;

pub use host::{ServiceHost, ServiceStatus};
pub use orchestrator::{ServiceError, ServiceOrchestrator, ServiceState};
pub use signal::{channel, ServiceCommand, ServiceHandle};
