//! Reporting surface toward the host process
//!
//! The host owns presentation (notifications, foreground status) and the
//! process lifetime. The orchestrator only tells it what happened.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Failed(String),
    Stopped,
}

pub trait ServiceHost: Send + Sync {
    fn report(&self, status: &ServiceStatus);

    /// Ask the host to end the service
    fn stop_self(&self);
}
