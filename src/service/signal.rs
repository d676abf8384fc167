//! Lifecycle commands delivered to the orchestrator

use crate::config::TunnelConfig;
use crate::service::orchestrator::ServiceError;
use tokio::sync::mpsc;

/// Depth of the command queue between the host and the orchestrator
pub const COMMAND_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCommand {
    /// Create or refresh the tunnel. `None` keeps the service running
    /// without touching the tunnel.
    Start(Option<TunnelConfig>),
    /// The OS withdrew VPN permission
    Revoke,
    Destroy,
}

/// Sending side of the command queue
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<ServiceCommand>,
}

/// Create a handle and the receiver to pass to
/// [`ServiceOrchestrator::run`](crate::service::ServiceOrchestrator::run).
pub fn channel() -> (ServiceHandle, mpsc::Receiver<ServiceCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    (ServiceHandle { tx }, rx)
}

impl ServiceHandle {
    pub async fn send(&self, command: ServiceCommand) -> Result<(), ServiceError> {
        self.tx.send(command).await.map_err(|_| ServiceError::Closed)
    }

    pub async fn start(&self, config: Option<TunnelConfig>) -> Result<(), ServiceError> {
        self.send(ServiceCommand::Start(config)).await
    }

    pub async fn revoke(&self) -> Result<(), ServiceError> {
        self.send(ServiceCommand::Revoke).await
    }

    pub async fn destroy(&self) -> Result<(), ServiceError> {
        self.send(ServiceCommand::Destroy).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_arrive_in_order() {
        let (handle, mut rx) = channel();
        handle.start(None).await.unwrap();
        handle.start(Some(TunnelConfig::default())).await.unwrap();
        handle.revoke().await.unwrap();
        handle.destroy().await.unwrap();

        assert_eq!(rx.recv().await, Some(ServiceCommand::Start(None)));
        assert_eq!(
            rx.recv().await,
            Some(ServiceCommand::Start(Some(TunnelConfig::default())))
        );
        assert_eq!(rx.recv().await, Some(ServiceCommand::Revoke));
        assert_eq!(rx.recv().await, Some(ServiceCommand::Destroy));
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (handle, rx) = channel();
        drop(rx);
        assert!(handle.is_closed());
        let err = handle.destroy().await.unwrap_err();
        assert!(matches!(err, ServiceError::Closed));
    }
}
