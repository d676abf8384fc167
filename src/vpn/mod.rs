/// Tunnel device lifecycle and default-network handling
pub mod routing;
pub mod tunnel;
pub mod watcher;

pub use routing::{parse_route, parse_routes, Route, RouteError};
pub use tunnel::{TunnelController, TunnelError, TunnelHandle, NO_TUNNEL_FD};
pub use watcher::{NetworkObservation, NetworkResync, NetworkWatcher};
