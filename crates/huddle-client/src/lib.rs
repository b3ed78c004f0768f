//! Client-side connection handling for huddle rooms: gateway transport,
//! heartbeat health monitoring, reconnection and the small pieces of view
//! state that depend on gateway events.

pub mod error;
pub mod health;
pub mod manager;
pub mod sidebar;
pub mod transport;
pub mod view;

pub use error::ClientError;
pub use health::{HealthConfig, HealthMonitor, HealthSignal, HealthStatus};
pub use manager::{ClientIdentity, ConnectionManager, ManagerEvent, ReconnectConfig};
pub use sidebar::{Sidebar, SidebarUpdate};
pub use transport::{Transport, WsTransport};
pub use view::{RemovalAction, ThreadView};
