pub mod ai;
pub mod error;
pub mod identity;
pub mod messages;
pub mod rooms;
pub mod routes;
pub mod state;
pub mod threads;
pub mod usage;

pub use error::ApiError;
pub use routes::router;
pub use state::{AppState, AppStateInner, RoomSettings};
