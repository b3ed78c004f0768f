pub mod activity;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod streams;

pub use connection::{GatewayContext, Identity, handle_connection};
pub use dispatcher::Dispatcher;
pub use error::GatewayError;
