//! Gateway: the widget HTTP API and process wiring.
//!
//! Lifecycle:
//! 1. Open the state store and prune stale invalid rooms
//! 2. Connect to the homeserver, set up spaces and run the repair pass
//! 3. Verify the bridge account and start the relay and bot transport
//! 4. Serve the widget API until shutdown
//!
//! Handlers are thin adapters over [`deskbridge_widget::WidgetOrchestrator`];
//! all room logic lives in the domain crates.

pub mod error;
pub mod routes;
pub mod server;
pub mod services;
pub mod state;

pub use {
    error::ApiError,
    server::{build_gateway_app, start_gateway},
    services::GatewayServices,
    state::GatewayState,
};
