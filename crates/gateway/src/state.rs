use std::sync::Arc;

use deskbridge_widget::WidgetOrchestrator;

/// Shared state behind every widget API handler.
pub struct GatewayState {
    pub widget: Arc<WidgetOrchestrator>,
    pub version: String,
}

impl GatewayState {
    pub fn new(widget: Arc<WidgetOrchestrator>) -> Arc<Self> {
        Arc::new(Self {
            widget,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
