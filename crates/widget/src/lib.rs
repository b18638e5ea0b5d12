//! Website-channel room orchestration.
//!
//! Resolves a (customer, department) pair to exactly one reachable backing
//! room, reusing and re-entering earlier rooms instead of creating new ones.

pub mod error;
pub mod orchestrator;

pub use {
    error::{Error, Result},
    orchestrator::{
        ConnectOutcome, Connection, DisconnectReport, HistoryEntry, WidgetOrchestrator,
    },
};
