//! Send and melt operation sagas, plus the startup recovery
//! orchestrator.
//!
//! Every phase runs as one storage transaction and persists the
//! operation record before returning, so the recovery paths can pick
//! up from any crash point.

pub mod melt;
pub mod recovery;
pub mod send;

pub use melt::MeltSaga;
pub use recovery::RecoveryOrchestrator;
pub use send::SendSaga;
