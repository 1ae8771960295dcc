//! Persisted operation (saga) records.
//!
//! Operations are tagged sum types over their lifecycle states. The
//! prepared-and-later variants carry the full prepared record so that a
//! crash at any point leaves enough on disk to roll forward or back.

mod melt;
mod send;

pub use melt::{MeltOperation, MeltPrepared, MeltState};
pub use send::{SendMethod, SendOperation, SendPending, SendPrepared, SendRollback, SendState};
