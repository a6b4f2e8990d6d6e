//! Replicated operation histories that converge without locks.
//!
//! [`ot`] holds the operational transformation core: commit graphs of
//! operations, merging of divergent heads and a client state manager.
//! [`global`] replicates those graphs between master and relay nodes with
//! encrypted, content addressed commits and signed heads.

pub mod config;
pub mod global;
pub mod ot;

pub use config::NodeConfig;
pub use config::RetryPolicy;
