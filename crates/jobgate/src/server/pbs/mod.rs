//! PBS/Torque backend: batch jobs go through `qsub`, interactive sessions get a short-lived pool
//! account on the least loaded worker.

pub mod accounts;
pub mod backend;
pub mod load;
pub mod nodes;
pub mod qstat;
pub mod reconcile;

pub use backend::PbsBackend;
