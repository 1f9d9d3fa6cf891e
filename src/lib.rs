//! Pooled remote execution for multi-host experiment testbeds.
//!
//! The [`remote`] module owns everything between a host name in the
//! inventory and a finished command on that host: inventory resolution,
//! jump-host tunneling, session pooling and sync/detached execution.

pub mod remote;
