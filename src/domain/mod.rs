//! Domain types, the orchestration state machine and the ports the
//! application layer depends on.

pub mod charge;
pub mod orchestration;
pub mod ports;
pub mod retry;
