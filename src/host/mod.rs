//! Host-facing contract, command routing and the stdio bridge to the
//! browser extension.

pub mod channel;
pub mod contract;
pub mod remote;
pub mod service;
pub mod stdio;
