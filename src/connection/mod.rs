//! Connection Module
//!
//! Turns listener arrivals into relay pairs.

pub mod acceptor;

pub use acceptor::AcceptLoop;
