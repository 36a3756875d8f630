//! # Protocol Layer
//!
//! Client-side protocol logic above the framing layer.
//!
//! ## Components
//! - **State**: the connection lifecycle enumeration
//! - **Dispatcher**: header parsing per routing mode and handler dispatch
//! - **Handlers**: relay and gameplay packet handlers
//! - **Events**: the single consumer queue and consumer-owned session data

pub mod dispatcher;
pub mod events;
pub mod handlers;
pub mod state;

#[cfg(test)]
mod tests;
