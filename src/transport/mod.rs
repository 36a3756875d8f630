//! # Transport Layer
//!
//! The byte-stream side of a connection: a TCP socket, optionally wrapped by an
//! external cipher pipeline. Everything above this layer sees one
//! [`BoxedStream`](cipher::BoxedStream) and does not know whether it is encrypted.

pub mod cipher;

pub use cipher::{BoxedStream, CipherPipeline, DuplexStream, Passthrough};
