//! Duplex-pipe contract for the encryption/obfuscation layer.
//!
//! Concrete ciphers live outside this crate. A pipeline takes ownership of the raw
//! transport stream and hands back a stream that decrypts on read and encrypts on
//! write; the rest of the client only ever reads and writes plaintext frames.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Anything usable as a bidirectional byte pipe
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased duplex stream
pub type BoxedStream = Box<dyn DuplexStream>;

/// Wraps a transport in an encrypt/decrypt pipe.
pub trait CipherPipeline: Send + Sync + 'static {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Take ownership of `stream` and return the ciphered pipe.
    ///
    /// # Errors
    /// Implementations fail if the cipher cannot be initialized (missing keys,
    /// bad key file). The stream is dropped in that case.
    fn wrap(&self, stream: BoxedStream) -> Result<BoxedStream>;
}

/// Pipeline that returns the stream untouched, for plaintext servers and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl CipherPipeline for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn wrap(&self, stream: BoxedStream) -> Result<BoxedStream> {
        Ok(stream)
    }
}
