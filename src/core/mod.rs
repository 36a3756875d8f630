//! # Core Protocol Components
//!
//! Frame headers, stream framing and outbound packet encoding.
//!
//! ## Components
//! - **Packet**: frame markers and the header parser shared by both routing modes
//! - **Codec**: Tokio codec cutting complete frames out of a byte stream
//! - **Builder**: encoders for every outbound request
//!
//! ## Wire Format
//! ```text
//! C1/C3: [marker] [len u8]      [code] [sub-code?] [body...]
//! C2/C4: [marker] [len u16 BE]  [code] [sub-code?] [body...]
//! ```
//! The sub-code byte exists only for codes in the active routing mode's
//! sub-code set.

pub mod builder;
pub mod codec;
pub mod packet;
