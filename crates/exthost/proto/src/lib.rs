//! Wire types for the vesper extension-host channel.
//!
//! This crate defines everything both ends of the channel must agree on:
//! the frame header layout, the RPC envelope, the handshake control bytes,
//! the init blob, and the editor/document delta shapes shipped to the guest.

pub mod editors;
pub mod frame;
pub mod init;
pub mod paths;
pub mod rpc;
pub mod shapes;
pub mod types;
