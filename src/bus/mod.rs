//! Framed message-bus over named FIFOs.

pub mod endpoint;
pub mod listen;

pub use endpoint::{Endpoint, Role};
pub use listen::listen;
