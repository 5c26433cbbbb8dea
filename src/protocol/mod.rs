//! Wire protocol: framing (`frame`) and the typed message codec
//! (`message`).

pub mod frame;
pub mod message;

pub use message::{Message, TaskStatus};
