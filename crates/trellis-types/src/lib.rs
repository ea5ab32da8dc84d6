pub mod chat;
pub mod event;

pub use chat::*;
pub use event::*;
