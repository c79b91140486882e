//! Remoted isolation: plugins run in a separate container process and the
//! host talks to it over a framed byte stream.

mod client;
mod protocol;
mod server;

pub use client::*;
pub use protocol::*;
pub use server::*;
