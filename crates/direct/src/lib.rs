//! Handlers that need no proxy protocol: a direct outbound and a
//! fixed-destination inbound.

mod dokodemo;
mod freedom;

pub use dokodemo::DokodemoServer;
pub use freedom::Freedom;
