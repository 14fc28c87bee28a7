pub mod aead;
pub mod antireplay;
pub mod auth_id;
pub mod clock;
mod crypto;
pub mod drain;
mod error;
pub mod inbound;
pub mod outbound;
pub mod protocol;
pub mod stream;
pub mod user;
pub mod validator;

pub use crypto::{kdf, kdf16};
pub use error::{Error, Result};
pub use inbound::VmessServer;
pub use outbound::VmessClient;
pub use protocol::Security;
pub use user::{User, ID};
pub use validator::Validator;
