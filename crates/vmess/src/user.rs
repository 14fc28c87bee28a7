use md5::{Digest, Md5};
use uuid::Uuid;

const CMD_KEY_SALT: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";

/// A user id together with the command key derived from it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ID {
    pub id: Uuid,
    pub cmd_key: [u8; 16],
}

impl ID {
    pub fn new(id: Uuid) -> Self {
        let mut md5_hasher = Md5::new();
        md5_hasher.update(id.as_bytes());
        md5_hasher.update(CMD_KEY_SALT);
        let mut cmd_key = [0u8; 16];
        cmd_key.copy_from_slice(&md5_hasher.finalize());

        Self { id, cmd_key }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: ID,
    pub level: u32,
    pub email: Option<String>,
}

impl User {
    pub fn new(id: Uuid, level: u32, email: Option<String>) -> Self {
        Self {
            id: ID::new(id),
            level,
            email,
        }
    }

    pub fn cmd_key(&self) -> &[u8; 16] {
        &self.id.cmd_key
    }

    /// Label for logs.
    pub fn name(&self) -> String {
        self.email.clone().unwrap_or_else(|| self.id.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use uuid::uuid;

    use super::*;

    #[test]
    fn cmd_key_hashes_id_with_magic_string() {
        let id = uuid!("b831381d-6324-4d53-ad4f-8cda48b30811");

        let mut hasher = Md5::new();
        hasher.update(id.as_bytes());
        hasher.update(b"c48619fe-8f02-49e0-b9e9-edf763e17e21");
        let expected: [u8; 16] = hasher.finalize().into();

        assert_eq!(ID::new(id).cmd_key, expected);
        assert_ne!(ID::new(Uuid::nil()).cmd_key, expected);
    }
}
