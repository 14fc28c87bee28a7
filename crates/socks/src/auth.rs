use std::fmt::{Display, Formatter};

use crate::Version;

/// Method selection message sent back after the client greeting.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HandshakeResponse {
    pub(crate) version: Version,
    pub(crate) method: AuthMethod,
}

impl HandshakeResponse {
    pub(crate) fn new(method: AuthMethod) -> Self {
        Self {
            version: Version::Socks5,
            method,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; 2] {
        [self.version as u8, self.method as u8]
    }
}

impl Display for HandshakeResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}", self.version, self.method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[allow(dead_code)]
pub(crate) enum AuthMethod {
    #[default]
    NoAuth = 0,
    GssApi = 1,
    UserPass = 2,
    NoAcceptable = 255,
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAuth => write!(f, "no authentication"),
            Self::GssApi => write!(f, "GSSAPI"),
            Self::UserPass => write!(f, "username/password"),
            Self::NoAcceptable => write!(f, "no acceptable methods"),
        }
    }
}

impl AuthMethod {
    /// The method picked from the client's offer. Only `NoAuth` is served.
    pub(crate) fn select(offered: &[u8]) -> Self {
        if offered.contains(&(Self::NoAuth as u8)) {
            Self::NoAuth
        } else {
            Self::NoAcceptable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_no_auth_only() {
        assert_eq!(AuthMethod::select(&[2, 0]), AuthMethod::NoAuth);
        assert_eq!(AuthMethod::select(&[1, 2]), AuthMethod::NoAcceptable);
        assert_eq!(AuthMethod::select(&[]), AuthMethod::NoAcceptable);
    }

    #[test]
    fn response_bytes() {
        assert_eq!(HandshakeResponse::new(AuthMethod::NoAuth).to_bytes(), [5, 0]);
        assert_eq!(
            HandshakeResponse::new(AuthMethod::NoAcceptable).to_bytes(),
            [5, 0xff]
        );
    }
}
