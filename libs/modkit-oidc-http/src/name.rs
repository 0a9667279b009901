use std::borrow::Cow;
use std::fmt;

/// Registry name of the back-channel client, derived from this crate's package name.
const BACKCHANNEL_CLIENT_NAME: &str = concat!(env!("CARGO_PKG_NAME"), ".backchannel");

/// Logical name under which one handler/client pair is cached by the
/// [`ClientRegistry`](crate::ClientRegistry).
///
/// Names are compared exactly: `"a.backchannel"` and `"a.backchannel.v2"` are
/// unrelated clients, and so are names differing only in case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientName(Cow<'static, str>);

impl ClientName {
    /// Create a name for a client owned by some other consumer of the registry.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The name of the hardened OAuth/OIDC back-channel client.
    #[must_use]
    pub const fn backchannel() -> Self {
        Self(Cow::Borrowed(BACKCHANNEL_CLIENT_NAME))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the back-channel client (exact match only).
    #[must_use]
    pub fn is_backchannel(&self) -> bool {
        self.0 == BACKCHANNEL_CLIENT_NAME
    }
}

impl fmt::Display for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ClientName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}
