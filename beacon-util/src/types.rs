use std::fmt::{self, Debug, Display};
use std::ops::Deref;

use serde::{Deserialize, Serialize};

/// A base64-encoded symmetric key
///
/// The value never shows up in `Debug` output so keys can travel inside
/// config structs that get traced.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct SymmetricKey(String);

impl SymmetricKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Deref for SymmetricKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

impl Display for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl From<String> for SymmetricKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SymmetricKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_redacts_keys_in_debug_output() {
        let key = SymmetricKey::from("c2VjcmV0");
        assert_eq!(format!("{key:?}"), "SymmetricKey(<redacted>)");
        assert_eq!(key.to_string(), "<redacted>");
        assert_eq!(key.expose(), "c2VjcmV0");
    }
}
