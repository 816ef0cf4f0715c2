use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Deref;

/// A [`Secret<String>`] that can be read from and written to configuration files.
///
/// Debug output never contains the wrapped value.
pub struct SerializableSecretString(Secret<String>);

impl SerializableSecretString {
    /// Returns the secret as a plain string slice.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for SerializableSecretString {
    fn clone(&self) -> Self {
        Self(Secret::new(self.0.expose_secret().clone()))
    }
}

impl Deref for SerializableSecretString {
    type Target = Secret<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for SerializableSecretString {
    fn from(value: String) -> Self {
        Self(Secret::new(value))
    }
}

impl From<&str> for SerializableSecretString {
    fn from(value: &str) -> Self {
        Self(Secret::new(value.to_owned()))
    }
}

impl Serialize for SerializableSecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.0.expose_secret())
    }
}

impl<'de> Deserialize<'de> for SerializableSecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;

        Ok(Self(Secret::new(string)))
    }
}

impl fmt::Debug for SerializableSecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}
