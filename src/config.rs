//! Configuration binding for watcher backends.
//!
//! Backends are configured through a free-form string-to-string map. The map
//! is bound to a backend-specific struct by field name through serde, so the
//! recognised keys are the struct's field names. Boolean-valued keys go
//! through [`Flag`], which accepts the loose string forms configuration
//! sources tend to produce.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, WatchError};

/// String-keyed option map accepted by [`Watcher::set_config`].
///
/// [`Watcher::set_config`]: crate::Watcher::set_config
pub type Options = HashMap<String, String>;

/// Bind an option map to a backend configuration struct.
///
/// Unknown keys are ignored; missing keys take their defaults. Required
/// fields are validated by the backend after binding.
pub(crate) fn bind<C: DeserializeOwned>(options: &Options) -> Result<C> {
    let value = serde_json::to_value(options)?;
    serde_json::from_value(value).map_err(|e| WatchError::BadConfig(e.to_string()))
}

/// A boolean carried as a string on the wire.
///
/// Decoding accepts a JSON string: `"1"` and `"true"` are true, any other
/// string is false, and a non-string value is a decode error. Encoding always
/// produces the canonical JSON `true` / `false` tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flag(pub bool);

impl Flag {
    /// The wrapped boolean.
    pub fn get(self) -> bool {
        self.0
    }
}

impl From<bool> for Flag {
    fn from(value: bool) -> Self {
        Flag(value)
    }
}

impl From<Flag> for bool {
    fn from(flag: Flag) -> Self {
        flag.0
    }
}

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Flag(text == "1" || text == "true"))
    }
}

impl Serialize for Flag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bool(self.0)
    }
}

/// An OAuth token as serialised into the `token` configuration key.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OAuthToken {
    pub access_token: String,
}

impl OAuthToken {
    /// Parse the JSON-serialised token carried in a configuration value.
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| WatchError::BadConfig(format!("token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
    struct Holder {
        #[serde(default, rename = "B")]
        b: Flag,
    }

    #[test]
    fn test_flag_decodes_loose_strings() {
        let h: Holder = serde_json::from_str(r#"{"B":"true"}"#).unwrap();
        assert_eq!(h.b, Flag(true));

        let h: Holder = serde_json::from_str(r#"{"B":"1"}"#).unwrap();
        assert_eq!(h.b, Flag(true));

        let h: Holder = serde_json::from_str(r#"{"B":"false"}"#).unwrap();
        assert_eq!(h.b, Flag(false));

        let h: Holder = serde_json::from_str(r#"{"B":"anything"}"#).unwrap();
        assert_eq!(h.b, Flag(false));
    }

    #[test]
    fn test_flag_rejects_non_string() {
        assert!(serde_json::from_str::<Holder>(r#"{"B":false}"#).is_err());
        assert!(serde_json::from_str::<Holder>(r#"{"B":1}"#).is_err());
    }

    #[test]
    fn test_flag_encodes_canonical_booleans() {
        assert_eq!(
            serde_json::to_string(&Holder { b: Flag(true) }).unwrap(),
            r#"{"B":true}"#
        );
        assert_eq!(
            serde_json::to_string(&Holder { b: Flag(false) }).unwrap(),
            r#"{"B":false}"#
        );
    }

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        name: String,
        #[serde(default)]
        enabled: Flag,
    }

    #[test]
    fn test_bind_maps_by_field_name() {
        let mut options = Options::new();
        options.insert("name".to_string(), "demo".to_string());
        options.insert("enabled".to_string(), "1".to_string());
        options.insert("ignored".to_string(), "whatever".to_string());

        let sample: Sample = bind(&options).unwrap();
        assert_eq!(sample.name, "demo");
        assert!(sample.enabled.get());
    }

    #[test]
    fn test_bind_defaults_missing_keys() {
        let sample: Sample = bind(&Options::new()).unwrap();
        assert_eq!(sample.name, "");
        assert!(!sample.enabled.get());
    }

    #[test]
    fn test_oauth_token_parse() {
        let token = OAuthToken::parse(r#"{"access_token": "xxx"}"#).unwrap();
        assert_eq!(token.access_token, "xxx");
        assert!(OAuthToken::parse("bad").is_err());
    }
}
