//! Free-form option tables handed to registry constructors.
//!
//! Configuration files carry a `kind`/`name` key plus arbitrary extra keys.
//! The extra keys are collected into an [`Options`] map and each constructor
//! deserializes them into its own typed options struct.

use serde::de::DeserializeOwned;

/// Untyped key/value options as read from a configuration file.
pub type Options = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
#[error("invalid options for '{name}': {source}")]
pub struct OptionsError {
    pub name: String,
    #[source]
    pub source: serde_json::Error,
}

/// Deserialize `options` into `T`, naming `name` in the error.
pub fn parse_options<T: DeserializeOwned>(name: &str, options: &Options) -> Result<T, OptionsError> {
    serde_json::from_value(serde_json::Value::Object(options.clone())).map_err(|source| {
        OptionsError {
            name: name.to_string(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        port: u16,
        #[serde(default)]
        verbose: bool,
    }

    #[test]
    fn parses_typed_options() {
        let mut opts = Options::new();
        opts.insert("port".into(), 8080.into());
        let sample: Sample = parse_options("sample", &opts).unwrap();
        assert_eq!(
            sample,
            Sample {
                port: 8080,
                verbose: false
            }
        );
    }

    #[test]
    fn reports_owner_on_failure() {
        let mut opts = Options::new();
        opts.insert("port".into(), "not a port".into());
        let err = parse_options::<Sample>("sample", &opts).unwrap_err();
        assert_eq!(err.name, "sample");
        assert!(err.to_string().starts_with("invalid options for 'sample'"));
    }
}
