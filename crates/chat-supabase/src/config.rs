//! Environment-backed configuration for the Supabase adapter.

use std::env;

use thiserror::Error;
use url::Url;

const DEFAULT_ROOM_ID: &str = "lobby";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Connection settings for one Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    /// Project base URL, e.g. `https://abc.supabase.co`.
    pub url: Url,
    /// Project anon key, sent as `apikey` on every request.
    pub anon_key: String,
    /// User JWT for authenticated requests; falls back to the anon key.
    pub access_token: Option<String>,
    /// Chat room rows are filtered to this room.
    pub room_id: String,
}

impl SupabaseConfig {
    pub fn new(url: Url, anon_key: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            url,
            anon_key: anon_key.into(),
            access_token: None,
            room_id: room_id.into(),
        }
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let raw_url = required_trimmed_env("CALCVAULT_SUPABASE_URL", &mut lookup)?;
        let url = Url::parse(&raw_url).map_err(|err| ConfigError::InvalidValue {
            key: "CALCVAULT_SUPABASE_URL",
            reason: err.to_string(),
        })?;

        let anon_key = required_trimmed_env("CALCVAULT_SUPABASE_ANON_KEY", &mut lookup)?;
        let access_token = optional_trimmed_env("CALCVAULT_SUPABASE_JWT", &mut lookup);
        let room_id = optional_trimmed_env("CALCVAULT_ROOM_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_ROOM_ID.to_owned());

        Ok(Self {
            url,
            anon_key,
            access_token,
            room_id,
        })
    }

    /// Token sent in the `Authorization` header.
    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }

    pub fn rest_endpoint(&self, table: &str) -> String {
        format!("{}rest/v1/{table}", self.base())
    }

    pub fn storage_upload_endpoint(&self, bucket: &str, object: &str) -> String {
        format!("{}storage/v1/object/{bucket}/{object}", self.base())
    }

    pub fn public_object_url(&self, bucket: &str, object: &str) -> String {
        format!("{}storage/v1/object/public/{bucket}/{object}", self.base())
    }

    pub fn functions_endpoint(&self, name: &str) -> String {
        format!("{}functions/v1/{name}", self.base())
    }

    /// Realtime websocket URL, derived from the project URL.
    pub fn realtime_ws_url(&self) -> String {
        let scheme = if self.url.scheme() == "http" { "ws" } else { "wss" };
        let host = self.url.host_str().unwrap_or_default();
        let port = self
            .url
            .port()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        format!(
            "{scheme}://{host}{port}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.anon_key
        )
    }

    fn base(&self) -> String {
        let raw = self.url.as_str();
        if raw.ends_with('/') {
            raw.to_owned()
        } else {
            format!("{raw}/")
        }
    }
}

fn required_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::MissingVar(key))
}

fn optional_trimmed_env<F>(key: &str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl FnMut(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_owned())
        }
    }

    #[test]
    fn parses_required_and_optional_values() {
        let config = SupabaseConfig::from_lookup(lookup(&[
            ("CALCVAULT_SUPABASE_URL", "https://abc.supabase.co"),
            ("CALCVAULT_SUPABASE_ANON_KEY", "anon"),
            ("CALCVAULT_ROOM_ID", "room-7"),
        ]))
        .expect("config should parse");

        assert_eq!(config.anon_key, "anon");
        assert_eq!(config.room_id, "room-7");
        assert_eq!(config.bearer(), "anon");
    }

    #[test]
    fn missing_url_is_an_error() {
        let err = SupabaseConfig::from_lookup(lookup(&[("CALCVAULT_SUPABASE_ANON_KEY", "anon")]))
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::MissingVar("CALCVAULT_SUPABASE_URL")));
    }

    #[test]
    fn endpoints_are_rooted_at_the_project_url() {
        let config = SupabaseConfig::new(
            Url::parse("https://abc.supabase.co").expect("url"),
            "anon",
            "lobby",
        );

        assert_eq!(
            config.rest_endpoint("messages"),
            "https://abc.supabase.co/rest/v1/messages"
        );
        assert_eq!(
            config.public_object_url("chat_images", "u1/x.png"),
            "https://abc.supabase.co/storage/v1/object/public/chat_images/u1/x.png"
        );
        assert!(config.realtime_ws_url().starts_with(
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon"
        ));
    }

    #[test]
    fn user_jwt_takes_over_the_bearer() {
        let mut config = SupabaseConfig::new(
            Url::parse("https://abc.supabase.co").expect("url"),
            "anon",
            "lobby",
        );
        config.access_token = Some("jwt".to_owned());
        assert_eq!(config.bearer(), "jwt");
    }
}
