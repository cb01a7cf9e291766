//! PostgREST, storage, and functions access over `reqwest`.

use std::sync::Arc;

use chat_core::{
    ClientError, ClientErrorCategory, Message, NewMessage, PageRange, REACTION_CONFLICT_KEYS,
    ReactionRow, classify_http_status,
};
use reqwest::{Response, header};
use serde_json::Value;
use tracing::debug;

use crate::config::SupabaseConfig;

pub const MESSAGES_TABLE: &str = "messages";
pub const REACTIONS_TABLE: &str = "message_reactions";

/// Thin client over the Supabase HTTP surfaces.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    config: Arc<SupabaseConfig>,
}

impl RestClient {
    pub fn new(config: Arc<SupabaseConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Ranged history read, newest first.
    pub async fn select_messages(&self, range: PageRange) -> Result<Vec<Message>, ClientError> {
        let room_filter = format!("eq.{}", self.config.room_id);
        let response = self
            .http
            .get(self.config.rest_endpoint(MESSAGES_TABLE))
            .query(&[
                ("select", "*"),
                ("chat_room_id", room_filter.as_str()),
                ("order", "created_at.desc"),
            ])
            .headers(self.auth_headers())
            .header(header::RANGE, format!("{}-{}", range.from, range.to))
            .send()
            .await
            .map_err(|err| transport_error("select_failed", err))?;

        let response = check_status(response, "select_failed").await?;
        response
            .json::<Vec<Message>>()
            .await
            .map_err(|err| decode_error("select_decode_failed", err))
    }

    /// Insert one message row; the row comes back via realtime, not here.
    pub async fn insert_message(&self, row: NewMessage) -> Result<(), ClientError> {
        let mut body = serde_json::to_value(&row)
            .map_err(|err| decode_error("insert_encode_failed", err))?;
        if let Value::Object(fields) = &mut body {
            fields.insert(
                "chat_room_id".to_owned(),
                Value::String(self.config.room_id.clone()),
            );
        }

        let response = self
            .http
            .post(self.config.rest_endpoint(MESSAGES_TABLE))
            .headers(self.auth_headers())
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error("insert_failed", err))?;

        check_status(response, "insert_failed").await?;
        Ok(())
    }

    /// Reaction upsert; a duplicate merges instead of erroring.
    pub async fn upsert_reaction(&self, row: ReactionRow) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.config.rest_endpoint(REACTIONS_TABLE))
            .query(&[("on_conflict", REACTION_CONFLICT_KEYS)])
            .headers(self.auth_headers())
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&row)
            .send()
            .await
            .map_err(|err| transport_error("reaction_failed", err))?;

        check_status(response, "reaction_failed").await?;
        Ok(())
    }

    /// Upload a blob and return its public URL.
    pub async fn upload_blob(
        &self,
        bucket: &str,
        object: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ClientError> {
        debug!(bucket, object, bytes = data.len(), "uploading blob");
        let response = self
            .http
            .post(self.config.storage_upload_endpoint(bucket, object))
            .headers(self.auth_headers())
            .header(header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(|err| transport_error("upload_failed", err))?;

        check_status(response, "upload_failed").await?;
        Ok(self.config.public_object_url(bucket, object))
    }

    /// Invoke an edge function with a JSON body.
    pub async fn invoke_function(
        &self,
        name: &str,
        body: Value,
    ) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(self.config.functions_endpoint(name))
            .headers(self.auth_headers())
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error("function_failed", err))?;

        let response = check_status(response, "function_failed").await?;
        response
            .json::<Value>()
            .await
            .map_err(|err| decode_error("function_decode_failed", err))
    }

    fn auth_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        if let Ok(value) = header::HeaderValue::from_str(&self.config.anon_key) {
            headers.insert("apikey", value);
        }
        if let Ok(value) =
            header::HeaderValue::from_str(&format!("Bearer {}", self.config.bearer()))
        {
            headers.insert(header::AUTHORIZATION, value);
        }
        headers
    }
}

async fn check_status(response: Response, code: &str) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_ms = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(|seconds| seconds * 1_000);

    let body = response.text().await.unwrap_or_default();
    let mut error = ClientError::new(
        classify_http_status(status.as_u16()),
        code,
        format!("backend returned {status}: {}", truncate(&body, 300)),
    );
    error.retry_after_ms = retry_after_ms;
    Err(error)
}

fn transport_error(code: &str, err: reqwest::Error) -> ClientError {
    ClientError::new(ClientErrorCategory::Network, code, err.to_string())
}

fn decode_error(code: &str, err: impl std::fmt::Display) -> ClientError {
    ClientError::new(ClientErrorCategory::Serialization, code, err.to_string())
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 3), "hél");
        assert_eq!(truncate("short", 300), "short");
    }
}
