//! Hosted tables over the PostgREST and storage HTTP APIs.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chat_core::{MediaUpload, SyncError, SyncErrorCategory, classify_http_status};
use reqwest::{RequestBuilder, Response, StatusCode, header};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, trace};
use url::Url;

use crate::{
    config::HostedConfig,
    schema::{UserChatsRow, UserRow, decode_row},
    tables::{Revision, Tables, Versioned},
};

const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Access token shared between the auth session and the HTTP clients.
#[derive(Debug, Clone, Default)]
pub struct AccessToken(Arc<RwLock<Option<String>>>);

impl AccessToken {
    pub fn set(&self, token: Option<String>) {
        if let Ok(mut slot) = self.0.write() {
            *slot = token;
        }
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().ok().and_then(|slot| slot.clone())
    }
}

/// [`Tables`] backed by the hosted service's REST endpoints.
///
/// The REST store has no revision column. A `userchats` read keeps the raw
/// `chats` value as a [`Revision::Snapshot`], and a conditional write filters
/// on it so a row changed in between matches nothing and reports `Conflict`.
#[derive(Clone)]
pub struct RestTables {
    http: reqwest::Client,
    config: HostedConfig,
    token: AccessToken,
}

impl RestTables {
    pub fn new(config: HostedConfig, token: AccessToken) -> Result<Self, SyncError> {
        let http = build_http_client(&config)?;
        Ok(Self {
            http,
            config,
            token,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .token
            .get()
            .unwrap_or_else(|| self.config.anon_key.clone());
        request
            .header("apikey", &self.config.anon_key)
            .bearer_auth(bearer)
    }

    fn filtered(&self, table: &str, column: &str, value: &str) -> Url {
        let mut url = self.config.rest_url(table);
        url.query_pairs_mut()
            .append_pair(column, &format!("eq.{value}"))
            .append_pair("select", "*");
        url
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<T, SyncError> {
        let request = self
            .http
            .get(self.filtered(table, column, value))
            .header(header::ACCEPT, SINGLE_OBJECT);
        let response = send(self.authorize(request), table).await?;
        let body: Value = read_json(response, table).await?;
        decode_row(table, body)
    }

    async fn select_many<T: DeserializeOwned>(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<T>, SyncError> {
        let request = self.http.get(self.filtered(table, column, value));
        let response = send(self.authorize(request), table).await?;
        let body: Vec<Value> = read_json(response, table).await?;
        body.into_iter().map(|row| decode_row(table, row)).collect()
    }

    async fn patch(&self, table: &str, id: &str, body: Value) -> Result<(), SyncError> {
        let updated = self.patch_matching(self.filtered(table, "id", id), table, body).await?;
        if updated == 0 {
            return Err(SyncError::not_found(
                format!("{table}_not_found"),
                format!("no {table} row for {id}"),
            ));
        }
        Ok(())
    }

    /// PATCH every row `url` selects and return how many were updated.
    async fn patch_matching(&self, url: Url, table: &str, body: Value) -> Result<usize, SyncError> {
        let request = self
            .http
            .patch(url)
            .header("Prefer", "return=representation")
            .json(&body);
        let response = send(self.authorize(request), table).await?;
        let updated: Vec<Value> = read_json(response, table).await?;
        Ok(updated.len())
    }

    async fn insert(&self, table: &str, body: Value) -> Result<(), SyncError> {
        let request = self
            .http
            .post(self.config.rest_url(table))
            .header("Prefer", "return=minimal")
            .json(&body);
        send(self.authorize(request), table).await?;
        Ok(())
    }
}

#[async_trait]
impl Tables for RestTables {
    async fn user_chats(&self, user_id: &str) -> Result<Versioned<UserChatsRow>, SyncError> {
        let body: Value = self.select_one("userchats", "id", user_id).await?;
        let snapshot = body.get("chats").cloned().unwrap_or(Value::Null);
        Ok(Versioned {
            row: decode_row("userchats", body)?,
            revision: Revision::Snapshot(snapshot),
        })
    }

    async fn update_user_chats(
        &self,
        row: &UserChatsRow,
        expected: Option<&Revision>,
    ) -> Result<(), SyncError> {
        debug!(
            row_id = %row.id,
            chat_count = row.chats.len(),
            conditional = expected.is_some(),
            "writing userchats row"
        );
        let body = json!({ "chats": row.chats });
        let Some(expected) = expected else {
            return self.patch("userchats", &row.id, body).await;
        };
        let Revision::Snapshot(snapshot) = expected else {
            return Err(SyncError::new(
                SyncErrorCategory::Internal,
                "revision_kind",
                "REST tables only accept snapshot revisions",
            ));
        };
        let url = conditional_chats_url(self.filtered("userchats", "id", &row.id), snapshot)?;
        let updated = self.patch_matching(url, "userchats", body).await?;
        conditional_outcome(&row.id, updated)
    }

    async fn insert_user_chats(&self, row: &UserChatsRow) -> Result<(), SyncError> {
        self.insert("userchats", json!(row)).await
    }

    async fn user(&self, user_id: &str) -> Result<UserRow, SyncError> {
        self.select_one("users", "id", user_id).await
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<UserRow>, SyncError> {
        let mut rows: Vec<UserRow> = self.select_many("users", "username", username).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    async fn insert_user(&self, row: &UserRow) -> Result<(), SyncError> {
        self.insert("users", json!(row)).await
    }

    async fn update_blocked(&self, user_id: &str, blocked: &[String]) -> Result<(), SyncError> {
        self.patch("users", user_id, json!({ "blocked": blocked }))
            .await
    }

    async fn upload_object(
        &self,
        bucket: &str,
        name: &str,
        media: &MediaUpload,
    ) -> Result<String, SyncError> {
        let request = self
            .http
            .post(self.config.object_url(bucket, name))
            .header(header::CONTENT_TYPE, &media.content_type)
            .header(header::CACHE_CONTROL, "max-age=3600")
            .header("x-upsert", "true")
            .body(media.bytes.clone());
        send(self.authorize(request), "storage").await?;
        let url = self.config.public_object_url(bucket, name);
        debug!(%bucket, %name, bytes = media.bytes.len(), "media uploaded");
        Ok(url.to_string())
    }
}

/// Narrow `url` to rows whose `chats` column still equals `snapshot`.
fn conditional_chats_url(mut url: Url, snapshot: &Value) -> Result<Url, SyncError> {
    let filter = match snapshot {
        Value::Null => "is.null".to_owned(),
        value => {
            let encoded = serde_json::to_string(value).map_err(|err| {
                SyncError::new(
                    SyncErrorCategory::Serialization,
                    "revision_encode",
                    format!("userchats snapshot could not be encoded: {err}"),
                )
            })?;
            format!("eq.{encoded}")
        }
    };
    url.query_pairs_mut().append_pair("chats", &filter);
    Ok(url)
}

/// A conditional write that matched no row lost a race with another writer.
fn conditional_outcome(row_id: &str, updated: usize) -> Result<(), SyncError> {
    if updated == 0 {
        return Err(SyncError::conflict(format!(
            "userchats row {row_id} changed since it was read"
        )));
    }
    Ok(())
}

pub(crate) fn build_http_client(config: &HostedConfig) -> Result<reqwest::Client, SyncError> {
    reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Config,
                "http_client",
                format!("failed to build HTTP client: {err}"),
            )
        })
}

/// Send a request and map transport failures and error statuses.
pub(crate) async fn send(request: RequestBuilder, label: &str) -> Result<Response, SyncError> {
    let response = request
        .send()
        .await
        .map_err(|err| map_reqwest_error(err, label))?;
    let status = response.status();
    trace!(%label, status = status.as_u16(), "hosted response");
    if status.is_success() {
        return Ok(response);
    }
    Err(map_error_response(response, label).await)
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    response: Response,
    label: &str,
) -> Result<T, SyncError> {
    response.json::<T>().await.map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Serialization,
            "malformed_response",
            format!("{label}: {err}"),
        )
    })
}

pub(crate) fn map_reqwest_error(err: reqwest::Error, label: &str) -> SyncError {
    if err.is_timeout() {
        SyncError::network("timeout", format!("{label}: {err}"))
    } else if err.is_connect() {
        SyncError::network("unreachable", format!("{label}: {err}"))
    } else if err.is_decode() {
        SyncError::new(
            SyncErrorCategory::Serialization,
            "malformed_response",
            format!("{label}: {err}"),
        )
    } else {
        SyncError::network("transport", format!("{label}: {err}"))
    }
}

async fn map_error_response(response: Response, label: &str) -> SyncError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    let error = status_error(status, label, &body);
    match retry_after {
        Some(seconds) => error.with_retry_after(std::time::Duration::from_secs(seconds)),
        None => error,
    }
}

/// Build a `SyncError` from an HTTP error status and its body.
pub(crate) fn status_error(status: StatusCode, label: &str, body: &str) -> SyncError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|key| value.get(key).and_then(Value::as_str))
        })
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{label} returned {status}"));
    let category = classify_http_status(status.as_u16());
    let code = match category {
        SyncErrorCategory::NotFound => format!("{label}_not_found"),
        SyncErrorCategory::Auth => "unauthorized".to_owned(),
        SyncErrorCategory::Forbidden => "forbidden".to_owned(),
        SyncErrorCategory::Conflict => "conflict".to_owned(),
        SyncErrorCategory::Network if status == StatusCode::TOO_MANY_REQUESTS => {
            "rate_limited".to_owned()
        }
        SyncErrorCategory::Network => "unavailable".to_owned(),
        _ => format!("http_{}", status.as_u16()),
    };
    SyncError::new(category, code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_use_body_message_and_category() {
        let err = status_error(
            StatusCode::NOT_ACCEPTABLE,
            "userchats",
            r#"{"code":"PGRST116","message":"JSON object requested, multiple (or no) rows returned"}"#,
        );
        assert_eq!(err.category, SyncErrorCategory::NotFound);
        assert_eq!(err.code, "userchats_not_found");
        assert!(err.message.starts_with("JSON object requested"));

        let err = status_error(StatusCode::TOO_MANY_REQUESTS, "storage", "");
        assert_eq!(err.category, SyncErrorCategory::Network);
        assert_eq!(err.code, "rate_limited");
        assert_eq!(err.message, "storage returned 429 Too Many Requests");

        let err = status_error(StatusCode::BAD_REQUEST, "auth", r#"{"msg":"bad"}"#);
        assert_eq!(err.category, SyncErrorCategory::Config);
        assert_eq!(err.code, "http_400");
        assert_eq!(err.message, "bad");
    }

    #[test]
    fn filters_use_equality_operator() {
        let config = HostedConfig::new("https://demo.example.co", "anon").expect("config");
        let tables = RestTables::new(config, AccessToken::default()).expect("client");
        let url = tables.filtered("users", "username", "bob smith");
        assert_eq!(
            url.as_str(),
            "https://demo.example.co/rest/v1/users?username=eq.bob+smith&select=*"
        );
    }

    #[test]
    fn conditional_writes_filter_on_the_read_snapshot() {
        let config = HostedConfig::new("https://demo.example.co", "anon").expect("config");
        let tables = RestTables::new(config, AccessToken::default()).expect("client");
        let base = tables.filtered("userchats", "id", "u1");

        let url = conditional_chats_url(base.clone(), &json!([{ "chatId": "c1" }]))
            .expect("conditional url");
        let chats = url
            .query_pairs()
            .find(|(key, _)| key == "chats")
            .map(|(_, value)| value.into_owned());
        assert_eq!(chats.as_deref(), Some(r#"eq.[{"chatId":"c1"}]"#));
        assert!(url.query_pairs().any(|(key, value)| key == "id" && value == "eq.u1"));

        let url = conditional_chats_url(base, &Value::Null).expect("conditional url");
        assert!(url.query_pairs().any(|(key, value)| key == "chats" && value == "is.null"));
    }

    #[test]
    fn conditional_write_matching_nothing_is_a_conflict() {
        let err = conditional_outcome("u1", 0).expect_err("lost race");
        assert_eq!(err.category, SyncErrorCategory::Conflict);
        assert!(err.message.contains("u1"));
        conditional_outcome("u1", 1).expect("applied");
    }

    #[test]
    fn access_token_is_shared() {
        let token = AccessToken::default();
        let clone = token.clone();
        token.set(Some("abc".into()));
        assert_eq!(clone.get().as_deref(), Some("abc"));
        clone.set(None);
        assert_eq!(token.get(), None);
    }
}
