//! Wire contract for the Rocket.Chat REST API.
//!
//! [`ChatApi`] is the seam the export engine is written against; [`RocketApi`]
//! is the blocking HTTP implementation. Response types keep every unknown
//! field through a flattened map so archived pages stay byte-faithful to what
//! the server returned.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Errors reported by the API layer.
///
/// Only rate-limit errors below the wait ceiling are ever retried, and those
/// never surface here; everything in this enum is fatal to the run.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("error response from API endpoint: {0}")]
    Api(String),
    #[error("cannot parse wait time from too-many-requests error: {0}")]
    UnparseableRateLimit(String),
    #[error("unreasonable amount of time to wait for API rate limit: {0}s")]
    ExcessiveRateLimitWait(u64),
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// The three room listings the exporter walks. The serialized tags double as
/// the listing key in the API response and the `room_type` tag in checkpoint
/// state and day record filenames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoomType {
    #[serde(rename = "channels")]
    Channels,
    #[serde(rename = "ims")]
    DirectMessages,
    #[serde(rename = "groups")]
    Groups,
}

impl RoomType {
    pub const ALL: [RoomType; 3] = [
        RoomType::Channels,
        RoomType::DirectMessages,
        RoomType::Groups,
    ];

    /// Tag used in state files, output filenames and listing responses.
    pub fn tag(self) -> &'static str {
        match self {
            RoomType::Channels => "channels",
            RoomType::DirectMessages => "ims",
            RoomType::Groups => "groups",
        }
    }

    fn list_endpoint(self) -> &'static str {
        match self {
            RoomType::Channels => "channels.list.joined",
            RoomType::DirectMessages => "im.list",
            RoomType::Groups => "groups.list",
        }
    }

    fn history_endpoint(self) -> &'static str {
        match self {
            RoomType::Channels => "channels.history",
            RoomType::DirectMessages => "im.history",
            RoomType::Groups => "groups.history",
        }
    }
}

impl std::fmt::Display for RoomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// One entry of a room listing (`channels.list.joined`, `im.list`,
/// `groups.list`). Direct-message rooms frequently have no `name`; rooms with
/// no messages yet have no `lm`.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomListing {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: Option<String>,
    /// Room creation timestamp.
    pub ts: DateTime<Utc>,
    /// Timestamp of the latest message, if any.
    pub lm: Option<DateTime<Utc>>,
}

/// A room listing response. The payload key differs per room type
/// (`channels` / `ims` / `groups`), hence the aliases.
#[derive(Debug, Deserialize)]
pub struct RoomListPage {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "channels", alias = "ims", alias = "groups")]
    pub rooms: Vec<RoomListing>,
}

/// Message author, `u` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One reaction entry, keyed by emoji shortcode on the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    #[serde(default)]
    pub usernames: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

/// A file attached to a message. Only attachments carrying a `title_link`
/// reference downloadable content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_link: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single message as returned by the history and thread endpoints.
///
/// `ts` is kept as the raw wire string because it participates verbatim in
/// attachment filenames. `tlm` (thread-last-message) marks a thread root;
/// `thread_requests` is filled in by the thread expander before the owning
/// day record is written, and never comes from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    pub ts: String,
    #[serde(default, rename = "u", skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default, rename = "msg", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<BTreeMap<String, Reaction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlm: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thread_requests: Vec<MessagePage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One raw page from a history or thread endpoint, archived as-is inside a
/// day record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// In-band success/error view shared by all paged responses, consumed by the
/// retry wrapper in `rate_limit`.
pub trait ApiResponse {
    fn is_success(&self) -> bool;
    fn error_text(&self) -> &str;
}

impl ApiResponse for MessagePage {
    fn is_success(&self) -> bool {
        self.success
    }
    fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

impl ApiResponse for RoomListPage {
    fn is_success(&self) -> bool {
        self.success
    }
    fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

/// Render a timestamp the way the history endpoints expect it:
/// RFC 3339 truncated to milliseconds.
pub fn wire_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// How to authenticate against the server.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Username (or email) plus password; exchanged for a session token at
    /// connect time via `api/v1/login`.
    Password { user: String, password: String },
    /// Personal access token, used directly as `X-User-Id` / `X-Auth-Token`.
    Token { user_id: String, token: String },
}

/// Abstract API surface the export engine drives. Implemented by
/// [`RocketApi`] for real runs and by a scripted mock in tests.
pub trait ChatApi {
    fn list_rooms(&self, room_type: RoomType) -> Result<RoomListPage, ApiError>;

    #[allow(clippy::too_many_arguments)]
    fn room_history(
        &self,
        room_id: &str,
        room_type: RoomType,
        count: u32,
        offset: u32,
        oldest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Result<MessagePage, ApiError>;

    fn thread_messages(
        &self,
        thread_id: &str,
        last_message: &str,
        count: u32,
        offset: u32,
    ) -> Result<MessagePage, ApiError>;

    fn download(&self, link: &str) -> Result<Vec<u8>, ApiError>;
}

/// Blocking Rocket.Chat REST client.
pub struct RocketApi {
    http: Client,
    /// Server root without a trailing slash.
    base: String,
}

#[derive(Deserialize)]
struct LoginData {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "authToken")]
    auth_token: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    status: String,
    data: Option<LoginData>,
}

impl RocketApi {
    /// Build a client for `server`, logging in first when password
    /// credentials are supplied.
    pub fn connect(server: &Url, credentials: &Credentials) -> Result<Self, ApiError> {
        let base = server.as_str().trim_end_matches('/').to_string();

        let (user_id, token) = match credentials {
            Credentials::Token { user_id, token } => (user_id.clone(), token.clone()),
            Credentials::Password { user, password } => {
                let login: LoginResponse = Client::new()
                    .post(format!("{base}/api/v1/login"))
                    .json(&serde_json::json!({ "user": user, "password": password }))
                    .send()?
                    .json()?;
                if login.status != "success" {
                    return Err(ApiError::Auth(format!(
                        "login rejected with status {:?}",
                        login.status
                    )));
                }
                let data = login
                    .data
                    .ok_or_else(|| ApiError::Auth("login response carried no data".into()))?;
                (data.user_id, data.auth_token)
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-User-Id",
            HeaderValue::from_str(&user_id)
                .map_err(|e| ApiError::Auth(format!("invalid user id header value: {e}")))?,
        );
        headers.insert(
            "X-Auth-Token",
            HeaderValue::from_str(&token)
                .map_err(|e| ApiError::Auth(format!("invalid auth token header value: {e}")))?,
        );

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self { http, base })
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = format!("{}/api/v1/{}", self.base, endpoint);
        debug!(%url, "GET");
        // Non-2xx responses still carry a JSON body with `success: false` and
        // an `error` field; status alone decides nothing here.
        let response = self.http.get(url).query(query).send()?;
        Ok(response.json()?)
    }
}

impl ChatApi for RocketApi {
    fn list_rooms(&self, room_type: RoomType) -> Result<RoomListPage, ApiError> {
        self.get(room_type.list_endpoint(), &[])
    }

    fn room_history(
        &self,
        room_id: &str,
        room_type: RoomType,
        count: u32,
        offset: u32,
        oldest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Result<MessagePage, ApiError> {
        self.get(
            room_type.history_endpoint(),
            &[
                ("roomId", room_id.to_string()),
                ("count", count.to_string()),
                ("offset", offset.to_string()),
                ("inclusive", "true".to_string()),
                ("oldest", wire_timestamp(oldest)),
                ("latest", wire_timestamp(latest)),
            ],
        )
    }

    fn thread_messages(
        &self,
        thread_id: &str,
        last_message: &str,
        count: u32,
        offset: u32,
    ) -> Result<MessagePage, ApiError> {
        self.get(
            "chat.getThreadMessages",
            &[
                ("tmid", thread_id.to_string()),
                ("tlm", last_message.to_string()),
                ("count", count.to_string()),
                ("offset", offset.to_string()),
            ],
        )
    }

    fn download(&self, link: &str) -> Result<Vec<u8>, ApiError> {
        let url = format!("{}{}", self.base, link);
        debug!(%url, "download");
        let response = self.http.get(url).send()?.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn wire_timestamp_truncates_to_milliseconds() {
        let ts = Utc
            .with_ymd_and_hms(2023, 4, 22, 23, 59, 59)
            .unwrap()
            .with_nanosecond(999_999_000)
            .unwrap();
        assert_eq!(wire_timestamp(ts), "2023-04-22T23:59:59.999Z");
    }

    #[test]
    fn wire_timestamp_keeps_midnight_zeroes() {
        let ts = Utc.with_ymd_and_hms(2023, 4, 22, 0, 0, 0).unwrap();
        assert_eq!(wire_timestamp(ts), "2023-04-22T00:00:00.000Z");
    }

    #[test]
    fn message_roundtrip_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "_id": "abc",
            "ts": "2023-04-22T10:00:00.000Z",
            "u": { "username": "ben", "name": "Ben" },
            "msg": "hello",
            "tshow": true,
            "editedAt": "2023-04-22T11:00:00.000Z"
        });
        let message: Message = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(message.body.as_deref(), Some("hello"));
        assert!(message.extra.contains_key("editedAt"));

        let back = serde_json::to_value(&message).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn list_page_accepts_any_listing_key() {
        for key in ["channels", "ims", "groups"] {
            let raw = format!(
                r#"{{ "success": true, "{key}": [
                    {{ "_id": "r1", "name": "general", "ts": "2020-01-01T09:30:00.000Z" }}
                ] }}"#
            );
            let page: RoomListPage = serde_json::from_str(&raw).unwrap();
            assert!(page.success);
            assert_eq!(page.rooms.len(), 1, "key {key}");
            assert_eq!(page.rooms[0].id, "r1");
            assert!(page.rooms[0].lm.is_none());
        }
    }
}
