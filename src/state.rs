//! Per-room checkpoint state and its schema-versioned persistence.
//!
//! The state file is a single flat JSON object: one entry per room id plus a
//! `_meta` record holding the schema version. It is loaded once at the start
//! of a run, mutated in memory, and rewritten as one unit at the very end
//! (never incrementally), so a run that dies mid-way leaves the previous
//! checkpoints untouched.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveTime, Utc};
use eyre::{Context, Result, bail, eyre};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::api::{RoomListing, RoomType};

/// Schema version written by this build.
pub const SCHEMA_VERSION: &str = "1.1";

/// Synchronization state for one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    /// Room creation date truncated to UTC midnight. No message in this room
    /// can predate it.
    pub begin_time: DateTime<Utc>,
    /// Latest known message timestamp, refreshed from the listing every run.
    /// `None` means the room has never had a message.
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    /// Furthest point this room has been scanned through, whether or not any
    /// data was found there. Monotonically non-decreasing across runs.
    #[serde(default)]
    pub last_checked_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub schema_version: String,
}

/// The whole persisted checkpoint map.
#[derive(Debug, Serialize, Deserialize)]
pub struct GlobalState {
    #[serde(rename = "_meta")]
    pub meta: Meta,
    #[serde(flatten)]
    pub rooms: BTreeMap<String, RoomState>,
}

impl GlobalState {
    pub fn fresh() -> Self {
        Self {
            meta: Meta {
                schema_version: SCHEMA_VERSION.to_string(),
            },
            rooms: BTreeMap::new(),
        }
    }

    /// Merge one room listing into the state. Rooms seen for the first time
    /// get a fresh entry; rooms already tracked keep their checkpoints and
    /// only have `last_message_time` refreshed.
    pub fn absorb_listing(&mut self, room_type: RoomType, rooms: &[RoomListing]) {
        for room in rooms {
            let entry = self.rooms.entry(room.id.clone()).or_insert_with(|| {
                let name = room
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("direct-{}", room.id));
                debug!(room = %name, %room_type, "tracking new room");
                RoomState {
                    name,
                    room_type,
                    begin_time: midnight(room.ts),
                    last_message_time: None,
                    last_checked_time: None,
                }
            });
            entry.last_message_time = room.lm;
        }
    }
}

/// Truncate a timestamp to UTC midnight.
pub fn midnight(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Loads and saves [`GlobalState`] at a fixed path.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the state file, applying schema migrations as needed. An absent
    /// file yields a fresh state at the current version.
    pub fn load(&self) -> Result<GlobalState> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no state file; starting fresh");
            return Ok(GlobalState::fresh());
        }
        let bytes = fs::read(&self.path)
            .wrap_err_with(|| format!("failed to read state file: {}", self.path.display()))?;
        let value: Value = serde_json::from_slice(&bytes)
            .wrap_err_with(|| format!("failed to parse state file: {}", self.path.display()))?;
        let value = migrate(value)?;
        serde_json::from_value(value)
            .wrap_err_with(|| format!("state file has unexpected shape: {}", self.path.display()))
    }

    /// Rewrite the whole state atomically: serialize into a temporary file in
    /// the same directory, then rename over the target.
    pub fn save(&self, state: &GlobalState) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create state directory: {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .wrap_err("failed to create temporary state file")?;
        serde_json::to_writer_pretty(&mut tmp, state).wrap_err("failed to serialize state")?;
        tmp.flush().wrap_err("failed to flush state")?;
        tmp.persist(&self.path)
            .wrap_err_with(|| format!("failed to persist state file: {}", self.path.display()))?;
        debug!(path = %self.path.display(), rooms = state.rooms.len(), "state saved");
        Ok(())
    }
}

struct Migration {
    from: &'static str,
    to: &'static str,
    apply: fn(&mut Value) -> Result<()>,
}

/// Ordered schema migration steps. Each step is total over all rooms and the
/// loop in [`migrate`] applies them strictly forward until the current
/// version is reached.
const MIGRATIONS: &[Migration] = &[Migration {
    from: "1.0",
    to: "1.1",
    apply: migrate_room_type_tags,
}];

fn stored_version(value: &Value) -> String {
    match value.get("_meta").and_then(|m| m.get("schema_version")) {
        // A state file predating the `_meta` record is version 1.0.
        None => "1.0".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

fn migrate(mut value: Value) -> Result<Value> {
    let mut version = stored_version(&value);
    while version != SCHEMA_VERSION {
        let step = MIGRATIONS.iter().find(|m| m.from == version).ok_or_else(|| {
            eyre!(
                "state schema version {version} is not supported by this build (current is {SCHEMA_VERSION})"
            )
        })?;
        info!(from = step.from, to = step.to, "upgrading state schema");
        (step.apply)(&mut value)?;
        value["_meta"] = json!({ "schema_version": step.to });
        version = step.to.to_string();
    }
    Ok(value)
}

/// 1.0 → 1.1: room-type tags gained their listing-key spelling.
fn migrate_room_type_tags(value: &mut Value) -> Result<()> {
    let Some(rooms) = value.as_object_mut() else {
        bail!("state root is not an object");
    };
    for (id, room) in rooms.iter_mut().filter(|(id, _)| id.as_str() != "_meta") {
        let Some(tag) = room.get("type").and_then(Value::as_str) else {
            bail!("room {id} has no type tag");
        };
        let renamed = match tag {
            "direct" => "ims",
            "channel" => "channels",
            other => bail!("room {id} has unknown type tag {other:?}"),
        };
        room["type"] = Value::String(renamed.to_string());
    }
    Ok(())
}
