//! # rocket-chat-export
//!
//! A CLI tool that incrementally exports [Rocket.Chat](https://rocket.chat)
//! room history to local day-bucketed JSON archives.
//!
//! ## What it does
//!
//! For every room the configured account belongs to (public channels, direct
//! messages, private groups), the tool pages the REST history endpoints one
//! calendar day at a time and writes each non-empty day as a raw JSON record
//! (`<date>-<room_type>-<room_name>.json`), downloading referenced file
//! attachments alongside it and expanding thread replies into their root
//! message before the record is written.
//!
//! ## Incremental export
//!
//! A checkpoint state file remembers, per room, the furthest point already
//! scanned. Repeated runs resume one tick past that point, so dormant rooms
//! cost nothing and only newly produced messages are fetched. The state file
//! carries a schema version and is migrated forward automatically.
//!
//! ## Rate limiting
//!
//! The server's `error-too-many-requests` responses are honored: the
//! mandated wait is slept out and the request retried, and a politeness
//! pause is inserted between all successive API calls for the length of the
//! run. Waits of five minutes or more abort the run instead.
//!
//! ## Usage
//!
//! ```sh
//! # Export everything new since the last run
//! rocket-chat-export ~/archives/rocket-chat
//!
//! # Bounded backfill, leaving the checkpoint file untouched
//! rocket-chat-export -s 2020-01-01 -e 2021-01-01 -r ~/archives/backfill
//! ```
//!
//! Server address and credentials live in
//! `~/.config/rocket-chat-export/config.toml`.
