//! Run orchestration: room discovery, per-room fetch windows, the day loop,
//! and checkpoint finalization.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeDelta, Utc};
use eyre::{Context, Result};
use tracing::{debug, info};

use crate::api::{ChatApi, RocketApi, RoomType};
use crate::config::ExportConfig;
use crate::day::day_bounds;
use crate::rate_limit::{Pacing, with_retry};
use crate::state::{CheckpointStore, GlobalState, RoomState};

/// Mutable context threaded through every fetch: the API handle, the run's
/// pacing value, and the output location. One per run.
pub struct Exporter<'a, A: ChatApi> {
    pub(crate) api: &'a A,
    pub(crate) pacing: Pacing,
    pub(crate) output_dir: PathBuf,
    pub(crate) page_size: u32,
    pub(crate) days_written: usize,
}

/// The entry point for a full export run.
pub fn execute(config: &ExportConfig) -> Result<()> {
    let api = RocketApi::connect(&config.server, &config.credentials)
        .wrap_err_with(|| format!("failed to connect to {}", config.server))?;
    run_internal(&api, config)
}

pub(crate) fn run_internal<A: ChatApi>(api: &A, config: &ExportConfig) -> Result<()> {
    fs::create_dir_all(&config.output_dir).wrap_err_with(|| {
        format!(
            "failed to create output directory: {}",
            config.output_dir.display()
        )
    })?;

    let store = CheckpointStore::new(&config.state_file);
    let mut state = store.load()?;

    if config.read_only_state {
        info!("running in read-only state mode; no state file updates");
    }

    let mut exporter = Exporter {
        api,
        pacing: Pacing::new(Duration::from_secs(config.pause_seconds)),
        output_dir: config.output_dir.clone(),
        page_size: config.page_size,
        days_written: 0,
    };
    exporter.pacing.rest();

    exporter.discover_rooms(&mut state)?;

    let end_time = end_of_window(config.date_end);
    let global_start = config
        .date_start
        .map(|d| d.and_time(NaiveTime::MIN).and_utc());
    debug!(start = ?global_start, end = %end_time, "global window");

    let room_ids: Vec<String> = state.rooms.keys().cloned().collect();
    for room_id in &room_ids {
        exporter.process_room(&mut state, room_id, global_start, end_time)?;
    }

    info!(
        rooms = room_ids.len(),
        days_written = exporter.days_written,
        "export run finished"
    );

    if !config.read_only_state {
        store.save(&state)?;
    }
    Ok(())
}

/// Global end of the fetch window: the explicit override, else yesterday at
/// its last tick. "Yesterday" is reckoned in UTC, the same clock the day
/// windows and checkpoints use, so it may differ from the operator's local
/// calendar day.
fn end_of_window(date_end: Option<chrono::NaiveDate>) -> DateTime<Utc> {
    let day = date_end.unwrap_or_else(|| Utc::now().date_naive() - Days::new(1));
    day_bounds(day).1
}

/// Where to start fetching a room, by precedence: an explicit global start
/// (clamped forward to the room's creation), else one tick past the furthest
/// point already scanned, else the room's creation.
pub(crate) fn window_start(
    room: &RoomState,
    global_start: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    if let Some(start) = global_start {
        room.begin_time.max(start)
    } else if let Some(checked) = room.last_checked_time {
        checked + TimeDelta::microseconds(1)
    } else {
        room.begin_time
    }
}

impl<'a, A: ChatApi> Exporter<'a, A> {
    /// Walk the three room-type listings and merge them into the state.
    fn discover_rooms(&mut self, state: &mut GlobalState) -> Result<()> {
        for room_type in RoomType::ALL {
            let api = self.api;
            let page = with_retry(&mut self.pacing, || api.list_rooms(room_type))?;
            debug!(%room_type, rooms = page.rooms.len(), "listing fetched");
            state.absorb_listing(room_type, &page.rooms);
            self.pacing.rest();
        }
        info!(rooms = state.rooms.len(), "room state assembled");
        Ok(())
    }

    fn process_room(
        &mut self,
        state: &mut GlobalState,
        room_id: &str,
        global_start: Option<DateTime<Utc>>,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        let Some(room) = state.rooms.get(room_id).cloned() else {
            return Ok(());
        };
        info!(room = room_id, name = %room.name, kind = %room.room_type, "processing room");
        debug!(
            begin = %room.begin_time,
            last_message = ?room.last_message_time,
            last_checked = ?room.last_checked_time,
        );

        let start = window_start(&room, global_start);
        let mut cursor = start;
        // The second condition short-circuits days known to be empty: the
        // room simply has no messages past that point.
        if cursor < end_time && room.last_message_time.is_some_and(|lm| cursor < lm) {
            info!(since = %start, through = %end_time, "grabbing messages");
        } else {
            info!(since = %start, through = %end_time, "nothing to grab");
        }

        while cursor < end_time && room.last_message_time.is_some_and(|lm| cursor < lm) {
            self.fetch_day(room_id, &room, cursor.date_naive())?;
            cursor += TimeDelta::days(1);
        }

        // "Furthest point scanned", not "furthest point with data": dormant
        // rooms must not be rescanned from scratch on the next run. A bounded
        // backfill with a past end date must not pull the checkpoint backward.
        if let Some(entry) = state.rooms.get_mut(room_id) {
            entry.last_checked_time = Some(match entry.last_checked_time {
                Some(checked) => checked.max(end_time),
                None => end_time,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use super::*;

    pub fn exporter<'a, A: ChatApi>(api: &'a A, output_dir: &Path) -> Exporter<'a, A> {
        Exporter {
            api,
            pacing: Pacing::new(Duration::ZERO),
            output_dir: output_dir.to_path_buf(),
            page_size: 100,
            days_written: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Credentials;
    use crate::api::testing::{MockApi, failure_page, listing, message, page};
    use std::path::Path;

    fn config(dir: &Path, date_end: &str, read_only: bool) -> ExportConfig {
        ExportConfig {
            server: "http://localhost:3000".parse().unwrap(),
            credentials: Credentials::Token {
                user_id: "u1".to_string(),
                token: "t1".to_string(),
            },
            output_dir: dir.join("history"),
            state_file: dir.join("state.json"),
            pause_seconds: 0,
            page_size: 100,
            date_start: None,
            date_end: Some(date_end.parse().unwrap()),
            read_only_state: read_only,
        }
    }

    fn tracked_room(checked: Option<&str>) -> RoomState {
        RoomState {
            name: "general".to_string(),
            room_type: RoomType::Channels,
            begin_time: "2020-01-01T00:00:00Z".parse().unwrap(),
            last_message_time: Some("2021-06-01T10:00:00Z".parse().unwrap()),
            last_checked_time: checked.map(|s| s.parse().unwrap()),
        }
    }

    #[test]
    fn window_start_resumes_one_tick_past_last_checked() {
        let room = tracked_room(Some("2021-06-01T00:00:00Z"));
        assert_eq!(
            window_start(&room, None),
            "2021-06-01T00:00:00.000001Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn window_start_clamps_explicit_start_to_room_creation() {
        let room = tracked_room(Some("2021-06-01T00:00:00Z"));
        // Explicit start predating the room fast-forwards to its creation.
        assert_eq!(
            window_start(&room, Some("2019-01-01T00:00:00Z".parse().unwrap())),
            room.begin_time
        );
        // Explicit start after creation wins, and beats the checkpoint.
        assert_eq!(
            window_start(&room, Some("2020-06-01T00:00:00Z".parse().unwrap())),
            "2020-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn window_start_falls_back_to_room_creation() {
        let room = tracked_room(None);
        assert_eq!(window_start(&room, None), room.begin_time);
    }

    #[test]
    fn full_run_writes_day_record_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockApi::default();
        api.listings.insert(
            "channels",
            vec![listing(
                "r1",
                Some("general"),
                "2023-04-22T08:00:00.000Z",
                Some("2023-04-22T10:00:00.000Z"),
            )],
        );
        api.history.borrow_mut().push_back(page(vec![
            message("m1", "2023-04-22T09:00:00.000Z"),
            message("m2", "2023-04-22T10:00:00.000Z"),
        ]));

        let config = config(dir.path(), "2023-04-23", false);
        run_internal(&api, &config).unwrap();

        assert!(
            config
                .output_dir
                .join("2023-04-22-channels-general.json")
                .exists()
        );

        let state = CheckpointStore::new(&config.state_file).load().unwrap();
        let room = &state.rooms["r1"];
        assert_eq!(
            room.last_checked_time,
            Some("2023-04-23T23:59:59.999999Z".parse().unwrap())
        );
        assert_eq!(
            room.last_message_time,
            Some("2023-04-22T10:00:00Z".parse().unwrap())
        );
        // 2023-04-22 had data; 2023-04-23 is past the last message, so only
        // one day was ever paged (two calls: data page + terminal page).
        assert_eq!(api.history_calls.borrow().len(), 2);
    }

    #[test]
    fn rerun_without_new_messages_only_advances_last_checked() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockApi::default();
        api.listings.insert(
            "channels",
            vec![listing(
                "r1",
                Some("general"),
                "2023-04-22T08:00:00.000Z",
                Some("2023-04-22T10:00:00.000Z"),
            )],
        );

        // Seed the checkpoint as a previous run through 2023-04-23 left it.
        let mut state = GlobalState::fresh();
        state
            .rooms
            .insert("r1".to_string(), RoomState {
                name: "general".to_string(),
                room_type: RoomType::Channels,
                begin_time: "2023-04-22T00:00:00Z".parse().unwrap(),
                last_message_time: Some("2023-04-22T10:00:00Z".parse().unwrap()),
                last_checked_time: Some("2023-04-23T23:59:59.999999Z".parse().unwrap()),
            });
        let config = config(dir.path(), "2023-04-25", false);
        CheckpointStore::new(&config.state_file).save(&state).unwrap();

        run_internal(&api, &config).unwrap();

        // No history call: the resume point is already past the last message.
        assert!(api.history_calls.borrow().is_empty());
        assert!(
            !config
                .output_dir
                .join("2023-04-24-channels-general.json")
                .exists()
        );

        let reloaded = CheckpointStore::new(&config.state_file).load().unwrap();
        let room = &reloaded.rooms["r1"];
        assert_eq!(
            room.last_checked_time,
            Some("2023-04-25T23:59:59.999999Z".parse().unwrap())
        );
        assert_eq!(
            room.last_message_time,
            Some("2023-04-22T10:00:00Z".parse().unwrap())
        );
    }

    #[test]
    fn fatal_api_error_leaves_the_state_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockApi::default();
        api.listings.insert(
            "channels",
            vec![listing(
                "r1",
                Some("general"),
                "2023-04-22T08:00:00.000Z",
                Some("2023-04-24T10:00:00.000Z"),
            )],
        );
        // The first history page of the run is a non-retryable failure.
        api.history
            .borrow_mut()
            .push_back(failure_page("error-not-allowed"));

        // Checkpoints as a previous run through 2023-04-22 left them.
        let mut state = GlobalState::fresh();
        state
            .rooms
            .insert("r1".to_string(), RoomState {
                name: "general".to_string(),
                room_type: RoomType::Channels,
                begin_time: "2023-04-22T00:00:00Z".parse().unwrap(),
                last_message_time: Some("2023-04-24T10:00:00Z".parse().unwrap()),
                last_checked_time: Some("2023-04-22T23:59:59.999999Z".parse().unwrap()),
            });
        let config = config(dir.path(), "2023-04-25", false);
        CheckpointStore::new(&config.state_file).save(&state).unwrap();

        assert!(run_internal(&api, &config).is_err());

        // The run died before the end-of-run save, so the previous run's
        // checkpoints are still on disk.
        let reloaded = CheckpointStore::new(&config.state_file).load().unwrap();
        assert_eq!(reloaded.rooms, state.rooms);
    }

    #[test]
    fn bounded_backfill_never_moves_the_checkpoint_backward() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockApi::default();
        api.listings.insert(
            "channels",
            vec![listing(
                "r1",
                Some("general"),
                "2023-04-22T08:00:00.000Z",
                Some("2023-04-22T10:00:00.000Z"),
            )],
        );

        let checked = "2023-04-25T23:59:59.999999Z";
        let mut state = GlobalState::fresh();
        state
            .rooms
            .insert("r1".to_string(), RoomState {
                name: "general".to_string(),
                room_type: RoomType::Channels,
                begin_time: "2023-04-22T00:00:00Z".parse().unwrap(),
                last_message_time: Some("2023-04-22T10:00:00Z".parse().unwrap()),
                last_checked_time: Some(checked.parse().unwrap()),
            });

        // Backfill a window that ends well before the existing checkpoint.
        let mut config = config(dir.path(), "2023-04-23", false);
        config.date_start = Some("2023-04-22".parse().unwrap());
        CheckpointStore::new(&config.state_file).save(&state).unwrap();

        run_internal(&api, &config).unwrap();

        let reloaded = CheckpointStore::new(&config.state_file).load().unwrap();
        assert_eq!(
            reloaded.rooms["r1"].last_checked_time,
            Some(checked.parse().unwrap())
        );
    }

    #[test]
    fn read_only_mode_skips_state_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockApi::default();
        api.listings.insert(
            "channels",
            vec![listing(
                "r1",
                Some("general"),
                "2023-04-22T08:00:00.000Z",
                None,
            )],
        );

        let config = config(dir.path(), "2023-04-23", true);
        run_internal(&api, &config).unwrap();
        assert!(!config.state_file.exists());
    }

    #[test]
    fn room_with_no_messages_is_never_paged() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockApi::default();
        api.listings.insert(
            "ims",
            vec![listing("dm1", None, "2023-04-22T08:00:00.000Z", None)],
        );

        let config = config(dir.path(), "2023-04-23", false);
        run_internal(&api, &config).unwrap();

        assert!(api.history_calls.borrow().is_empty());
        let state = CheckpointStore::new(&config.state_file).load().unwrap();
        assert_eq!(
            state.rooms["dm1"].last_checked_time,
            Some("2023-04-23T23:59:59.999999Z".parse().unwrap())
        );
    }
}
