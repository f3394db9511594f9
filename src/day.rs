//! Day-windowed history fetching and day record assembly.
//!
//! One calendar day of one room is paged through the history endpoint with
//! inclusive bounds and an increasing offset until a page comes back empty.
//! Every non-empty page is archived raw; the record is only written to disk
//! when the day produced at least one message.

use std::fs::File;
use std::io::{BufWriter, Write};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::{ChatApi, MessagePage, RoomType, wire_timestamp};
use crate::rate_limit::with_retry;
use crate::run::Exporter;
use crate::state::RoomState;

/// The durable unit of export: every raw history page (plus nested thread
/// pages) for one room on one calendar day, oldest page first.
#[derive(Debug, Serialize, Deserialize)]
pub struct DayRecord {
    pub channel_name: String,
    pub channel_type: RoomType,
    pub date: NaiveDate,
    pub requests: Vec<MessagePage>,
}

impl DayRecord {
    fn open(room: &RoomState, date: NaiveDate) -> Self {
        Self {
            channel_name: room.name.clone(),
            channel_type: room.room_type,
            date,
            requests: Vec::new(),
        }
    }

    /// `<date>-<room_type>-<room_name>`, shared by the record file and its
    /// attachment directory.
    pub fn output_stem(&self) -> String {
        format!("{}-{}-{}", self.date, self.channel_type, self.channel_name)
    }

    pub fn attachments_dir_name(&self) -> String {
        format!("{}_attachments", self.output_stem())
    }
}

/// Inclusive bounds of one calendar day:
/// `[D 00:00:00.000000, D 23:59:59.999999]` UTC.
pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let oldest = day.and_time(NaiveTime::MIN).and_utc();
    let latest = day.and_hms_micro_opt(23, 59, 59, 999_999).unwrap().and_utc();
    (oldest, latest)
}

impl<'a, A: ChatApi> Exporter<'a, A> {
    /// Fetch one day of one room. Returns whether a day record was written.
    pub fn fetch_day(&mut self, room_id: &str, room: &RoomState, day: NaiveDate) -> Result<bool> {
        let (oldest, latest) = day_bounds(day);
        info!(start = %wire_timestamp(oldest), "fetching day");

        let mut record = DayRecord::open(room, day);
        let mut offset: u32 = 0;
        loop {
            let api = self.api;
            let page_size = self.page_size;
            let mut page = with_retry(&mut self.pacing, || {
                api.room_history(room_id, room.room_type, page_size, offset, oldest, latest)
            })?;

            let count = page.messages.len();
            info!(messages = count, offset, "messages found");
            if count == 0 {
                // Terminal condition for the day.
                self.pacing.rest();
                break;
            }

            for message in &mut page.messages {
                if !message.attachments.is_empty() {
                    self.fetch_attachments(&record, message)?;
                }
                // Thread data must be attached before the record is final.
                if message.tlm.is_some() {
                    self.expand_thread(&record, message)?;
                }
            }

            record.requests.push(page);
            offset += count as u32;
            self.pacing.rest();
        }

        if record.requests.is_empty() {
            debug!(end = %wire_timestamp(latest), "day produced no messages");
            return Ok(false);
        }

        let path = self
            .output_dir
            .join(format!("{}.json", record.output_stem()));
        let file = File::create(&path)
            .wrap_err_with(|| format!("failed to create day record: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &record)
            .wrap_err_with(|| format!("failed to serialize day record: {}", path.display()))?;
        writer
            .flush()
            .wrap_err_with(|| format!("failed to flush day record: {}", path.display()))?;

        info!(path = %path.display(), "day record written");
        self.days_written += 1;
        Ok(true)
    }
}
