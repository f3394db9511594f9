//! Attachment download into a day-scoped directory.

use std::fs;

use eyre::{Context, Result};
use tracing::debug;

use crate::api::{Attachment, ChatApi, Message};
use crate::day::DayRecord;
use crate::run::Exporter;

/// `<message_ts>_<attachment_title>`. Two attachments on one message sharing
/// a title collide, and the later download overwrites the earlier; a known
/// limitation carried over from the wire format, which offers nothing more
/// unique than the title.
pub fn attachment_name(message: &Message, attachment: &Attachment) -> String {
    format!("{}_{}", message.ts, attachment.title)
}

impl<'a, A: ChatApi> Exporter<'a, A> {
    /// Download every linked attachment of `message` into the record's
    /// attachment directory. Attachments without a download link are skipped.
    pub fn fetch_attachments(&self, record: &DayRecord, message: &Message) -> Result<()> {
        for attachment in &message.attachments {
            let Some(link) = &attachment.title_link else {
                continue;
            };
            debug!(title = %attachment.title, link, "downloading attachment");
            let bytes = self.api.download(link)?;

            let dir = self.output_dir.join(record.attachments_dir_name());
            // Lazily created; already existing is fine.
            fs::create_dir_all(&dir).wrap_err_with(|| {
                format!("failed to create attachment directory: {}", dir.display())
            })?;

            let path = dir.join(attachment_name(message, attachment));
            fs::write(&path, &bytes)
                .wrap_err_with(|| format!("failed to write attachment: {}", path.display()))?;
        }
        Ok(())
    }
}
