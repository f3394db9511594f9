//! Thread-reply expansion.
//!
//! A message carrying a `tlm` marker is a thread root. Its replies are paged
//! through `chat.getThreadMessages` with the same terminal condition as the
//! day loop (an empty page), and the fetched pages are attached to the parent
//! message before the owning day record is finalized. Attachments on replies
//! land in the parent day's attachment directory, not under their own date.

use eyre::Result;
use tracing::info;

use crate::api::ChatApi;
use crate::day::DayRecord;
use crate::rate_limit::with_retry;
use crate::run::Exporter;

impl<'a, A: ChatApi> Exporter<'a, A> {
    /// Fetch all reply pages of `parent`'s thread and attach them in place.
    /// A message without a thread marker is left untouched.
    pub fn expand_thread(
        &mut self,
        record: &DayRecord,
        parent: &mut crate::api::Message,
    ) -> Result<()> {
        let Some(tlm) = parent.tlm.clone() else {
            return Ok(());
        };
        info!(thread = %parent.id, last_message = %tlm, "expanding thread");

        let parent_id = parent.id.clone();
        let mut pages = Vec::new();
        let mut offset: u32 = 0;
        loop {
            let api = self.api;
            let page_size = self.page_size;
            let page = with_retry(&mut self.pacing, || {
                api.thread_messages(&parent_id, &tlm, page_size, offset)
            })?;

            let count = page.messages.len();
            info!(messages = count, offset, "thread messages found");
            if count == 0 {
                break;
            }

            for message in &page.messages {
                if !message.attachments.is_empty() {
                    self.fetch_attachments(record, message)?;
                }
            }

            pages.push(page);
            offset += count as u32;
            self.pacing.rest();
        }

        parent.thread_requests = pages;
        Ok(())
    }
}
