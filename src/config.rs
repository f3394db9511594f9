use std::path::PathBuf;

use chrono::NaiveDate;
use url::Url;

use crate::api::Credentials;

pub const DEFAULT_PAUSE_SECONDS: u64 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Everything a run needs, resolved from CLI arguments and the config file.
/// This decouples the engine from how the options were supplied.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub server: Url,
    pub credentials: Credentials,
    /// Day records and attachment directories are written here.
    pub output_dir: PathBuf,
    pub state_file: PathBuf,
    /// Initial politeness pause between API calls.
    pub pause_seconds: u64,
    /// Maximum messages requested per history/thread page.
    pub page_size: u32,
    /// Global start override (implied T00:00:00.000000).
    pub date_start: Option<NaiveDate>,
    /// Global end override (implied T23:59:59.999999). Defaults to yesterday.
    pub date_end: Option<NaiveDate>,
    /// Do not create or update the checkpoint state file.
    pub read_only_state: bool,
}
