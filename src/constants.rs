pub const SESSION_COOKIE_ENV_NAME: &str = "ROSTERHARVEST_COOKIE";

pub const DEFAULT_DB_PATH: &str = "rosterharvest.db";

/// Portal responses are Latin-1; WHATWG maps this label onto windows-1252.
pub const DEFAULT_ENCODING_LABEL: &str = "iso-8859-1";

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Enrichment fetches in flight at once. Tuned against the live portal.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Pause between enrichment batches. Tuned against the live portal.
pub const DEFAULT_BATCH_DELAY_MS: u64 = 500;

pub const DEFAULT_PERIOD: &str = "2025/2";

/// Separator used when an enrichment yields more than one row for a column.
pub const MULTI_VALUE_SEPARATOR: &str = "; ";

pub const SCHEDULE_SEPARATOR: &str = " | ";

pub const UTF8_BOM: char = '\u{feff}';

pub(crate) const REFERENCE_KEY_PREFIX: &str = "reference.";

pub(crate) const SNAPSHOT_KEY_PREFIX: &str = "snapshot.";

pub(crate) const DEFAULT_CONFIG_JSON: &str = include_str!("../assets/portal.json");
