//! Database schema definitions

// === EVENT STORE ===

// Raw login log written by the SSO proxy. sequence_id is the only ordering we trust.
pub const CREATE_LOG_LOGINS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS log_logins (
    sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
    login_stamp BIGINT NOT NULL,          -- epoch millis
    user_id TEXT NOT NULL,
    idp_entity_id TEXT NOT NULL,
    idp_entity_name TEXT,
    sp_entity_id TEXT NOT NULL,
    sp_entity_name TEXT
)
"#;

// === AGGREGATE STORE ===

// One row per day x idp x sp
pub const CREATE_DAILY_COUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS daily_counts (
    key_hash TEXT PRIMARY KEY,            -- sha256(day!idp!sp)
    entry_day TEXT NOT NULL,              -- YYYY-MM-DD (UTC)
    idp_entity_id TEXT NOT NULL,
    idp_entity_name TEXT,
    sp_entity_id TEXT NOT NULL,
    sp_entity_name TEXT,
    entry_count INTEGER NOT NULL DEFAULT 0,
    last_sequence_id INTEGER NOT NULL
)
"#;

// One row per user x sp
pub const CREATE_LAST_LOGIN_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS last_login (
    key_hash TEXT PRIMARY KEY,            -- sha256(user!sp)
    user_id TEXT NOT NULL,
    idp_entity_id TEXT NOT NULL,
    idp_entity_name TEXT,
    sp_entity_id TEXT NOT NULL,
    sp_entity_name TEXT,
    login_stamp BIGINT NOT NULL,          -- epoch millis
    last_sequence_id INTEGER NOT NULL
)
"#;

// One row per month x user x sp x idp, feeds the monthly unique-user count
pub const CREATE_UNIQUE_LOGINS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS unique_logins (
    key_hash TEXT PRIMARY KEY,            -- sha256(month!user!sp!idp)
    entry_month TEXT NOT NULL,            -- first day of month, YYYY-MM-DD
    user_id TEXT NOT NULL,
    idp_entity_id TEXT NOT NULL,
    sp_entity_id TEXT NOT NULL,
    last_sequence_id INTEGER NOT NULL
)
"#;

// Single row: aggregation progress plus the cross-instance busy flag
pub const CREATE_WATERMARK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS watermark (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    position INTEGER NOT NULL DEFAULT 0,  -- last folded sequence_id
    busy INTEGER NOT NULL DEFAULT 0,
    locked_at BIGINT                      -- epoch millis, NULL when idle
)
"#;

pub const SEED_WATERMARK: &str =
    "INSERT OR IGNORE INTO watermark (id, position, busy) VALUES (1, 0, 0)";

// === INDEXES ===

// Time-series read path: range scan ordered by (idp, sp, day)
pub const CREATE_INDEX_DAILY_IDP: &str =
    "CREATE INDEX IF NOT EXISTS idx_daily_idp ON daily_counts(idp_entity_id, sp_entity_id, entry_day)";

// Time-series filtered on sp only, and the monthly report
pub const CREATE_INDEX_DAILY_SP: &str =
    "CREATE INDEX IF NOT EXISTS idx_daily_sp ON daily_counts(sp_entity_id, entry_day)";

// Retention sweep
pub const CREATE_INDEX_DAILY_DAY: &str =
    "CREATE INDEX IF NOT EXISTS idx_daily_day ON daily_counts(entry_day)";

// Recent-activity lookup
pub const CREATE_INDEX_LAST_LOGIN_USER: &str =
    "CREATE INDEX IF NOT EXISTS idx_last_login_user ON last_login(user_id, idp_entity_id)";

pub const CREATE_INDEX_LAST_LOGIN_STAMP: &str =
    "CREATE INDEX IF NOT EXISTS idx_last_login_stamp ON last_login(login_stamp)";

pub const CREATE_INDEX_UNIQUE_MONTH_SP: &str =
    "CREATE INDEX IF NOT EXISTS idx_unique_month_sp ON unique_logins(entry_month, sp_entity_id)";

pub const AGGREGATE_STORE: &[&str] = &[
    CREATE_DAILY_COUNTS_TABLE,
    CREATE_LAST_LOGIN_TABLE,
    CREATE_UNIQUE_LOGINS_TABLE,
    CREATE_WATERMARK_TABLE,
    SEED_WATERMARK,
    CREATE_INDEX_DAILY_IDP,
    CREATE_INDEX_DAILY_SP,
    CREATE_INDEX_DAILY_DAY,
    CREATE_INDEX_LAST_LOGIN_USER,
    CREATE_INDEX_LAST_LOGIN_STAMP,
    CREATE_INDEX_UNIQUE_MONTH_SP,
];
