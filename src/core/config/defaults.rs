//! Serde defaults for [`super::data::PoolConfig`].

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_USER_ID_HEADER: &str = "X-MCP-User-ID";
pub const DEFAULT_CLIENT_NAME: &str = "mcpool";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 15 * 60;

pub(crate) fn enabled() -> bool {
    true
}

pub(crate) fn idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

pub(crate) fn sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

pub(crate) fn user_id_header() -> String {
    DEFAULT_USER_ID_HEADER.to_string()
}

pub(crate) fn request_timeout_secs() -> u64 {
    60
}

pub(crate) fn connect_timeout_secs() -> u64 {
    10
}

pub(crate) fn client_name() -> String {
    DEFAULT_CLIENT_NAME.to_string()
}

pub(crate) fn session_ttl_secs() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}
