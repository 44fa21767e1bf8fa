use std::path::PathBuf;

pub const ENV_WORKSPACE: &str = "EXAMSEATD_WORKSPACE";
pub const ENV_LOG: &str = "EXAMSEATD_LOG";
pub const ENV_LOG_FORMAT: &str = "EXAMSEATD_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Startup settings. Everything else arrives over IPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Workspace to open before the first request, if any.
    pub workspace: Option<PathBuf>,
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let workspace = non_empty(ENV_WORKSPACE).map(|v| PathBuf::from(v.trim()));
        let log_filter = non_empty(ENV_LOG)
            .or_else(|| non_empty("RUST_LOG"))
            .unwrap_or_else(|| "info".to_string());
        let log_format = match non_empty(ENV_LOG_FORMAT).as_deref().map(str::trim) {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            workspace,
            log_filter,
            log_format,
        }
    }
}
