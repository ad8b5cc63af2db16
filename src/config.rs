use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "PestMA";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default Ollama endpoint when `PESTMA_OLLAMA_URL` is unset.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Per-call deadline for the model collaborator, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Tracing filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if is_dev() {
        "pestma=debug,pestma_lib=debug"
    } else {
        "pestma=info,pestma_lib=info"
    }
}

/// Debug builds count as development.
pub fn is_dev() -> bool {
    cfg!(debug_assertions)
}

/// Ollama base URL (`PESTMA_OLLAMA_URL` override).
pub fn ollama_url() -> String {
    std::env::var("PESTMA_OLLAMA_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string())
}

/// Collaborator timeout (`PESTMA_TIMEOUT_SECS` override). Unparseable values fall back
/// to the default.
pub fn timeout_secs() -> u64 {
    parse_timeout(std::env::var("PESTMA_TIMEOUT_SECS").ok().as_deref())
}

fn parse_timeout(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS)
}

/// Get the application data directory.
/// `PESTMA_DATA_DIR` if set, else ~/PestMA/.
pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PESTMA_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Directory holding saved analysis runs.
pub fn analyses_dir() -> PathBuf {
    app_data_dir().join("analyses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyses_dir_under_app_data() {
        let analyses = analyses_dir();
        assert!(analyses.starts_with(app_data_dir()));
        assert!(analyses.ends_with("analyses"));
    }

    #[test]
    fn app_name_is_pestma() {
        assert_eq!(APP_NAME, "PestMA");
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }

    #[test]
    fn timeout_parsing_falls_back_on_garbage() {
        assert_eq!(parse_timeout(None), DEFAULT_TIMEOUT_SECS);
        assert_eq!(parse_timeout(Some("abc")), DEFAULT_TIMEOUT_SECS);
        assert_eq!(parse_timeout(Some("0")), DEFAULT_TIMEOUT_SECS);
        assert_eq!(parse_timeout(Some(" 45 ")), 45);
    }

    #[test]
    fn log_filter_targets_crate() {
        assert!(default_log_filter().contains("pestma"));
    }
}
