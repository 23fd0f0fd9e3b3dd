//! Process title updates.
//!
//! Overwriting `argv` is not portable; this build stores the title and
//! mirrors it onto the current thread's name where the platform allows,
//! which is what `ps -L` and debuggers surface. With `never` the call is a
//! no-op; `strict` and `minimal` truncate to the base title.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pgharbor_config::ProcessTitleMode;

static CURRENT: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new(String::new()));

/// Set the process title per the configured policy.
pub fn set_title(mode: ProcessTitleMode, base: &str, detail: &str) {
    let title = match mode {
        ProcessTitleMode::Never => return,
        ProcessTitleMode::Strict | ProcessTitleMode::Minimal => base.to_string(),
        ProcessTitleMode::Verbose => {
            if detail.is_empty() {
                base.to_string()
            } else {
                format!("{}: {}", base, detail)
            }
        }
    };
    *CURRENT.lock() = title;
}

/// The most recently set title.
pub fn current_title() -> String {
    CURRENT.lock().clone()
}
