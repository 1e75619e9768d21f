//! Duplicate-suppressing logger
//!
//! Retry loops hit the same failure every tick. `LogReducer` remembers the
//! last message per level and drops exact repeats until the message changes
//! or [`LogReducer::reset`] is called.

use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub struct LogReducer {
    last_info: Option<String>,
    last_warn: Option<String>,
    last_error: Option<String>,
}

impl LogReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log at info level unless identical to the previous info message.
    /// Returns whether the message was written.
    pub fn info(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if Self::is_repeat(&mut self.last_info, &message) {
            return false;
        }
        info!("{}", message);
        true
    }

    pub fn warn(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if Self::is_repeat(&mut self.last_warn, &message) {
            return false;
        }
        warn!("{}", message);
        true
    }

    pub fn error(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if Self::is_repeat(&mut self.last_error, &message) {
            return false;
        }
        error!("{}", message);
        true
    }

    /// Forget every remembered message
    pub fn reset(&mut self) {
        self.last_info = None;
        self.last_warn = None;
        self.last_error = None;
    }

    fn is_repeat(last: &mut Option<String>, message: &str) -> bool {
        if last.as_deref() == Some(message) {
            return true;
        }
        *last = Some(message.to_owned());
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeats_suppressed_until_change() {
        let mut reducer = LogReducer::new();
        assert!(reducer.warn("open failed"));
        assert!(!reducer.warn("open failed"));
        assert!(reducer.warn("device busy"));
        assert!(reducer.warn("open failed"));
    }

    #[test]
    fn test_levels_are_independent() {
        let mut reducer = LogReducer::new();
        assert!(reducer.info("x"));
        assert!(reducer.warn("x"));
        assert!(reducer.error("x"));
        assert!(!reducer.error("x"));
    }

    #[test]
    fn test_reset() {
        let mut reducer = LogReducer::new();
        assert!(reducer.error("seize failed"));
        reducer.reset();
        assert!(reducer.error("seize failed"));
    }
}
