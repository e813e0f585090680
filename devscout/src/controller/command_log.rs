use std::collections::VecDeque;

use chrono::Local;
use parking_lot::Mutex;

/// Number of entries kept by [`CommandLog`].
pub const COMMAND_LOG_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum CommandAction {
    Start,
    Stop,
}

/// Bounded history of feeder start/stop commands, oldest first.
#[derive(Debug)]
pub struct CommandLog {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl CommandLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Append `[YYYY/MM/DD HH:MM:SS] ACTION kind: result`, evicting the oldest
    /// entry when full.
    pub fn record(&self, action: CommandAction, kind: &str, succeeded: bool) {
        let entry = format!(
            "[{}] {action} {kind}: {succeeded}",
            Local::now().format("%Y/%m/%d %H:%M:%S")
        );
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new(COMMAND_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_display() {
        assert_eq!(CommandAction::Start.to_string(), "START");
        assert_eq!(CommandAction::Stop.to_string(), "STOP");
    }

    #[test]
    fn test_entry_format() {
        let log = CommandLog::default();
        log.record(CommandAction::Start, "UnknownKind", false);
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with('['));
        assert!(entries[0].ends_with("] START UnknownKind: false"));
        // [YYYY/MM/DD HH:MM:SS]
        assert_eq!(entries[0].find(']'), Some(20));
    }

    #[test]
    fn test_keeps_last_ten() {
        let log = CommandLog::default();
        for i in 0..15 {
            log.record(CommandAction::Stop, &format!("kind{i}"), true);
        }
        let entries = log.entries();
        assert_eq!(entries.len(), COMMAND_LOG_CAPACITY);
        assert!(entries[0].contains("kind5"));
        assert!(entries[9].contains("kind14"));
    }
}
