use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Public struct `CommandCounters` used across Relay components.
pub struct CommandCounters {
    pub total: u64,
    pub successful: u64,
}

#[derive(Debug, Default)]
/// Process-wide append-only invocation counters keyed by command name.
pub struct CommandStatistics {
    counters: Mutex<BTreeMap<String, CommandCounters>>,
}

impl CommandStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, command: &str, success: bool) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = counters.entry(command.to_string()).or_default();
        entry.total = entry.total.saturating_add(1);
        if success {
            entry.successful = entry.successful.saturating_add(1);
        }
    }

    pub fn get(&self, command: &str) -> Option<CommandCounters> {
        self.snapshot().get(command).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CommandCounters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn total_invocations(&self) -> u64 {
        self.snapshot()
            .values()
            .fold(0u64, |total, counters| total.saturating_add(counters.total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_record_counts_total_and_successful_separately() {
        let stats = CommandStatistics::new();
        stats.record("ping", true);
        stats.record("ping", false);
        stats.record("help", true);

        assert_eq!(
            stats.get("ping"),
            Some(CommandCounters {
                total: 2,
                successful: 1
            })
        );
        assert_eq!(stats.total_invocations(), 3);
        assert_eq!(stats.get("echo"), None);
    }
}
