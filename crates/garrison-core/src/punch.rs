//! Per-user punch cooldown and IN/OUT alternation.
//!
//! The in-memory map is only a cooldown timer. Which punch comes next is
//! always read back from the persisted log, so a restart can neither
//! double-punch through memory loss nor break the IN/OUT sequence.

use crate::pipeline::{AttendanceStore, PersistenceError};
use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_PUNCH_COOLDOWN_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PunchType {
    In,
    Out,
}

impl PunchType {
    pub fn as_str(self) -> &'static str {
        match self {
            PunchType::In => "IN",
            PunchType::Out => "OUT",
        }
    }

    /// The punch that follows the user's most recent one.
    pub fn next_after(last: Option<PunchType>) -> PunchType {
        match last {
            Some(PunchType::In) => PunchType::Out,
            Some(PunchType::Out) | None => PunchType::In,
        }
    }
}

impl std::fmt::Display for PunchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PunchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "IN" | "in" => Ok(PunchType::In),
            "OUT" | "out" => Ok(PunchType::Out),
            other => Err(format!("unknown punch type: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PunchStateMachine {
    cooldown: Duration,
    last_punch_time: HashMap<i64, DateTime<Local>>,
}

impl Default for PunchStateMachine {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_PUNCH_COOLDOWN_SECS))
    }
}

impl PunchStateMachine {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_punch_time: HashMap::new(),
        }
    }

    /// False while `user_id` is still inside its cooldown window.
    pub fn should_punch(&self, user_id: i64, now: DateTime<Local>) -> bool {
        match self.last_punch_time.get(&user_id) {
            Some(&last) => now - last >= self.cooldown,
            None => true,
        }
    }

    /// Start a new cooldown window for `user_id`.
    pub fn record(&mut self, user_id: i64, now: DateTime<Local>) {
        self.last_punch_time.insert(user_id, now);
    }

    pub fn last_punch_time(&self, user_id: i64) -> Option<DateTime<Local>> {
        self.last_punch_time.get(&user_id).copied()
    }

    /// Next punch type for `user_id`, from the most recent persisted record.
    pub fn get_punch_type(
        &self,
        store: &mut dyn AttendanceStore,
        user_id: i64,
    ) -> Result<PunchType, PersistenceError> {
        let last = store.last_punch_type(user_id)?;
        Ok(PunchType::next_after(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PunchRecord;
    use chrono::TimeZone;

    fn t0() -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    struct LastPunch(Option<PunchType>);

    impl AttendanceStore for LastPunch {
        fn last_punch_type(&mut self, _user_id: i64) -> Result<Option<PunchType>, PersistenceError> {
            Ok(self.0)
        }

        fn record_punch(&mut self, _record: &PunchRecord) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    #[test]
    fn test_cooldown_window() {
        let mut sm = PunchStateMachine::default();
        sm.record(42, t0());
        assert!(!sm.should_punch(42, t0() + Duration::seconds(29)));
        assert!(sm.should_punch(42, t0() + Duration::seconds(31)));
    }

    #[test]
    fn test_cooldown_is_per_user() {
        let mut sm = PunchStateMachine::default();
        sm.record(42, t0());
        assert!(sm.should_punch(7, t0()));
        assert!(!sm.should_punch(42, t0()));
    }

    #[test]
    fn test_first_punch_allowed() {
        assert!(PunchStateMachine::default().should_punch(1, t0()));
    }

    #[test]
    fn test_punch_type_alternates_from_history() {
        let sm = PunchStateMachine::default();
        assert_eq!(sm.get_punch_type(&mut LastPunch(None), 7).unwrap(), PunchType::In);
        assert_eq!(sm.get_punch_type(&mut LastPunch(Some(PunchType::In)), 7).unwrap(), PunchType::Out);
        assert_eq!(sm.get_punch_type(&mut LastPunch(Some(PunchType::Out)), 7).unwrap(), PunchType::In);
    }

    #[test]
    fn test_punch_type_text_round_trip() {
        assert_eq!("IN".parse::<PunchType>().unwrap(), PunchType::In);
        assert_eq!(PunchType::Out.to_string(), "OUT");
        assert!("SIDEWAYS".parse::<PunchType>().is_err());
    }
}
