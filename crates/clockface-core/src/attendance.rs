//! Cooldown-gated in/out attendance state machine.
//!
//! The decision logic is a pure function over one employee's history for a
//! single calendar day ([`next_event`]). [`AttendanceTracker`] wraps it with a
//! pluggable [`AttendanceLog`] so the read-decide-append sequence can run
//! inside whatever critical section the storage layer provides.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

/// Minimum gap between two consecutive events for the same employee.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    In,
    Out,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::In => "in",
            EventKind::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(EventKind::In),
            "out" => Some(EventKind::Out),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded in/out event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Wall-clock time of day, `HH:MM:SS`.
    pub time: String,
    /// Local timestamp with its UTC offset, RFC 3339.
    pub timestamp: String,
    /// Match score that triggered the event, when recorded by recognition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl AttendanceEvent {
    pub fn new(kind: EventKind, at: DateTime<FixedOffset>, confidence: Option<f32>) -> Self {
        Self {
            kind,
            time: at.format("%H:%M:%S").to_string(),
            timestamp: at.to_rfc3339(),
            confidence,
        }
    }

    /// Parse the stored timestamp. `None` if it is malformed.
    pub fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }
}

/// Per-(employee, day) state derived from that day's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceState {
    NoRecordToday,
    /// Last event was `in`.
    AwaitingOut,
    /// Last event was `out`.
    AwaitingIn,
}

impl AttendanceState {
    pub fn from_history(history: &[AttendanceEvent]) -> Self {
        match history.last().map(|e| e.kind) {
            None => AttendanceState::NoRecordToday,
            Some(EventKind::In) => AttendanceState::AwaitingOut,
            Some(EventKind::Out) => AttendanceState::AwaitingIn,
        }
    }

    /// Kind of the next event accepted in this state.
    pub fn next_kind(self) -> EventKind {
        match self {
            AttendanceState::NoRecordToday | AttendanceState::AwaitingIn => EventKind::In,
            AttendanceState::AwaitingOut => EventKind::Out,
        }
    }
}

/// Reason a proposed event was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Cooldown { remaining_secs: u64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Cooldown { remaining_secs } => write!(
                f,
                "Please wait {remaining_secs} seconds before marking attendance again"
            ),
        }
    }
}

/// Decide the next event for a day's history.
///
/// `history` must hold only the events of `now`'s local calendar day, oldest
/// first. Elapsed time is measured between instants, so an offset change
/// (DST) between two events does not distort the cooldown. The first event of a day is always `in`. Later events toggle, but
/// only once `cooldown` has elapsed since the last event. If `now` is
/// earlier than the last event the wait never exceeds `cooldown`. A
/// malformed last timestamp disables the cooldown check for this decision.
pub fn next_event(
    history: &[AttendanceEvent],
    now: DateTime<FixedOffset>,
    cooldown: Duration,
    confidence: Option<f32>,
) -> Result<AttendanceEvent, Rejection> {
    let state = AttendanceState::from_history(history);

    if let Some(last) = history.last() {
        match last.parsed_timestamp() {
            Some(last_at) => {
                let mut elapsed = (now - last_at).num_milliseconds() as f64 / 1000.0;
                if elapsed < 0.0 {
                    // System clock was set back: restart the wait from now.
                    tracing::warn!(last = %last_at, %now, "attendance clock moved backwards");
                    elapsed = 0.0;
                }
                let cooldown = cooldown.as_secs_f64();
                if elapsed < cooldown {
                    let remaining_secs = (cooldown - elapsed).ceil() as u64;
                    return Err(Rejection::Cooldown { remaining_secs });
                }
            }
            None => {
                tracing::warn!(
                    timestamp = %last.timestamp,
                    "unparseable attendance timestamp; skipping cooldown check"
                );
            }
        }
    }

    Ok(AttendanceEvent::new(state.next_kind(), now, confidence))
}

/// Return `history` extended with the next event, or the rejection.
/// The input history is never modified.
pub fn apply(
    history: &[AttendanceEvent],
    now: DateTime<FixedOffset>,
    cooldown: Duration,
    confidence: Option<f32>,
) -> Result<Vec<AttendanceEvent>, Rejection> {
    let event = next_event(history, now, cooldown, confidence)?;
    let mut updated = history.to_vec();
    updated.push(event);
    Ok(updated)
}

/// Storage for per-day attendance histories.
pub trait AttendanceLog {
    type Error;

    /// Events for `employee_id` on `date`, oldest first.
    fn day_record(
        &self,
        employee_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, Self::Error>;

    fn append_event(
        &mut self,
        employee_id: &str,
        date: NaiveDate,
        event: &AttendanceEvent,
    ) -> Result<(), Self::Error>;
}

/// In-memory log, used by tests and the offline CLI.
#[derive(Debug, Default)]
pub struct MemoryAttendanceLog {
    days: HashMap<(String, NaiveDate), Vec<AttendanceEvent>>,
}

impl AttendanceLog for MemoryAttendanceLog {
    type Error = Infallible;

    fn day_record(
        &self,
        employee_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceEvent>, Infallible> {
        Ok(self
            .days
            .get(&(employee_id.to_string(), date))
            .cloned()
            .unwrap_or_default())
    }

    fn append_event(
        &mut self,
        employee_id: &str,
        date: NaiveDate,
        event: &AttendanceEvent,
    ) -> Result<(), Infallible> {
        self.days
            .entry((employee_id.to_string(), date))
            .or_default()
            .push(event.clone());
        Ok(())
    }
}

/// Result of one attendance attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<AttendanceEvent>,
}

/// Applies [`next_event`] against an [`AttendanceLog`].
///
/// Not synchronized: callers must make one `record` call a critical section
/// per employee (the daemon runs it inside a single SQLite transaction).
pub struct AttendanceTracker<L> {
    log: L,
    cooldown: Duration,
}

impl<L: AttendanceLog> AttendanceTracker<L> {
    pub fn new(log: L) -> Self {
        Self::with_cooldown(log, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(log: L, cooldown: Duration) -> Self {
        Self { log, cooldown }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn record(
        &mut self,
        employee_id: &str,
        now: DateTime<FixedOffset>,
    ) -> Result<RecordOutcome, L::Error> {
        self.record_with_confidence(employee_id, now, None)
    }

    /// Record the next event, tagging it with the match score that
    /// identified the employee.
    pub fn record_with_confidence(
        &mut self,
        employee_id: &str,
        now: DateTime<FixedOffset>,
        confidence: Option<f32>,
    ) -> Result<RecordOutcome, L::Error> {
        let date = now.date_naive();
        let history = self.log.day_record(employee_id, date)?;

        match next_event(&history, now, self.cooldown, confidence) {
            Ok(event) => {
                self.log.append_event(employee_id, date, &event)?;
                let verb = match event.kind {
                    EventKind::In => "Checked in",
                    EventKind::Out => "Checked out",
                };
                tracing::info!(employee_id, kind = %event.kind, time = %event.time, "attendance recorded");
                Ok(RecordOutcome {
                    ok: true,
                    message: format!("{verb} at {}", event.time),
                    event: Some(event),
                })
            }
            Err(rejection) => {
                tracing::info!(employee_id, %rejection, "attendance rejected");
                Ok(RecordOutcome {
                    ok: false,
                    message: rejection.to_string(),
                    event: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn on(day: u32, h: u32, m: u32, s: u32, offset_hours: i32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(offset_hours * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, day, h, m, s)
            .unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        on(4, h, m, s, 0)
    }

    fn tracker() -> AttendanceTracker<MemoryAttendanceLog> {
        AttendanceTracker::new(MemoryAttendanceLog::default())
    }

    #[test]
    fn test_first_event_of_day_is_in() {
        let event = next_event(&[], at(9, 0, 0), DEFAULT_COOLDOWN, None).unwrap();
        assert_eq!(event.kind, EventKind::In);
        assert_eq!(event.time, "09:00:00");
        assert_eq!(event.parsed_timestamp(), Some(at(9, 0, 0)));
    }

    #[test]
    fn test_morning_scenario() {
        let mut t = tracker();

        let first = t.record("E1", at(9, 0, 0)).unwrap();
        assert!(first.ok);
        assert_eq!(first.event.as_ref().unwrap().kind, EventKind::In);

        // 61 seconds after check-in: 59 of the 120 remain.
        let early = t.record("E1", at(9, 1, 1)).unwrap();
        assert!(!early.ok);
        assert!(early.message.contains("wait 59 seconds"), "{}", early.message);
        assert!(early.event.is_none());

        let later = t.record("E1", at(9, 2, 1)).unwrap();
        assert!(later.ok);
        assert_eq!(later.event.unwrap().kind, EventKind::Out);

        let day = t.log().day_record("E1", at(9, 0, 0).date_naive()).unwrap();
        assert_eq!(day.len(), 2);
    }

    #[test]
    fn test_cooldown_boundary() {
        let history = apply(&[], at(9, 0, 0), DEFAULT_COOLDOWN, None).unwrap();

        let just_before = at(9, 1, 59);
        assert_eq!(
            next_event(&history, just_before, DEFAULT_COOLDOWN, None),
            Err(Rejection::Cooldown { remaining_secs: 1 })
        );

        let event = next_event(&history, at(9, 2, 0), DEFAULT_COOLDOWN, None).unwrap();
        assert_eq!(event.kind, EventKind::Out);
    }

    #[test]
    fn test_remaining_wait_counts_whole_seconds() {
        let history = apply(&[], at(9, 0, 0), DEFAULT_COOLDOWN, None).unwrap();
        assert_eq!(
            next_event(&history, at(9, 1, 0), DEFAULT_COOLDOWN, None),
            Err(Rejection::Cooldown { remaining_secs: 60 })
        );
        assert_eq!(
            next_event(&history, at(9, 1, 1), DEFAULT_COOLDOWN, None),
            Err(Rejection::Cooldown { remaining_secs: 59 })
        );
    }

    #[test]
    fn test_sub_second_remaining_rounds_up() {
        let history = apply(&[], at(9, 0, 0), DEFAULT_COOLDOWN, None).unwrap();
        let now = at(9, 1, 59) + chrono::Duration::milliseconds(500);
        assert_eq!(
            next_event(&history, now, DEFAULT_COOLDOWN, None),
            Err(Rejection::Cooldown { remaining_secs: 1 })
        );
    }

    #[test]
    fn test_dst_fall_back_uses_real_elapsed_time() {
        // 01:50 at UTC+1, then clocks fall back; 01:05 at UTC+0 is 15
        // minutes later in real time.
        let history = apply(&[], on(4, 1, 50, 0, 1), DEFAULT_COOLDOWN, None).unwrap();
        let event = next_event(&history, on(4, 1, 5, 0, 0), DEFAULT_COOLDOWN, None).unwrap();
        assert_eq!(event.kind, EventKind::Out);
        assert_eq!(event.time, "01:05:00");

        // One minute of real time across the switch is still inside the cooldown.
        assert_eq!(
            next_event(&history, on(4, 0, 51, 0, 0), DEFAULT_COOLDOWN, None),
            Err(Rejection::Cooldown { remaining_secs: 60 })
        );
    }

    #[test]
    fn test_clock_set_back_caps_wait_at_cooldown() {
        let history = apply(&[], at(9, 30, 0), DEFAULT_COOLDOWN, None).unwrap();
        assert_eq!(
            next_event(&history, at(9, 0, 0), DEFAULT_COOLDOWN, None),
            Err(Rejection::Cooldown { remaining_secs: 120 })
        );
    }

    #[test]
    fn test_events_alternate() {
        let mut history = Vec::new();
        for (i, minute) in [0u32, 5, 10, 15, 20].iter().enumerate() {
            history = apply(&history, at(9, *minute, 0), DEFAULT_COOLDOWN, None).unwrap();
            let expected = if i % 2 == 0 { EventKind::In } else { EventKind::Out };
            assert_eq!(history.last().unwrap().kind, expected);
        }
        assert_eq!(AttendanceState::from_history(&history), AttendanceState::AwaitingOut);
    }

    #[test]
    fn test_rejection_leaves_history_unchanged() {
        let history = apply(&[], at(9, 0, 0), DEFAULT_COOLDOWN, None).unwrap();
        assert!(apply(&history, at(9, 0, 30), DEFAULT_COOLDOWN, None).is_err());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_new_day_starts_with_in() {
        let mut t = tracker();
        let evening = on(4, 23, 59, 30, 0);
        let midnight = on(5, 0, 0, 10, 0);

        assert!(t.record("E1", evening).unwrap().ok);
        // 40 seconds later but a new calendar day: no cooldown, kind resets.
        let outcome = t.record("E1", midnight).unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.event.unwrap().kind, EventKind::In);
    }

    #[test]
    fn test_employees_are_independent() {
        let mut t = tracker();
        assert!(t.record("E1", at(9, 0, 0)).unwrap().ok);
        assert!(t.record("E2", at(9, 0, 1)).unwrap().ok);
    }

    #[test]
    fn test_malformed_timestamp_is_permissive() {
        let history = vec![AttendanceEvent {
            kind: EventKind::In,
            time: "09:00:00".into(),
            timestamp: "not a timestamp".into(),
            confidence: None,
        }];
        let event = next_event(&history, at(9, 0, 5), DEFAULT_COOLDOWN, None).unwrap();
        assert_eq!(event.kind, EventKind::Out);
    }

    #[test]
    fn test_confidence_is_kept() {
        let mut t = tracker();
        let outcome = t.record_with_confidence("E1", at(8, 30, 0), Some(0.91)).unwrap();
        assert_eq!(outcome.event.unwrap().confidence, Some(0.91));
        assert_eq!(outcome.message, "Checked in at 08:30:00");
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = AttendanceEvent::new(EventKind::Out, at(17, 0, 0), None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "out");
        assert_eq!(json["time"], "17:00:00");
        assert!(json.get("confidence").is_none());
    }
}
