//! Time-slot validation for appraisal appointments.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::api::DateRange;
use crate::datetime::{local_naive_in, month_bounds};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    #[serde(default)]
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applicant_id: Option<String>,
}

/// Part of an event that falls on one local day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSpan {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl EventSpan {
    /// Half-open overlap: touching endpoints do not collide.
    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        start < self.end && end > self.start
    }
}

pub type DayEvents = BTreeMap<NaiveDate, Vec<EventSpan>>;

/// `true` when `[start, end)` on `date` cannot be booked: the range is empty
/// or reversed, or it overlaps an event already on that day.
pub fn has_conflict(
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
    day_events: &DayEvents,
) -> bool {
    if end <= start {
        return true;
    }
    let start = date.and_time(start);
    let end = date.and_time(end);
    day_events
        .get(&date)
        .is_some_and(|spans| spans.iter().any(|span| span.overlaps(start, end)))
}

/// Indexes events by each local date they touch, clipping multi-day events
/// to the day.
pub fn index_by_local_date(events: &[CalendarEvent], tz: &Tz) -> DayEvents {
    let mut index = DayEvents::new();
    for event in events {
        let start = local_naive_in(event.start, tz);
        let end = local_naive_in(event.end, tz);
        if end <= start {
            debug!(title = %event.title, "skipping zero-length event");
            continue;
        }

        let mut day = start.date();
        while day.and_time(NaiveTime::default()) < end {
            let day_start = day.and_time(NaiveTime::default());
            let day_end = day_start + Duration::days(1);
            index.entry(day).or_default().push(EventSpan {
                start: start.max(day_start),
                end: end.min(day_end),
            });
            let Some(next) = day.succ_opt() else {
                break;
            };
            day = next;
        }
    }
    index
}

/// Events for the month on screen. Fetched once per month; switching month
/// clears the day index.
#[derive(Debug, Clone, Default)]
pub struct MonthEvents {
    month: Option<(i32, u32)>,
    days: DayEvents,
}

impl MonthEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn month(&self) -> Option<(i32, u32)> {
        self.month
    }

    pub fn is_showing(&self, year: i32, month: u32) -> bool {
        self.month == Some((year, month))
    }

    pub fn days(&self) -> &DayEvents {
        &self.days
    }

    pub fn range_for(year: i32, month: u32) -> Option<DateRange> {
        month_bounds(year, month).map(|(start, end)| DateRange { start, end })
    }

    /// Replaces the cache with a freshly fetched month.
    #[instrument(skip(self, events, tz), fields(count = events.len()))]
    pub fn load(&mut self, year: i32, month: u32, events: &[CalendarEvent], tz: &Tz) {
        self.month = Some((year, month));
        self.days = index_by_local_date(events, tz);
        debug!(days = self.days.len(), "indexed month events");
    }

    pub fn reset(&mut self) {
        self.month = None;
        self.days.clear();
    }

    /// Records a just-booked slot so the next check sees it without a
    /// re-fetch.
    pub fn insert(&mut self, date: NaiveDate, span: EventSpan) {
        self.days.entry(date).or_default().push(span);
    }
}

/// The three inputs of the appointment form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentDraft {
    pub date: Option<NaiveDate>,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
}

impl AppointmentDraft {
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            date: Some(date),
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn parts(&self) -> Option<(NaiveDate, NaiveTime, NaiveTime)> {
        Some((self.date?, self.start?, self.end?))
    }

    pub fn has_conflict(&self, day_events: &DayEvents) -> bool {
        self.parts()
            .is_some_and(|(date, start, end)| has_conflict(date, start, end, day_events))
    }

    /// Whether the booking action should be enabled.
    pub fn can_commit(&self, day_events: &DayEvents) -> bool {
        match self.parts() {
            Some((date, start, end)) => !has_conflict(date, start, end, day_events),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("valid instant")
    }

    fn june_tenth() -> DayEvents {
        let events = vec![CalendarEvent {
            title: "Team sync".to_string(),
            start: utc(2024, 6, 10, 14, 0),
            end: utc(2024, 6, 10, 15, 0),
        }];
        index_by_local_date(&events, &chrono_tz::UTC)
    }

    #[test]
    fn overlapping_slot_conflicts_and_abutting_slot_does_not() {
        let events = june_tenth();
        let day = date(2024, 6, 10);
        assert!(has_conflict(day, time(13, 30), time(14, 15), &events));
        assert!(!has_conflict(day, time(15, 0), time(16, 0), &events));
        assert!(!has_conflict(day, time(13, 0), time(14, 0), &events));
        assert!(!has_conflict(date(2024, 6, 11), time(14, 0), time(15, 0), &events));
    }

    #[test]
    fn empty_or_reversed_ranges_always_conflict() {
        let none = DayEvents::new();
        let day = date(2024, 6, 10);
        assert!(has_conflict(day, time(10, 0), time(10, 0), &none));
        assert!(has_conflict(day, time(11, 0), time(10, 0), &none));
        assert!(has_conflict(day, time(11, 0), time(10, 0), &june_tenth()));
    }

    #[test]
    fn check_is_repeatable() {
        let events = june_tenth();
        let day = date(2024, 6, 10);
        let first = has_conflict(day, time(14, 30), time(14, 45), &events);
        for _ in 0..3 {
            assert_eq!(has_conflict(day, time(14, 30), time(14, 45), &events), first);
        }
    }

    #[test]
    fn overnight_events_block_both_days() {
        let events = vec![CalendarEvent {
            title: "Night shift".to_string(),
            start: utc(2024, 6, 10, 22, 0),
            end: utc(2024, 6, 11, 6, 0),
        }];
        let index = index_by_local_date(&events, &chrono_tz::UTC);
        assert_eq!(index.len(), 2);
        assert!(has_conflict(date(2024, 6, 10), time(23, 0), time(23, 30), &index));
        assert!(has_conflict(date(2024, 6, 11), time(5, 0), time(7, 0), &index));
        assert!(!has_conflict(date(2024, 6, 11), time(6, 0), time(7, 0), &index));
    }

    #[test]
    fn events_are_filed_under_their_local_day() {
        let tz: Tz = "America/New_York".parse().expect("tz");
        let events = vec![CalendarEvent {
            title: "Late call".to_string(),
            start: utc(2024, 6, 11, 1, 0),
            end: utc(2024, 6, 11, 2, 0),
        }];
        let index = index_by_local_date(&events, &tz);
        assert!(has_conflict(date(2024, 6, 10), time(21, 30), time(22, 30), &index));
        assert!(index.get(&date(2024, 6, 11)).is_none());
    }

    #[test]
    fn incomplete_draft_cannot_commit() {
        let events = june_tenth();
        let mut draft = AppointmentDraft {
            date: Some(date(2024, 6, 10)),
            start: Some(time(15, 0)),
            end: None,
        };
        assert!(!draft.can_commit(&events));
        assert!(!draft.has_conflict(&events));

        draft.end = Some(time(16, 0));
        assert!(draft.can_commit(&events));

        draft.start = Some(time(13, 30));
        assert!(!draft.can_commit(&events));
    }

    #[test]
    fn switching_month_resets_the_index() {
        let mut cache = MonthEvents::new();
        let events = vec![CalendarEvent {
            title: "Team sync".to_string(),
            start: utc(2024, 6, 10, 14, 0),
            end: utc(2024, 6, 10, 15, 0),
        }];
        cache.load(2024, 6, &events, &chrono_tz::UTC);
        assert!(cache.is_showing(2024, 6));
        assert_eq!(cache.days().len(), 1);

        cache.load(2024, 7, &[], &chrono_tz::UTC);
        assert!(cache.is_showing(2024, 7));
        assert!(cache.days().is_empty());
    }
}
