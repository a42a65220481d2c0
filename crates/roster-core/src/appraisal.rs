use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use tracing::{debug, info, instrument, warn};

use crate::api::{ApiError, CalendarApi};
use crate::controller::{CommitOutcome, ValidationError};
use crate::datetime::{local_to_utc_in, month_of};
use crate::interval::{AppointmentDraft, EventSpan, MonthEvents, NewEvent};
use crate::notice::{Notice, Notices};
use crate::task::Task;

/// Books appraisal appointments against the calendar of the month on
/// screen.
pub struct AppraisalScheduler<C> {
    calendar: Arc<C>,
    tz: Tz,
    events: MonthEvents,
    notices: Notices,
}

impl<C> AppraisalScheduler<C>
where
    C: CalendarApi + Send + Sync,
{
    pub fn new(calendar: Arc<C>, tz: Tz, notices: Notices) -> Self {
        Self {
            calendar,
            tz,
            events: MonthEvents::new(),
            notices,
        }
    }

    pub fn events(&self) -> &MonthEvents {
        &self.events
    }

    /// Loads the month's events unless that month is already cached.
    /// Returns whether a fetch happened.
    #[instrument(skip(self))]
    pub async fn show_month(&mut self, year: i32, month: u32) -> Result<bool, ApiError> {
        if self.events.is_showing(year, month) {
            debug!("month already cached");
            return Ok(false);
        }
        let range = MonthEvents::range_for(year, month)
            .ok_or_else(|| ApiError::Decode(format!("invalid month {year}-{month}")))?;

        self.events.reset();
        let fetched = self.calendar.fetch_events(range).await?;
        self.events.load(year, month, &fetched, &self.tz);
        info!(count = fetched.len(), "loaded calendar month");
        Ok(true)
    }

    /// Ensures the cache covers `date`.
    pub async fn show_date(&mut self, date: NaiveDate) -> Result<bool, ApiError> {
        let (year, month) = month_of(date);
        self.show_month(year, month).await
    }

    pub fn has_conflict(&self, draft: &AppointmentDraft) -> bool {
        draft.has_conflict(self.events.days())
    }

    pub fn can_commit(&self, draft: &AppointmentDraft) -> bool {
        self.covers(draft) && draft.can_commit(self.events.days())
    }

    fn covers(&self, draft: &AppointmentDraft) -> bool {
        draft
            .date
            .is_some_and(|date| {
                let (year, month) = month_of(date);
                self.events.is_showing(year, month)
            })
    }

    /// Validates the slot, then creates the calendar event. Nothing reaches
    /// the calendar when validation fails.
    #[instrument(skip(self, task, draft), fields(task = %task.id))]
    pub async fn book(
        &mut self,
        task: &Task,
        draft: &AppointmentDraft,
    ) -> Result<CommitOutcome, ValidationError> {
        let (date, start, end) = draft
            .parts()
            .ok_or(ValidationError::IncompleteAppointment)?;

        if !self.covers(draft)
            && let Err(err) = self.show_date(date).await
        {
            warn!(error = %err, "could not load events for the appointment month");
            self.notices.push(Notice::failed("load calendar", &err));
            return Ok(CommitOutcome::Failed(err.to_string()));
        }
        if !draft.can_commit(self.events.days()) {
            return Err(ValidationError::AppointmentConflict);
        }

        let event = self.new_event(task, date, start, end)?;
        match self.calendar.create_event(event).await {
            Ok(()) => {
                info!(%date, %start, %end, "appraisal booked");
                self.events.insert(
                    date,
                    EventSpan {
                        start: date.and_time(start),
                        end: date.and_time(end),
                    },
                );
                self.notices.push(Notice::AppointmentBooked {
                    task: task.id.clone(),
                });
                Ok(CommitOutcome::Committed)
            }
            Err(err) => {
                warn!(error = %err, "booking appraisal failed");
                self.notices.push(Notice::failed("book appraisal", &err));
                Ok(CommitOutcome::Failed(err.to_string()))
            }
        }
    }

    fn new_event(
        &self,
        task: &Task,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<NewEvent, ValidationError> {
        let to_utc = |time: NaiveTime| {
            local_to_utc_in(date.and_time(time), &self.tz, "appraisal")
                .map_err(|err| ValidationError::NonexistentLocalTime(err.to_string()))
        };
        Ok(NewEvent {
            title: format!("Appraisal: {}", task.title),
            start: to_utc(start)?,
            end: to_utc(end)?,
            task_id: task.id.as_str().to_string(),
            applicant_id: task.applicant_id.clone(),
        })
    }
}
