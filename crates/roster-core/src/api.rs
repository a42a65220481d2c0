//! Contracts for the services the controller talks to.

use std::fmt;
use std::future::Future;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interval::{CalendarEvent, NewEvent};
use crate::normalize::TrackedFields;
use crate::task::{StaffMember, TaskBuckets, TaskId};

/// Failure reported by a collaborator. A lost claim race is its own
/// variant so no caller has to inspect status codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("already claimed by someone else: {message}")]
    Conflict { message: String },

    #[error("request rejected with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("network failure: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchAction {
    Complete,
    Unclaim,
    Flag,
    ResolveFlag,
    ResolveAndComplete,
    Edit,
}

impl PatchAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchAction::Complete => "complete",
            PatchAction::Unclaim => "unclaim",
            PatchAction::Flag => "flag",
            PatchAction::ResolveFlag => "resolveFlag",
            PatchAction::ResolveAndComplete => "resolveAndComplete",
            PatchAction::Edit => "edit",
        }
    }
}

impl fmt::Display for PatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<TrackedFields>,
}

impl PatchPayload {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::default()
        }
    }

    pub fn edit(fields: TrackedFields) -> Self {
        Self {
            fields: Some(fields),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimAllResponse {
    #[serde(default)]
    pub claimed: Vec<TaskId>,
    #[serde(default)]
    pub already_claimed: Vec<TaskId>,
}

/// Half-open range of local dates `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

pub trait TaskSource {
    /// Idempotent; called on mount and after every commit or rollback.
    fn fetch_tasks(&self) -> impl Future<Output = Result<TaskBuckets, ApiError>> + Send;
}

pub trait ClaimApi {
    fn claim(&self, id: &TaskId) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn claim_all(
        &self,
        group: &str,
    ) -> impl Future<Output = Result<ClaimAllResponse, ApiError>> + Send;
}

pub trait StatusApi {
    fn patch(
        &self,
        id: &TaskId,
        action: PatchAction,
        payload: PatchPayload,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

pub trait CalendarApi {
    fn fetch_events(
        &self,
        range: DateRange,
    ) -> impl Future<Output = Result<Vec<CalendarEvent>, ApiError>> + Send;

    fn create_event(&self, event: NewEvent) -> impl Future<Output = Result<(), ApiError>> + Send;
}

pub trait StaffApi {
    fn fetch_staff(&self) -> impl Future<Output = Result<Vec<StaffMember>, ApiError>> + Send;
}

/// Everything the task controller needs from the backend.
pub trait TaskBackend: TaskSource + ClaimApi + StatusApi + Send + Sync + 'static {}

impl<T> TaskBackend for T where T: TaskSource + ClaimApi + StatusApi + Send + Sync + 'static {}
