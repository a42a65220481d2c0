//! REST adapter for the task service.

use std::borrow::Cow;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::api::{
    ApiError, CalendarApi, ClaimAllResponse, ClaimApi, DateRange, PatchAction, PatchPayload,
    StaffApi, StatusApi, TaskSource,
};
use crate::interval::{CalendarEvent, NewEvent};
use crate::task::{RawBuckets, StaffMember, TaskBuckets, TaskId};

const REQUEST_ID_HEADER: &str = "x-request-id";
const ACTOR_HEADER: &str = "x-roster-actor";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatchBody<'a> {
    action: PatchAction,
    #[serde(flatten)]
    payload: &'a PatchPayload,
}

#[derive(Debug, Serialize)]
struct ClaimAllBody<'a> {
    group: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration, actor: Option<&str>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(actor) = actor.map(str::trim).filter(|actor| !actor.is_empty()) {
            let value = HeaderValue::from_str(actor)
                .with_context(|| format!("actor {actor:?} is not a valid header value"))?;
            headers.insert(ACTOR_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed building HTTP client for the task service")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<String, ApiError>
    where
        B: Serialize + ?Sized,
    {
        let request_id = Uuid::new_v4();
        let url = self.url(path);
        debug!(%method, %url, %request_id, "sending request");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(REQUEST_ID_HEADER, request_id.to_string());
        if let Some(body) = body {
            let bytes =
                serde_json::to_vec(body).map_err(|err| ApiError::Decode(err.to_string()))?;
            request = request.header(CONTENT_TYPE, "application/json").body(bytes);
        }

        let response = request.send().await.map_err(|err| {
            warn!(%method, %url, %request_id, error = %err, "request failed");
            ApiError::Network(err.to_string())
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;

        if status.is_success() {
            Ok(text)
        } else {
            warn!(%method, %url, %request_id, status = status.as_u16(), "request rejected");
            Err(status_error(status, &text))
        }
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let text = self.send::<()>(Method::GET, path, None).await?;
        decode(&text)
    }
}

fn decode<T>(text: &str) -> Result<T, ApiError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(text).map_err(|err| ApiError::Decode(err.to_string()))
}

/// Maps a non-success response to an error; 409 is a lost claim race.
fn status_error(status: StatusCode, body: &str) -> ApiError {
    let message = server_message(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    });
    if status == StatusCode::CONFLICT {
        ApiError::Conflict { message }
    } else {
        ApiError::Status {
            status: status.as_u16(),
            message,
        }
    }
}

fn server_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(message) = value.get(key).and_then(|v| v.as_str()) {
                return Some(message.to_string());
            }
        }
    }
    Some(body.to_string())
}

fn path_segment(raw: &str) -> Cow<'_, str> {
    urlencoding::encode(raw)
}

impl TaskSource for HttpBackend {
    #[instrument(skip(self))]
    async fn fetch_tasks(&self) -> Result<TaskBuckets, ApiError> {
        let raw: RawBuckets = self.get_json("/tasks").await?;
        Ok(raw.into_buckets())
    }
}

impl ClaimApi for HttpBackend {
    #[instrument(skip(self), fields(task = %id))]
    async fn claim(&self, id: &TaskId) -> Result<(), ApiError> {
        let path = format!("/tasks/{}/claim", path_segment(id.as_str()));
        self.send::<()>(Method::POST, &path, None).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_all(&self, group: &str) -> Result<ClaimAllResponse, ApiError> {
        let text = self
            .send(Method::POST, "/tasks/claim-all", Some(&ClaimAllBody { group }))
            .await?;
        if text.trim().is_empty() {
            return Ok(ClaimAllResponse::default());
        }
        decode(&text)
    }
}

impl StatusApi for HttpBackend {
    #[instrument(skip_all, fields(task = %id, action = %action))]
    async fn patch(
        &self,
        id: &TaskId,
        action: PatchAction,
        payload: PatchPayload,
    ) -> Result<(), ApiError> {
        let path = format!("/tasks/{}", path_segment(id.as_str()));
        let body = PatchBody {
            action,
            payload: &payload,
        };
        self.send(Method::PATCH, &path, Some(&body)).await?;
        Ok(())
    }
}

impl CalendarApi for HttpBackend {
    #[instrument(skip(self), fields(start = %range.start, end = %range.end))]
    async fn fetch_events(&self, range: DateRange) -> Result<Vec<CalendarEvent>, ApiError> {
        let start = range.start.format("%Y-%m-%d").to_string();
        let end = range.end.format("%Y-%m-%d").to_string();
        let path = format!(
            "/calendar/events?start={}&end={}",
            urlencoding::encode(&start),
            urlencoding::encode(&end)
        );
        self.get_json(&path).await
    }

    #[instrument(skip(self, event), fields(task = %event.task_id))]
    async fn create_event(&self, event: NewEvent) -> Result<(), ApiError> {
        self.send(Method::POST, "/calendar/events", Some(&event))
            .await?;
        Ok(())
    }
}

impl StaffApi for HttpBackend {
    #[instrument(skip(self))]
    async fn fetch_staff(&self) -> Result<Vec<StaffMember>, ApiError> {
        self.get_json("/staff").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_status_maps_to_conflict_variant() {
        let err = status_error(StatusCode::CONFLICT, r#"{"message":"held by s-2"}"#);
        assert_eq!(
            err,
            ApiError::Conflict {
                message: "held by s-2".to_string()
            }
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn other_statuses_keep_code_and_message() {
        let err = status_error(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert_eq!(
            err,
            ApiError::Status {
                status: 500,
                message: "Internal Server Error".to_string()
            }
        );

        let err = status_error(StatusCode::BAD_REQUEST, "reason required");
        assert_eq!(
            err,
            ApiError::Status {
                status: 400,
                message: "reason required".to_string()
            }
        );
    }

    #[test]
    fn patch_body_flattens_payload_next_to_action() {
        let payload = PatchPayload::note("called back");
        let body = PatchBody {
            action: PatchAction::ResolveFlag,
            payload: &payload,
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"action": "resolveFlag", "note": "called back"})
        );
    }

    #[test]
    fn ids_are_escaped_in_paths() {
        assert_eq!(path_segment("42"), "42");
        assert_eq!(path_segment("a/b c"), "a%2Fb%20c");
        assert_eq!(path_segment("a&b=c"), "a%26b%3Dc");
        assert_eq!(path_segment("é"), "%C3%A9");
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        let backend = HttpBackend::new("http://localhost:8080/api/", Duration::from_secs(5), None)
            .expect("client");
        assert_eq!(backend.url("/tasks"), "http://localhost:8080/api/tasks");
    }
}
