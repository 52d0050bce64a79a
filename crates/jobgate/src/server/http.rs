use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::io::ReaderStream;

use crate::common::error::GatewayError;
use crate::server::dispatcher::{Dispatcher, StatusReport, SubmitRequest};
use crate::server::job::OutputKind;

pub type DispatcherRef = Arc<Dispatcher>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        log::debug!("Request failed: {} {}", self.code(), self.message());
        let body = ErrorBody {
            code: self.code(),
            message: self.message(),
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for StatusReport {
    fn into_response(self) -> Response {
        match self {
            StatusReport::Text(text) => {
                ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response()
            }
            StatusReport::Json(json) => {
                ([(header::CONTENT_TYPE, "application/json")], json).into_response()
            }
        }
    }
}

/// Request parameters gathered from the query string and a urlencoded body. Keys may repeat.
#[derive(Debug, Default)]
struct Params(Vec<(String, String)>);

impl Params {
    fn parse(query: Option<&str>, body: &[u8]) -> Self {
        let mut pairs: Vec<(String, String)> = query
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        pairs.extend(form_urlencoded::parse(body).into_owned());
        Params(pairs)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn all(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
            .collect()
    }

    fn session_id(&self) -> Option<&str> {
        self.get("sessionId")
    }

    fn submit_request(&self) -> crate::Result<SubmitRequest> {
        let interactive = match self.get("interactive") {
            None | Some("") => false,
            Some(value) if value.eq_ignore_ascii_case("true") => true,
            Some(value) if value.eq_ignore_ascii_case("false") => false,
            Some(value) => {
                return Err(GatewayError::ParameterError(format!(
                    "Invalid value {value:?} for interactive"
                )));
            }
        };
        Ok(SubmitRequest {
            executable: self.get("executable").unwrap_or_default().to_string(),
            parameters: self.all("parameter"),
            family: self.get("family").map(|f| f.to_string()),
            interactive,
        })
    }
}

pub fn create_router(dispatcher: DispatcherRef) -> Router {
    Router::new()
        .route("/submit", post(submit))
        .route("/estimate", get(estimate))
        .route("/cancel/:job_id", post(cancel))
        .route("/delete/:job_id", delete(delete_job))
        .route("/status", get(list))
        .route("/status/:job_id", get(status))
        .route("/output/:job_id", get(output))
        .route("/error/:job_id", get(error_output))
        .with_state(dispatcher)
}

async fn submit(
    State(dispatcher): State<DispatcherRef>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<String, GatewayError> {
    let params = Params::parse(query.as_deref(), &body);
    let request = params.submit_request()?;
    dispatcher.submit(params.session_id(), &request).await
}

async fn estimate(
    State(dispatcher): State<DispatcherRef>,
    RawQuery(query): RawQuery,
) -> Result<String, GatewayError> {
    let params = Params::parse(query.as_deref(), &[]);
    let request = params.submit_request()?;
    let minutes = dispatcher.estimate(params.session_id(), &request).await?;
    Ok(minutes.to_string())
}

async fn cancel(
    State(dispatcher): State<DispatcherRef>,
    Path(job_id): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<StatusCode, GatewayError> {
    let params = Params::parse(query.as_deref(), &body);
    dispatcher.cancel(params.session_id(), &job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_job(
    State(dispatcher): State<DispatcherRef>,
    Path(job_id): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<StatusCode, GatewayError> {
    let params = Params::parse(query.as_deref(), &[]);
    dispatcher.delete(params.session_id(), &job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list(
    State(dispatcher): State<DispatcherRef>,
    RawQuery(query): RawQuery,
) -> Result<StatusReport, GatewayError> {
    let params = Params::parse(query.as_deref(), &[]);
    dispatcher.list(params.session_id()).await
}

async fn status(
    State(dispatcher): State<DispatcherRef>,
    Path(job_id): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<StatusReport, GatewayError> {
    let params = Params::parse(query.as_deref(), &[]);
    dispatcher.status(params.session_id(), &job_id).await
}

async fn stream_output(
    dispatcher: &Dispatcher,
    query: Option<String>,
    job_id: &str,
    kind: OutputKind,
) -> Result<Response, GatewayError> {
    let params = Params::parse(query.as_deref(), &[]);
    let file = dispatcher.output(params.session_id(), job_id, kind).await?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

async fn output(
    State(dispatcher): State<DispatcherRef>,
    Path(job_id): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, GatewayError> {
    stream_output(&dispatcher, query, &job_id, OutputKind::Output).await
}

async fn error_output(
    State(dispatcher): State<DispatcherRef>,
    Path(job_id): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, GatewayError> {
    stream_output(&dispatcher, query, &job_id, OutputKind::Error).await
}
