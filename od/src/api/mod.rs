//! Request surface
//!
//! [`ApiHandler`] maps a transport-neutral request onto orchestrator and
//! state calls and produces a status plus JSON body. The axum binding lives
//! in [`server`].

pub mod server;

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use taskstore::{RequestOptions, StoreError};
use tracing::{debug, error, info};

use crate::error::OnboardError;
use crate::orchestrator::Orchestrator;
use crate::state::StateError;
use crate::view::TaskView;

/// Header naming the origin of a request; `peer` marks a delegated request
pub const ORIGIN_HEADER: &str = "x-onboard-origin";
pub const ORIGIN_PEER: &str = "peer";
pub const CORRELATION_HEADER: &str = "x-correlation-id";
/// Query parameter selecting how task results map onto HTTP status
pub const STATUS_CODES_PARAM: &str = "statusCodes";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

impl RestResponse {
    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "code": status, "message": message.into() }),
        }
    }
}

/// How task responses pick their HTTP status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusCodeMode {
    /// HTTP status mirrors the task result code
    #[default]
    Legacy,
    /// Always 200; the result code lives in the body only
    Experimental,
}

impl StatusCodeMode {
    pub fn from_query(query: &BTreeMap<String, String>) -> Self {
        match query.get(STATUS_CODES_PARAM).map(String::as_str) {
            Some("experimental") => Self::Experimental,
            _ => Self::Legacy,
        }
    }

    fn status_for(&self, view: &TaskView) -> u16 {
        match self {
            Self::Legacy => view.http_code(),
            Self::Experimental => 200,
        }
    }
}

enum Route<'a> {
    Submit,
    MostRecent,
    Tasks,
    Task(&'a str),
    Configs,
    Config(&'a str),
    DeleteConfigs,
    DeleteConfig(&'a str),
    Unknown,
}

pub struct ApiHandler {
    orchestrator: Arc<Orchestrator>,
    base_path: String,
}

impl ApiHandler {
    pub fn new(orchestrator: Arc<Orchestrator>, base_path: impl Into<String>) -> Self {
        let base_path = base_path.into();
        let base_path = format!("/{}", base_path.trim_matches('/'));
        Self {
            orchestrator,
            base_path,
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub async fn handle(&self, req: RestRequest) -> RestResponse {
        debug!(method = %req.method, path = %req.path, "ApiHandler::handle: called");
        let mode = StatusCodeMode::from_query(&req.query);

        let result = match self.route(&req.method, &req.path) {
            Route::Submit => self.submit(&req, mode).await,
            Route::MostRecent => self.most_recent(mode).await,
            Route::Tasks => self.tasks().await,
            Route::Task(id) => self.task(id, mode).await,
            Route::Configs => self.configs().await,
            Route::Config(id) => self.config(id).await,
            Route::DeleteConfigs => Ok(RestResponse::error(400, "a configuration id is required")),
            Route::DeleteConfig(id) => self.delete_config(id).await,
            Route::Unknown => Ok(RestResponse::error(400, format!("unsupported request: {} {}", req.method, req.path))),
        };

        result.unwrap_or_else(|e| {
            error!(error = %e, "Request failed");
            RestResponse::error(500, e.to_string())
        })
    }

    fn route<'a>(&self, method: &str, path: &'a str) -> Route<'a> {
        let Some(rest) = path.strip_prefix(self.base_path.as_str()) else {
            return Route::Unknown;
        };
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        match (method, segments.as_slice()) {
            ("POST", []) => Route::Submit,
            ("GET", []) => Route::MostRecent,
            ("GET", ["task"]) => Route::Tasks,
            ("GET", ["task", id]) => Route::Task(id),
            ("GET", ["config"]) => Route::Configs,
            ("GET", ["config", id]) => Route::Config(id),
            ("DELETE", ["config"]) => Route::DeleteConfigs,
            ("DELETE", ["config", id]) => Route::DeleteConfig(id),
            _ => Route::Unknown,
        }
    }

    async fn submit(&self, req: &RestRequest, mode: StatusCodeMode) -> Result<RestResponse, OnboardError> {
        let options = RequestOptions {
            method: req.method.clone(),
            query: req.query.clone(),
            from_peer: req.headers.get(ORIGIN_HEADER).is_some_and(|o| o == ORIGIN_PEER),
            correlation_id: req.headers.get(CORRELATION_HEADER).cloned(),
        };
        let view = self.orchestrator.submit(&req.body, options).await?;
        info!(task_id = %view.id, code = ?view.result.code, "Responding to submit");
        task_response(&view, mode)
    }

    async fn most_recent(&self, mode: StatusCodeMode) -> Result<RestResponse, OnboardError> {
        match self.orchestrator.state().most_recent_task().await? {
            Some(task) => task_response(&TaskView::from(&task), mode),
            None => Ok(RestResponse::error(404, "no task has been submitted")),
        }
    }

    async fn tasks(&self) -> Result<RestResponse, OnboardError> {
        let views: Vec<TaskView> = self
            .orchestrator
            .state()
            .list_tasks()
            .await?
            .iter()
            .map(TaskView::from)
            .collect();
        Ok(RestResponse {
            status: 200,
            body: to_json(&views),
        })
    }

    async fn task(&self, id: &str, mode: StatusCodeMode) -> Result<RestResponse, OnboardError> {
        match self.orchestrator.state().get_task(id).await {
            Ok(task) => task_response(&TaskView::from(&task), mode),
            Err(StateError::Store(StoreError::TaskNotFound(_))) => {
                Ok(RestResponse::error(404, format!("task {} not found", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn configs(&self) -> Result<RestResponse, OnboardError> {
        let configs: Vec<Value> = self
            .orchestrator
            .state()
            .list_original_configs()
            .await?
            .into_iter()
            .map(|(id, config)| json!({ "id": id, "originalConfig": config }))
            .collect();
        Ok(RestResponse {
            status: 200,
            body: Value::Array(configs),
        })
    }

    async fn config(&self, id: &str) -> Result<RestResponse, OnboardError> {
        match self.orchestrator.state().get_original_config(id).await? {
            Some(config) => Ok(RestResponse {
                status: 200,
                body: json!({ "id": id, "originalConfig": config }),
            }),
            None => Ok(RestResponse::error(404, format!("configuration {} not found", id))),
        }
    }

    async fn delete_config(&self, id: &str) -> Result<RestResponse, OnboardError> {
        let state = self.orchestrator.state();
        if !state.delete_original_config(id).await? {
            return Ok(RestResponse::error(404, format!("configuration {} not found", id)));
        }
        state.persist().await?;
        info!(config_id = %id, "Deleted original configuration");
        Ok(RestResponse {
            status: 200,
            body: json!({ "id": id }),
        })
    }
}

fn task_response(view: &TaskView, mode: StatusCodeMode) -> Result<RestResponse, OnboardError> {
    Ok(RestResponse {
        status: mode.status_for(view),
        body: to_json(view),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        error!(error = %e, "Failed to serialize response body");
        Value::Null
    })
}
