//! HTTP endpoint for one-shot bounded execution.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use swazipen_executor::{
    BatchError, BatchOutcome, BatchRequest, CommandBuildError, RuntimeCommand, ScratchError,
    prepare_run_target, run_bounded,
};
use thiserror::Error;

use crate::AppState;

/// Body of `POST /api/execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default, alias = "source")]
    pub code: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<ScratchError> for ApiError {
    fn from(err: ScratchError) -> Self {
        match err {
            ScratchError::InvalidFilename(_) => Self::BadRequest(err.to_string()),
            ScratchError::Io(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<BatchError> for ApiError {
    fn from(err: BatchError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<CommandBuildError> for ApiError {
    fn from(err: CommandBuildError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Run submitted code to completion or timeout.
///
/// # Errors
/// 400 for a filename outside the project, 500 if the run cannot start.
pub async fn execute_handler(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<BatchOutcome>, ApiError> {
    let ctx = &state.ctx;
    let target = prepare_run_target(ctx, request.filename.as_deref(), &request.code).await?;

    let result = match RuntimeCommand::from_config(&ctx.runtime).build_run(target.path()) {
        Ok(command) => {
            let batch = BatchRequest::new(command, ctx.root())
                .timeout(ctx.runtime.batch_timeout)
                .kill_grace(ctx.runtime.kill_grace)
                .term(ctx.runtime.term.clone());
            run_bounded(batch).await.map_err(ApiError::from)
        }
        Err(e) => Err(e.into()),
    };

    if let Some(scratch) = target.into_scratch() {
        let path = scratch.path().to_path_buf();
        if let Err(error) = scratch.remove().await {
            tracing::warn!(path = %path.display(), %error, "Failed to remove scratch file");
        }
    }

    let outcome = result?;
    tracing::info!(exit_code = ?outcome.exit_code, timed_out = outcome.timed_out, "Execute finished");
    Ok(Json(outcome))
}
