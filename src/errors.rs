//! Caller-facing errors.
//!
//! Every failure the relay can hit while serving a request maps onto one of these variants, each
//! with its own status code and a short machine-readable reason. None of them is fatal to the
//! process.
use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("model '{0}' is not allowed")]
    InvalidModel(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream returned {status}: {message}")]
    UpstreamError { status: StatusCode, message: String },

    #[error("timed out waiting for upstream")]
    UpstreamTimeout,

    #[error("malformed upstream output: {0}")]
    MalformedUpstreamOutput(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            RelayError::InvalidModel(_) => StatusCode::NOT_FOUND,
            RelayError::UpstreamUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            RelayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::MalformedUpstreamOutput(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            RelayError::InvalidParameter(_) => "invalid_parameter",
            RelayError::InvalidModel(_) => "invalid_model",
            RelayError::UpstreamUnreachable(_) => "upstream_unreachable",
            RelayError::UpstreamError { .. } => "upstream_error",
            RelayError::UpstreamTimeout => "upstream_timeout",
            RelayError::MalformedUpstreamOutput(_) => "malformed_upstream_output",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(%status, reason = self.reason(), "Returning error: {}", self);

        let body = Json(json!({
            "error": {
                "reason": self.reason(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

impl From<QueryRejection> for RelayError {
    fn from(rejection: QueryRejection) -> Self {
        RelayError::InvalidParameter(rejection.body_text())
    }
}

impl From<JsonRejection> for RelayError {
    fn from(rejection: JsonRejection) -> Self {
        RelayError::InvalidParameter(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RelayError::InvalidParameter("top_p".into()), 400, "invalid_parameter")]
    #[case(RelayError::InvalidModel("gpt-4".into()), 404, "invalid_model")]
    #[case(RelayError::UpstreamUnreachable("refused".into()), 503, "upstream_unreachable")]
    #[case(
        RelayError::UpstreamError { status: StatusCode::INTERNAL_SERVER_ERROR, message: "boom".into() },
        502,
        "upstream_error"
    )]
    #[case(RelayError::UpstreamTimeout, 504, "upstream_timeout")]
    #[case(
        RelayError::MalformedUpstreamOutput("not json".into()),
        500,
        "malformed_upstream_output"
    )]
    #[tokio::test]
    async fn test_error_maps_to_status_and_reason(
        #[case] error: RelayError,
        #[case] status: u16,
        #[case] reason: &str,
    ) {
        let message = error.to_string();
        let response = error.into_response();
        assert_eq!(response.status().as_u16(), status);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["reason"], reason);
        assert_eq!(body["error"]["message"], message);
    }
}
