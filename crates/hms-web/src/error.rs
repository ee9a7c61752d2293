//! 错误到HTTP响应的映射

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hms_core::HmsError;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{error, warn};

/// 接口错误，包装统一错误类型以实现 `IntoResponse`
#[derive(Debug)]
pub struct ApiError(pub HmsError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<HmsError> for ApiError {
    fn from(err: HmsError) -> Self {
        Self(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self(HmsError::Serialization(err))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            HmsError::Validation(_) => StatusCode::BAD_REQUEST,
            HmsError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HmsError::Forbidden(_) => StatusCode::FORBIDDEN,
            HmsError::NotFound(_) => StatusCode::NOT_FOUND,
            HmsError::Conflict(_) | HmsError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            HmsError::Gateway(_) => StatusCode::BAD_GATEWAY,
            HmsError::Config(_)
            | HmsError::Database(_)
            | HmsError::Network(_)
            | HmsError::Serialization(_)
            | HmsError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 返回给客户端的消息
    ///
    /// 内部错误和网关原文只写日志。
    fn public_message(&self) -> String {
        match &self.0 {
            HmsError::Validation(msg)
            | HmsError::Unauthorized(msg)
            | HmsError::Forbidden(msg)
            | HmsError::NotFound(msg)
            | HmsError::Conflict(msg) => msg.clone(),
            HmsError::InvalidStateTransition { from, event } => {
                format!("event {} is not allowed in state {}", event, from)
            }
            HmsError::Gateway(_) => "payment gateway request failed".to_string(),
            _ => "internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed with {}: {}", status, self.0);
        } else {
            warn!("Request rejected with {}: {}", status, self.0);
        }

        let body = Json(json!({
            "error": true,
            "message": self.public_message(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

/// JSON请求体提取器，解析失败时返回统一错误格式
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(rejection_to_error(rejection)),
        }
    }
}

fn rejection_to_error(rejection: JsonRejection) -> ApiError {
    ApiError(HmsError::Validation(format!("invalid request body: {}", rejection.body_text())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn render(err: HmsError) -> (StatusCode, serde_json::Value) {
        let response = ApiError(err).into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_status_mapping_and_body_shape() {
        let (status, body) = render(HmsError::Conflict("overpayment".to_string())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], true);
        assert_eq!(body["message"], "overpayment");
        assert_eq!(body["status"], 409);

        let (status, _) = render(HmsError::InvalidStateTransition {
            from: "reception".to_string(),
            event: "complete_billing".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = render(HmsError::Unauthorized("missing token".to_string())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let (status, body) = render(HmsError::Database("disk I/O error at page 7".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "internal server error");

        let (status, body) = render(HmsError::Gateway("zenopay: invalid api key abc123".to_string())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(!body["message"].as_str().unwrap().contains("abc123"));
    }
}
