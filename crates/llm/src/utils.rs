use crate::ApiError;
use reqwest::{Response, StatusCode};
use tracing::warn;

/// Check the backend response status before streaming its body.
/// Returns Ok(Response) if successful, or the categorized error with the response text.
pub async fn check_response_error(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let response_text = response
        .text()
        .await
        .map_err(|e| ApiError::NetworkError(e.to_string()))?;
    warn!("Backend request failed: Status {}, Error: {}", status, response_text);

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit(response_text),
        StatusCode::UNAUTHORIZED => ApiError::Authentication(response_text),
        StatusCode::BAD_REQUEST => ApiError::InvalidRequest(response_text),
        StatusCode::SERVICE_UNAVAILABLE => ApiError::Overloaded(response_text),
        status if status.is_server_error() => ApiError::ServiceError(response_text),
        _ => ApiError::Unknown(format!("Status {status}: {response_text}")),
    };

    Err(error)
}
