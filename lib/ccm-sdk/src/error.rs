use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use ccm_api::{ApiError, ApiResult};
use std::error::Error;
use std::fmt::Debug;

/// Converts SDK failures into `ApiError`, keeping the platform error code
pub(crate) trait SdkResultExt<T> {
    fn api(self, operation: &str) -> ApiResult<T>;
}

impl<T, E, R> SdkResultExt<T> for Result<T, SdkError<E, R>>
where
    E: ProvideErrorMetadata + Error + 'static,
    R: Debug,
{
    fn api(self, operation: &str) -> ApiResult<T> {
        self.map_err(|err| api_error(operation, &err))
    }
}

pub(crate) fn api_error<E, R>(operation: &str, err: &SdkError<E, R>) -> ApiError
where
    E: ProvideErrorMetadata + Error + 'static,
    R: Debug,
{
    let message = match err.message() {
        Some(message) => message.to_string(),
        None => DisplayErrorContext(err).to_string(),
    };
    ApiError::new(operation, err.code(), message)
}

/// Request shapes with missing required members
pub(crate) fn build_error(operation: &str, err: impl std::fmt::Display) -> ApiError {
    ApiError::invalid_request(operation, err.to_string())
}
