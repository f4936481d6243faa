// Copyright 2020 Palantir Technologies, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Error types.
use crate::request::RequestParams;
use crate::response::Response;
use crate::timing::Timings;
use std::error;
use std::fmt;
use std::sync::Arc;

/// A type-erased error.
pub type BoxError = Box<dyn error::Error + Sync + Send>;

/// The kind of a failed request attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FailureKind {
    /// The transport failed to deliver the request or the response.
    Network,
    /// The transport did not connect within the connection timeout.
    ConnectionTimeout,
    /// No bytes were received within the read timeout.
    ReadTimeout,
    /// A per-attempt or global deadline elapsed.
    UserTimeout,
    /// The streaming request body failed while being written.
    BodyStream,
}

impl FailureKind {
    /// Returns the discriminator name of the failure kind.
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::Network => "NETWORK",
            FailureKind::ConnectionTimeout => "CONNECTION_TIMEOUT",
            FailureKind::ReadTimeout => "READ_TIMEOUT",
            FailureKind::UserTimeout => "USER_TIMEOUT",
            FailureKind::BodyStream => "BODY_STREAM",
        }
    }
}

/// The kind of an error surfaced to callers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The response body could not be parsed as JSON.
    BodyParseFailed,
    /// The HTTP attempt itself failed.
    RequestFailed(FailureKind),
    /// A request filter rejected the request.
    RequestFilterFailed,
    /// A response filter rejected the response.
    ResponseFilterFailed,
    /// The circuit breaker is open and the request was not attempted.
    CircuitOpen,
    /// The retry policy rejected a failed attempt.
    ShouldRetryRejected,
    /// The retry schedule was exhausted without a successful attempt.
    MaxRetriesReached,
    /// A bug or misconfiguration in the client itself.
    Internal,
}

impl ErrorKind {
    /// Returns the discriminator name of the error kind.
    ///
    /// Request failures report their specific failure kind rather than the
    /// family name.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BodyParseFailed => "BODY_PARSE_FAILED",
            ErrorKind::RequestFailed(kind) => kind.name(),
            ErrorKind::RequestFilterFailed => "REQUEST_FILTER_FAILED",
            ErrorKind::ResponseFilterFailed => "RESPONSE_FILTER_FAILED",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::ShouldRetryRejected => "SHOULD_RETRY_REJECTED",
            ErrorKind::MaxRetriesReached => "MAX_RETRIES_REACHED",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Returns true if the kind is any of the `REQUEST_FAILED` family.
    pub fn is_request_failed(&self) -> bool {
        matches!(self, ErrorKind::RequestFailed(_))
    }
}

/// The error type returned by clients.
///
/// Every error carries its kind and a message prefixed with the client's name,
/// and, where available, the original cause, the request parameters, the
/// response being processed, the attempt's timings, and the errors of earlier
/// attempts of the same call.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: ErrorKind,
    message: String,
    cause: Option<BoxError>,
    params: Option<Arc<RequestParams>>,
    response: Option<Response>,
    timings: Option<Timings>,
    retry_errors: Vec<Error>,
}

impl Error {
    fn build(client: &str, kind: ErrorKind, cause: Option<BoxError>) -> Error {
        let message = match &cause {
            Some(cause) => format!("{}: {}. {}", client, kind.name(), cause),
            None => format!("{}: {}.", client, kind.name()),
        };

        Error {
            inner: Box::new(Inner {
                kind,
                message: message.trim_end().to_string(),
                cause,
                params: None,
                response: None,
                timings: None,
                retry_errors: vec![],
            }),
        }
    }

    pub(crate) fn network(client: &str, cause: BoxError) -> Error {
        Error::build(
            client,
            ErrorKind::RequestFailed(FailureKind::Network),
            Some(cause),
        )
    }

    pub(crate) fn connection_timeout(client: &str, cause: BoxError) -> Error {
        Error::build(
            client,
            ErrorKind::RequestFailed(FailureKind::ConnectionTimeout),
            Some(cause),
        )
    }

    pub(crate) fn read_timeout(client: &str, cause: BoxError) -> Error {
        Error::build(
            client,
            ErrorKind::RequestFailed(FailureKind::ReadTimeout),
            Some(cause),
        )
    }

    pub(crate) fn user_timeout(client: &str) -> Error {
        Error::build(
            client,
            ErrorKind::RequestFailed(FailureKind::UserTimeout),
            None,
        )
    }

    pub(crate) fn body_stream(client: &str, cause: BoxError) -> Error {
        Error::build(
            client,
            ErrorKind::RequestFailed(FailureKind::BodyStream),
            Some(cause),
        )
    }

    pub(crate) fn circuit_open(client: &str) -> Error {
        Error::build(client, ErrorKind::CircuitOpen, None)
    }

    pub(crate) fn request_filter_failed(client: &str, cause: BoxError) -> Error {
        Error::build(client, ErrorKind::RequestFilterFailed, Some(cause))
    }

    pub(crate) fn response_filter_failed(
        client: &str,
        cause: BoxError,
        response: Response,
    ) -> Error {
        let mut error = Error::build(client, ErrorKind::ResponseFilterFailed, Some(cause));
        error.inner.timings = response.timings();
        error.inner.params = response.params_arc();
        error.inner.response = Some(response);
        error
    }

    pub(crate) fn body_parse_failed(client: &str, cause: BoxError, response: Response) -> Error {
        let mut error = Error::build(client, ErrorKind::BodyParseFailed, Some(cause));
        error.inner.timings = response.timings();
        error.inner.params = response.params_arc();
        error.inner.response = Some(response);
        error
    }

    pub(crate) fn should_retry_rejected(client: &str, latest: Error, prior: Vec<Error>) -> Error {
        let mut error = Error::build(client, ErrorKind::ShouldRetryRejected, Some(Box::new(latest)));
        error.inner.retry_errors = prior;
        error
    }

    pub(crate) fn max_retries_reached(client: &str, latest: Error, prior: Vec<Error>) -> Error {
        let mut error = Error::build(client, ErrorKind::MaxRetriesReached, Some(Box::new(latest)));
        error.inner.retry_errors = prior;
        error
    }

    pub(crate) fn internal(client: &str, cause: BoxError) -> Error {
        Error::build(client, ErrorKind::Internal, Some(cause))
    }

    pub(crate) fn set_params(&mut self, params: Arc<RequestParams>) {
        self.inner.params.get_or_insert(params);
    }

    pub(crate) fn set_timings(&mut self, timings: Option<Timings>) {
        if self.inner.timings.is_none() {
            self.inner.timings = timings;
        }
    }

    pub(crate) fn set_retry_errors(&mut self, retry_errors: Vec<Error>) {
        self.inner.retry_errors = retry_errors;
    }

    /// Returns the error's kind.
    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    /// Returns the error's original cause, if there is one.
    pub fn cause(&self) -> Option<&(dyn error::Error + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|e| &**e as &(dyn error::Error + 'static))
    }

    /// Returns the request parameters of the attempt that produced the error.
    pub fn params(&self) -> Option<&RequestParams> {
        self.inner.params.as_deref()
    }

    /// Returns the response that was being processed when the error occurred.
    pub fn response(&self) -> Option<&Response> {
        self.inner.response.as_ref()
    }

    /// Returns the timings of the attempt that produced the error.
    pub fn timings(&self) -> Option<Timings> {
        self.inner.timings
    }

    /// Returns the errors of the earlier attempts of the call, oldest first.
    pub fn retry_errors(&self) -> &[Error] {
        &self.inner.retry_errors
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.inner.message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Error")
            .field("kind", &self.inner.kind)
            .field("message", &self.inner.message)
            .field("retry_errors", &self.inner.retry_errors)
            .finish()
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause()
    }
}
