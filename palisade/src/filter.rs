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
//! Request and response filters.
//!
//! Filters form an ordered pipeline around every attempt: request transforms
//! run in declared order before the HTTP attempt, response transforms unwind
//! in reverse declared order after it. A request transform may short-circuit
//! the attempt entirely by producing a [`Response`] of its own; the response
//! then unwinds through the response transforms exactly as an upstream
//! response would.
use crate::errors::{BoxError, Error};
use crate::request::RequestParams;
use crate::response::Response;
use async_trait::async_trait;
use http::StatusCode;
use std::future::Future;
use std::sync::Arc;
use std::{error, fmt};

/// A filter transforming requests and responses.
///
/// Both transforms default to no-ops, so a filter implements whichever side
/// it cares about.
#[async_trait]
pub trait Filter: Sync + Send {
    /// Transforms the request parameters before the attempt.
    ///
    /// Returning `Ok(Some(response))` short-circuits the call: the HTTP
    /// attempt and the remaining request transforms are skipped and the
    /// returned response unwinds through the response transforms. An error is
    /// surfaced as `REQUEST_FILTER_FAILED`.
    async fn request(&self, params: &mut RequestParams) -> Result<Option<Response>, BoxError> {
        let _ = params;
        Ok(None)
    }

    /// Transforms the response after the attempt.
    ///
    /// An error is surfaced as `RESPONSE_FILTER_FAILED` carrying the response
    /// that was being unwound.
    async fn response(&self, response: &mut Response) -> Result<(), BoxError> {
        let _ = response;
        Ok(())
    }
}

/// The error produced by the built-in status filters.
#[derive(Debug)]
pub struct StatusError {
    status: StatusCode,
}

impl StatusError {
    /// Returns the status that was classified as a failure.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "server responded with status {}", self.status)
    }
}

impl error::Error for StatusError {}

/// The built-in response filter treating statuses of 500 and above as
/// failures.
///
/// This filter is pre-installed on every client.
pub struct ServerErrorFilter;

#[async_trait]
impl Filter for ServerErrorFilter {
    async fn response(&self, response: &mut Response) -> Result<(), BoxError> {
        if response.status().as_u16() >= 500 {
            return Err(Box::new(StatusError {
                status: response.status(),
            }));
        }
        Ok(())
    }
}

/// A response filter treating statuses of 400 and above as failures.
///
/// Not installed by default.
pub struct ClientErrorFilter;

#[async_trait]
impl Filter for ClientErrorFilter {
    async fn response(&self, response: &mut Response) -> Result<(), BoxError> {
        if response.status().as_u16() >= 400 {
            return Err(Box::new(StatusError {
                status: response.status(),
            }));
        }
        Ok(())
    }
}

pub(crate) async fn execute<F, Fut>(
    client: &str,
    filters: &[Arc<dyn Filter>],
    mut params: RequestParams,
    attempt: F,
) -> Result<Response, Error>
where
    F: FnOnce(RequestParams) -> Fut,
    Fut: Future<Output = Result<Response, Error>>,
{
    let mut short_circuit = None;
    for filter in filters {
        match filter.request(&mut params).await {
            Ok(None) => {}
            Ok(Some(response)) => {
                short_circuit = Some(response);
                break;
            }
            Err(e) => {
                let mut error = Error::request_filter_failed(client, e);
                error.set_params(Arc::new(params));
                return Err(error);
            }
        }
    }

    let mut response = match short_circuit {
        Some(response) => response,
        None => attempt(params).await?,
    };

    for filter in filters.iter().rev() {
        if let Err(e) = filter.response(&mut response).await {
            return Err(Error::response_filter_failed(client, e, response));
        }
    }

    Ok(response)
}
