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
//! "Raw" HTTP client APIs.
//!
//! The [`Client`](crate::Client) wraps a raw HTTP client which is used to
//! handle the actual HTTP communication. A default raw client is provided,
//! but this can be overridden if desired.
//!
//! # Behavior
//!
//! The raw client interacts directly with the `http` crate's `Request` and
//! `Response` types, with a [`RawBody`] request body and a response body
//! implementing the `http_body::Body` trait. The request's URI is provided in
//! absolute-form and all headers have already been set in the header map. The
//! HTTP response should be returned directly, without any interpretation of
//! the status code, handling of redirects, etc.
//!
//! Two request extensions configure each dispatch: a [`TransportConfig`] with
//! the attempt's connection and read timeouts, and an
//! `Arc<`[`TimingRecorder`](crate::TimingRecorder)`>` through which the
//! implementation should report transport milestones. Timeout expiries should
//! surface as errors whose source chains contain [`ConnectTimeoutError`] or
//! [`ReadTimeoutError`] so the attempt can classify them precisely.
pub use crate::raw::body::*;
pub use crate::raw::default::*;
use crate::builder::{Builder, Complete};
use crate::errors::Error;
use std::future::Future;
use std::time::Duration;
use std::{error, fmt};

mod body;
mod default;

/// An asynchronous function from request to response.
///
/// This trait is based on the `tower::Service` trait, but differs in two
/// ways. It does not have a `poll_ready` method as our client-side
/// backpressure depends on the request, and the `call` method takes `&self`
/// rather than `&mut self` as our client is designed to be used through a
/// shared reference.
pub trait Service<R> {
    /// The response type returned by the service.
    type Response;
    /// The error type returned by the service.
    type Error;

    /// Asynchronously perform the request.
    fn call(&self, req: R) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send;
}

/// A factory of raw HTTP clients.
pub trait BuildRawClient {
    /// The raw client type.
    type RawClient;

    /// Creates a new raw client.
    fn build_raw_client(&self, builder: &Builder<Complete<Self>>) -> Result<Self::RawClient, Error>
    where
        Self: Sized;
}

/// Per-attempt transport timeouts, passed to the raw client through the
/// request's extensions.
#[derive(Debug, Copy, Clone)]
pub struct TransportConfig {
    /// The maximum time to establish a connection.
    pub connect_timeout: Duration,
    /// The maximum time to wait for a byte of the response.
    pub read_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
        }
    }
}

/// The marker error reported when a connection did not establish within the
/// connection timeout.
#[derive(Debug)]
pub struct ConnectTimeoutError(pub(crate) ());

impl fmt::Display for ConnectTimeoutError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("connect timed out")
    }
}

impl error::Error for ConnectTimeoutError {}

/// The marker error reported when no byte was received within the read
/// timeout.
#[derive(Debug)]
pub struct ReadTimeoutError(pub(crate) ());

impl fmt::Display for ReadTimeoutError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("read timed out")
    }
}

impl error::Error for ReadTimeoutError {}
