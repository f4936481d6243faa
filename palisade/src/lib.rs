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
//! An opinionated, resilient HTTP client.
//!
//! Each [`Client`] talks to a single upstream host and performs one logical
//! request per call, transparently composing a circuit breaker, a retry
//! engine, a filter pipeline, and fine-grained timing and timeout controls
//! around the individual HTTP attempts.
//!
//! # Usage
//!
//! A client is built either programmatically or from a deserialized
//! [`config::ServiceConfig`]:
//!
//! ```no_run
//! use palisade::Client;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), palisade::Error> {
//! let client = Client::builder()
//!     .hostname("widgets.my-network.com")
//!     .name("widgets")
//!     .retries(3)
//!     .min_timeout(Duration::from_millis(100))
//!     .max_timeout(Duration::from_secs(1))
//!     .build()?;
//!
//! let response = client.get("/widgets").query("limit", 10).send().await?;
//! println!("{:?}", response.body().as_json());
//! # Ok(()) }
//! ```
//!
//! A URL string can stand in for the explicit configuration; its scheme,
//! host, port, path, and query become the client's default request options:
//!
//! ```no_run
//! use palisade::Client;
//!
//! # fn example() -> Result<(), palisade::Error> {
//! let client = Client::from_url("https://widgets.my-network.com/api/widgets")?;
//! # Ok(()) }
//! ```
//!
//! # Behavior
//!
//! ## Attempts and timeouts
//!
//! Each attempt dispatches one HTTP request through the raw client (see the
//! [`raw`] module) and classifies its outcome precisely: transport failures,
//! connection timeouts, read timeouts, deadline expiries, and request body
//! failures each surface as their own [`ErrorKind`]. The connection timeout
//! (default 1 second) covers establishing a connection; the read timeout
//! (default 2 seconds) covers each wait for response bytes;
//! `drop_request_after` caps a single attempt end-to-end; and
//! `drop_all_requests_after` is a global deadline for the whole call,
//! aborting any in-flight attempt when it elapses.
//!
//! When timing is enabled (the default), each attempt records the times at
//! which the transport assigned a socket, resolved DNS, connected, finished
//! the TLS handshake, received response headers, and finished the body — see
//! [`Timings`] and [`TimingPhases`].
//!
//! ## Filters
//!
//! Request filters transform the outgoing parameters in declared order and
//! may short-circuit the attempt with a synthetic response; response filters
//! transform the response in reverse declared order. The built-in
//! [`ServerErrorFilter`] failing responses with a status of 500 or above is
//! always installed. See the [`filter`] module.
//!
//! ## Retries
//!
//! Failed attempts are retried over an exponential, optionally randomized
//! backoff schedule (default: no retries). A `should_retry` policy can veto
//! retries per error, and `on_retry` observes each scheduled re-attempt. The
//! errors of all failed attempts of a call are aggregated: a successful
//! [`Response`] and every terminal [`Error`] carry them as `retry_errors`.
//! See the [`retry`] module.
//!
//! ## Circuit breaking
//!
//! An optional circuit breaker tracks outcomes in a rolling window and, once
//! the error percentage trips it, rejects calls with `CIRCUIT_OPEN` without
//! consuming attempts, periodically letting a probe through until the
//! upstream recovers. See the [`breaker`] module.
#![warn(missing_docs, clippy::all)]

pub use crate::body::*;
pub use crate::builder::*;
pub use crate::client::*;
pub use crate::errors::{BoxError, Error, ErrorKind, FailureKind};
pub use crate::filter::{ClientErrorFilter, Filter, ServerErrorFilter, StatusError};
pub use crate::observe::*;
pub use crate::request::{RequestBuilder, RequestParams};
pub use crate::response::{Response, ResponseBody};
pub use crate::timing::{TimingPhases, TimingRecorder, Timings};
use http::HeaderValue;
use once_cell::sync::Lazy;

mod attempt;
mod body;
pub mod breaker;
mod builder;
mod client;
pub mod errors;
pub mod filter;
mod observe;
pub mod raw;
mod request;
mod response;
pub mod retry;
mod rng;
mod send;
#[cfg(test)]
mod test;
mod timing;

/// Client configuration.
///
/// This is just a reexport of the `palisade_config` crate for convenience.
pub mod config {
    #[doc(inline)]
    pub use palisade_config::*;
}

static APPLICATION_JSON: Lazy<HeaderValue> =
    Lazy::new(|| HeaderValue::from_static("application/json"));
