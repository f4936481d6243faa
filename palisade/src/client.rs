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
use crate::breaker::CircuitBreaker;
use crate::builder::{Builder, HostStage};
use crate::errors::{BoxError, Error};
use crate::filter::Filter;
use crate::raw::{DefaultRawClient, RawBody, Service};
use crate::request::{Request, RequestBuilder, RequestParams};
use crate::response::Response;
use crate::retry::RetryConfig;
use crate::rng::ClientRng;
use crate::send;
use bytes::Bytes;
use http::uri::Scheme;
use http::Method;
use http_body::Body as HttpBody;
use palisade_config::ServiceConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub(crate) enum BreakerSource {
    Disabled,
    Shared(Arc<CircuitBreaker>),
    PerRequest(Arc<dyn Fn(&RequestParams) -> Arc<CircuitBreaker> + Sync + Send>),
}

impl Clone for BreakerSource {
    fn clone(&self) -> BreakerSource {
        match self {
            BreakerSource::Disabled => BreakerSource::Disabled,
            BreakerSource::Shared(breaker) => BreakerSource::Shared(breaker.clone()),
            BreakerSource::PerRequest(factory) => BreakerSource::PerRequest(factory.clone()),
        }
    }
}

pub(crate) struct ClientState<T> {
    pub(crate) raw: T,
    pub(crate) name: String,
    pub(crate) hostname: String,
    pub(crate) scheme: Scheme,
    pub(crate) port: u16,
    pub(crate) pathname: String,
    pub(crate) query: BTreeMap<String, Vec<String>>,
    pub(crate) filters: Vec<Arc<dyn Filter>>,
    pub(crate) retry: RetryConfig,
    pub(crate) should_retry: Arc<dyn Fn(&Error, &RequestParams) -> bool + Sync + Send>,
    pub(crate) on_retry: Arc<dyn Fn(u32, &Error, &RequestParams) + Sync + Send>,
    pub(crate) breakers: BreakerSource,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) drop_request_after: Option<Duration>,
    pub(crate) drop_all_requests_after: Option<Duration>,
    pub(crate) timing: bool,
    pub(crate) auto_parse_json: bool,
    pub(crate) auto_decode_utf8: bool,
    pub(crate) rng: ClientRng,
}

/// An HTTP client for a single upstream host.
///
/// A client is constructed once and serves any number of concurrent calls.
/// Each call performs one logical request, transparently composing the filter
/// pipeline, the circuit breaker, the retry engine, and the individual HTTP
/// attempts.
///
/// Cloning a client is cheap and produces a handle to the same shared state.
pub struct Client<T = DefaultRawClient> {
    shared: Arc<ClientState<T>>,
}

impl<T> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Client<T> {
        Client {
            shared: self.shared.clone(),
        }
    }
}

impl Client {
    /// Returns a new builder.
    pub fn builder() -> Builder<HostStage> {
        Builder::new()
    }

    /// Creates a client from a configuration.
    pub fn new(config: &ServiceConfig) -> Result<Client, Error> {
        Builder::new().from_config(config)?.build()
    }

    /// Creates a client from a URL string.
    ///
    /// The URL's scheme, hostname, port, path, and query are parsed into the
    /// client's default request options; the pathname defaults to `/`.
    pub fn from_url(url: &str) -> Result<Client, Error> {
        Builder::new().base_url(url)?.build()
    }
}

impl<T> Client<T> {
    pub(crate) fn from_state(state: ClientState<T>) -> Client<T> {
        Client {
            shared: Arc::new(state),
        }
    }

    pub(crate) fn state(&self) -> &ClientState<T> {
        &self.shared
    }

    /// Returns the client's name, used to prefix its error messages.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the hostname the client sends requests to.
    pub fn hostname(&self) -> &str {
        &self.shared.hostname
    }

    /// Returns the client's circuit breaker, if it uses a shared one.
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        match &self.shared.breakers {
            BreakerSource::Shared(breaker) => Some(breaker),
            _ => None,
        }
    }

    /// Returns a new request builder.
    pub fn request(&self, method: Method) -> RequestBuilder<'_, T> {
        RequestBuilder::new(self, method)
    }

    /// Returns a new builder for a GET request.
    pub fn get(&self, pathname: &str) -> RequestBuilder<'_, T> {
        self.request(Method::GET).pathname(pathname)
    }

    /// Returns a new builder for a POST request.
    pub fn post(&self, pathname: &str) -> RequestBuilder<'_, T> {
        self.request(Method::POST).pathname(pathname)
    }

    /// Returns a new builder for a PUT request.
    pub fn put(&self, pathname: &str) -> RequestBuilder<'_, T> {
        self.request(Method::PUT).pathname(pathname)
    }

    /// Returns a new builder for a DELETE request.
    pub fn delete(&self, pathname: &str) -> RequestBuilder<'_, T> {
        self.request(Method::DELETE).pathname(pathname)
    }

    /// Returns a new builder for a PATCH request.
    pub fn patch(&self, pathname: &str) -> RequestBuilder<'_, T> {
        self.request(Method::PATCH).pathname(pathname)
    }

    /// Returns a new builder for a HEAD request.
    pub fn head(&self, pathname: &str) -> RequestBuilder<'_, T> {
        self.request(Method::HEAD).pathname(pathname)
    }

    pub(crate) async fn send<B>(&self, request: Request<'_>) -> Result<Response, Error>
    where
        T: Service<http::Request<RawBody>, Response = http::Response<B>> + Sync + Send,
        T::Error: Into<BoxError>,
        B: HttpBody<Data = Bytes> + Send + Unpin,
        B::Error: Into<BoxError>,
    {
        send::send(self, request).await
    }
}
