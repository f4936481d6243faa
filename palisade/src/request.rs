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
use crate::body::{Body, BytesBody, ResetTrackingBody};
use crate::errors::{BoxError, Error};
use crate::observe::RequestObserver;
use crate::raw::{RawBody, Service};
use crate::response::Response;
use crate::Client;
use bytes::Bytes;
use http::header::ACCEPT;
use http::uri::Scheme;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use url::form_urlencoded;

/// The merged parameters of a single request.
///
/// Parameters start from the client's defaults and are adjusted by the
/// [`RequestBuilder`] and by request filters. The hostname always remains the
/// client's and cannot be overridden.
#[derive(Clone)]
pub struct RequestParams {
    method: Method,
    scheme: Scheme,
    hostname: String,
    port: u16,
    path: Option<String>,
    pathname: String,
    query: BTreeMap<String, Vec<String>>,
    headers: HeaderMap,
    connect_timeout: Duration,
    read_timeout: Duration,
    drop_request_after: Option<Duration>,
    drop_all_requests_after: Option<Duration>,
    timing: bool,
    observer: Option<Arc<dyn RequestObserver>>,
}

impl RequestParams {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        scheme: Scheme,
        hostname: String,
        port: u16,
        pathname: String,
        query: BTreeMap<String, Vec<String>>,
        headers: HeaderMap,
        connect_timeout: Duration,
        read_timeout: Duration,
        drop_request_after: Option<Duration>,
        drop_all_requests_after: Option<Duration>,
        timing: bool,
    ) -> RequestParams {
        RequestParams {
            method,
            scheme,
            hostname,
            port,
            path: None,
            pathname,
            query,
            headers,
            connect_timeout,
            read_timeout,
            drop_request_after,
            drop_all_requests_after,
            timing,
            observer: None,
        }
    }

    /// Returns the request's method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Sets the request's method.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Returns the request's scheme.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Returns the request's hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the request's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the raw request path, if one was set.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Sets the raw request path.
    ///
    /// When set, the raw path takes precedence over the pathname and query.
    pub fn set_path<T>(&mut self, path: T)
    where
        T: Into<String>,
    {
        self.path = Some(path.into());
    }

    /// Returns the request's pathname.
    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    /// Sets the request's pathname.
    pub fn set_pathname<T>(&mut self, pathname: T)
    where
        T: Into<String>,
    {
        self.pathname = pathname.into();
    }

    /// Returns the request's query parameters.
    pub fn query(&self) -> &BTreeMap<String, Vec<String>> {
        &self.query
    }

    /// Returns a mutable reference to the request's query parameters.
    pub fn query_mut(&mut self) -> &mut BTreeMap<String, Vec<String>> {
        &mut self.query
    }

    /// Returns the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a mutable reference to the request's headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the attempt's connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the attempt's read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Returns the attempt's end-to-end deadline, if one is set.
    pub fn drop_request_after(&self) -> Option<Duration> {
        self.drop_request_after
    }

    /// Returns the call's global deadline, if one is set.
    pub fn drop_all_requests_after(&self) -> Option<Duration> {
        self.drop_all_requests_after
    }

    /// Returns true if the attempt records timings.
    pub fn timing(&self) -> bool {
        self.timing
    }

    /// Returns the effective path of the request.
    ///
    /// The raw path wins when one is set; otherwise the path is built from
    /// the pathname and the serialized query.
    pub fn effective_path(&self) -> String {
        if let Some(path) = &self.path {
            return path.clone();
        }

        let mut path = self.pathname.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }

        if !self.query.is_empty() {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (name, values) in &self.query {
                for value in values {
                    serializer.append_pair(name, value);
                }
            }
            path.push('?');
            path.push_str(&serializer.finish());
        }

        path
    }

    pub(crate) fn set_observer(&mut self, observer: Arc<dyn RequestObserver>) {
        self.observer = Some(observer);
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn RequestObserver>> {
        self.observer.clone()
    }

    pub(crate) fn set_drop_request_after(&mut self, limit: Duration) {
        self.drop_request_after = Some(limit);
    }

    pub(crate) fn set_drop_all_requests_after(&mut self, limit: Duration) {
        self.drop_all_requests_after = Some(limit);
    }

    pub(crate) fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub(crate) fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub(crate) fn set_timing(&mut self, timing: bool) {
        self.timing = timing;
    }
}

impl fmt::Debug for RequestParams {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RequestParams")
            .field("method", &self.method)
            .field("scheme", &self.scheme.as_str())
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("pathname", &self.pathname)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("drop_request_after", &self.drop_request_after)
            .field("drop_all_requests_after", &self.drop_all_requests_after)
            .field("timing", &self.timing)
            .finish()
    }
}

pub(crate) struct Request<'a> {
    pub(crate) params: RequestParams,
    pub(crate) body: Option<Pin<Box<ResetTrackingBody<dyn Body + Sync + Send + 'a>>>>,
}

/// A builder for a single request.
pub struct RequestBuilder<'a, T> {
    client: &'a Client<T>,
    request: Request<'a>,
    pending_error: Option<Error>,
}

impl<'a, T> RequestBuilder<'a, T> {
    pub(crate) fn new(client: &'a Client<T>, method: Method) -> RequestBuilder<'a, T> {
        let state = client.state();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, crate::APPLICATION_JSON.clone());

        let params = RequestParams::new(
            method,
            state.scheme.clone(),
            state.hostname.clone(),
            state.port,
            state.pathname.clone(),
            state.query.clone(),
            headers,
            state.connect_timeout,
            state.read_timeout,
            state.drop_request_after,
            state.drop_all_requests_after,
            state.timing,
        );

        RequestBuilder {
            client,
            request: Request { params, body: None },
            pending_error: None,
        }
    }

    /// Sets the request's pathname.
    pub fn pathname(mut self, pathname: &str) -> RequestBuilder<'a, T> {
        self.request.params.set_pathname(pathname);
        self
    }

    /// Sets the raw request path, overriding the pathname and query.
    pub fn path(mut self, path: &str) -> RequestBuilder<'a, T> {
        self.request.params.set_path(path);
        self
    }

    /// Appends a query parameter.
    ///
    /// A parameter may be appended multiple times under the same name.
    #[allow(clippy::needless_pass_by_value)] // we intentionally take V by value here
    pub fn query<V>(mut self, name: &str, value: V) -> RequestBuilder<'a, T>
    where
        V: ToString,
    {
        self.request
            .params
            .query_mut()
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    /// Sets a header, replacing any previous value.
    ///
    /// The `Accept` header defaults to `application/json` but can be
    /// overridden. The `Host`, `Content-Length`, and `Content-Type` headers
    /// are fully controlled by the client and will be overwritten.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> RequestBuilder<'a, T> {
        self.request.params.headers_mut().insert(name, value);
        self
    }

    /// Returns a mutable reference to the request's headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.request.params.headers_mut()
    }

    /// Sets the attempt's connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> RequestBuilder<'a, T> {
        self.request.params.set_connect_timeout(timeout);
        self
    }

    /// Sets the attempt's read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> RequestBuilder<'a, T> {
        self.request.params.set_read_timeout(timeout);
        self
    }

    /// Sets an end-to-end deadline for each individual attempt.
    pub fn drop_request_after(mut self, limit: Duration) -> RequestBuilder<'a, T> {
        self.request.params.set_drop_request_after(limit);
        self
    }

    /// Sets a global deadline for the whole call, across all attempts.
    pub fn drop_all_requests_after(mut self, limit: Duration) -> RequestBuilder<'a, T> {
        self.request.params.set_drop_all_requests_after(limit);
        self
    }

    /// Overrides the client's timing setting for this request.
    pub fn timing(mut self, timing: bool) -> RequestBuilder<'a, T> {
        self.request.params.set_timing(timing);
        self
    }

    /// Attaches an observer receiving the request's structured events.
    pub fn observer(mut self, observer: Arc<dyn RequestObserver>) -> RequestBuilder<'a, T> {
        self.request.params.set_observer(observer);
        self
    }

    /// Sets the request body.
    pub fn body<B>(mut self, body: B) -> RequestBuilder<'a, T>
    where
        B: Body + 'a,
    {
        self.request.body = Some(Box::pin(ResetTrackingBody::new(body)) as _);
        self
    }

    /// Sets the request body to the JSON encoding of a value.
    ///
    /// A serialization failure surfaces as an `INTERNAL_ERROR` when the
    /// request is sent.
    pub fn json<S>(mut self, value: &S) -> RequestBuilder<'a, T>
    where
        S: Serialize,
    {
        match serde_json::to_vec(value) {
            Ok(body) => self.body(BytesBody::new(body, crate::APPLICATION_JSON.clone())),
            Err(e) => {
                self.pending_error = Some(Error::internal(self.client.name(), Box::new(e)));
                self
            }
        }
    }
}

impl<'a, T> RequestBuilder<'a, T> {
    /// Sends the request.
    pub async fn send<B>(self) -> Result<Response, Error>
    where
        T: Service<http::Request<RawBody>, Response = http::Response<B>> + Sync + Send,
        T::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + Unpin,
        B::Error: Into<BoxError>,
    {
        if let Some(error) = self.pending_error {
            return Err(error);
        }
        self.client.send(self.request).await
    }
}
