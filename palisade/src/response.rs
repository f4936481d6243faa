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
use crate::errors::Error;
use crate::request::RequestParams;
use crate::timing::Timings;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// An HTTP response.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
    params: Option<Arc<RequestParams>>,
    timings: Option<Timings>,
    retry_errors: Vec<Error>,
}

impl Response {
    /// Creates a response.
    ///
    /// This is primarily intended for request filters that short-circuit a
    /// call with a synthetic response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Response {
        Response {
            status,
            headers,
            body,
            params: None,
            timings: None,
            retry_errors: vec![],
        }
    }

    /// Returns the response's status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response's headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a mutable reference to the response's headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the response's body.
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Returns a mutable reference to the response's body.
    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Consumes the response, returning its body.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Returns the request parameters that produced the response, if any.
    ///
    /// Synthetic responses created by filters have no parameters.
    pub fn params(&self) -> Option<&RequestParams> {
        self.params.as_deref()
    }

    /// Returns the timings of the attempt that produced the response.
    pub fn timings(&self) -> Option<Timings> {
        self.timings
    }

    /// Returns the errors of the failed attempts preceding this response,
    /// oldest first.
    pub fn retry_errors(&self) -> &[Error] {
        &self.retry_errors
    }

    pub(crate) fn params_arc(&self) -> Option<Arc<RequestParams>> {
        self.params.clone()
    }

    pub(crate) fn set_params(&mut self, params: Arc<RequestParams>) {
        self.params = Some(params);
    }

    pub(crate) fn set_timings(&mut self, timings: Option<Timings>) {
        self.timings = timings;
    }

    pub(crate) fn set_retry_errors(&mut self, retry_errors: Vec<Error>) {
        self.retry_errors = retry_errors;
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("timings", &self.timings)
            .finish()
    }
}

/// The decoded body of a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// An empty body.
    Empty,
    /// A raw binary body.
    Bytes(Bytes),
    /// A UTF-8 decoded body.
    Text(String),
    /// A parsed JSON body.
    Json(Value),
}

impl ResponseBody {
    /// Returns true if the body is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }

    /// Returns the raw bytes of a binary body.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ResponseBody::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the text of a UTF-8 decoded body.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the value of a parsed JSON body.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Returns a mutable reference to the value of a parsed JSON body.
    pub fn as_json_mut(&mut self) -> Option<&mut Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

pub(crate) fn decode_body(
    auto_parse_json: bool,
    auto_decode_utf8: bool,
    headers: &HeaderMap,
    bytes: Vec<u8>,
) -> Result<ResponseBody, (serde_json::Error, ResponseBody)> {
    if bytes.is_empty() {
        return Ok(ResponseBody::Empty);
    }

    if auto_parse_json && is_json_content_type(headers) {
        return match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(ResponseBody::Json(value)),
            Err(e) => Err((e, undecoded(auto_decode_utf8, bytes))),
        };
    }

    Ok(undecoded(auto_decode_utf8, bytes))
}

fn undecoded(auto_decode_utf8: bool, bytes: Vec<u8>) -> ResponseBody {
    if auto_decode_utf8 {
        ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        ResponseBody::Bytes(bytes.into())
    }
}

// matches application/json and application/*+json content types
pub(crate) fn is_json_content_type(headers: &HeaderMap) -> bool {
    let content_type = match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(value) => value,
        None => return false,
    };

    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match mime.strip_prefix("application/") {
        Some(subtype) => subtype == "json" || subtype.ends_with("+json"),
        None => false,
    }
}
