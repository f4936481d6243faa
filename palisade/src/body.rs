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
use crate::errors::BoxError;
use crate::raw::BodyWriter;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;
use pin_project::pin_project;
use std::pin::Pin;

static APPLICATION_OCTET_STREAM: Lazy<HeaderValue> =
    Lazy::new(|| HeaderValue::from_static("application/octet-stream"));

/// A request body.
#[async_trait]
pub trait Body: Sync + Send {
    /// Returns the length of the body if known.
    fn content_length(&self) -> Option<u64>;

    /// Returns the content type of the body.
    fn content_type(&self) -> HeaderValue;

    /// Writes the body out into the provided writer.
    ///
    /// An error terminates the attempt with a `BODY_STREAM` failure.
    async fn write(self: Pin<&mut Self>, w: &mut BodyWriter) -> Result<(), BoxError>;

    /// Resets the body to its initial state so the request can be retried.
    ///
    /// Returns `false` if the body cannot be reset, in which case the request
    /// will not be retried.
    async fn reset(self: Pin<&mut Self>) -> bool;
}

/// A simple fully-buffered request body.
pub struct BytesBody {
    body: Bytes,
    content_type: HeaderValue,
}

impl BytesBody {
    /// Creates a body from a buffer and content type.
    pub fn new<T>(body: T, content_type: HeaderValue) -> BytesBody
    where
        T: Into<Bytes>,
    {
        BytesBody {
            body: body.into(),
            content_type,
        }
    }

    /// Creates a body from a buffer with an `application/octet-stream`
    /// content type.
    pub fn raw<T>(body: T) -> BytesBody
    where
        T: Into<Bytes>,
    {
        BytesBody::new(body, APPLICATION_OCTET_STREAM.clone())
    }
}

#[async_trait]
impl Body for BytesBody {
    fn content_length(&self) -> Option<u64> {
        Some(self.body.len() as u64)
    }

    fn content_type(&self) -> HeaderValue {
        self.content_type.clone()
    }

    async fn write(self: Pin<&mut Self>, w: &mut BodyWriter) -> Result<(), BoxError> {
        w.write_bytes(self.body.clone()).await?;
        Ok(())
    }

    async fn reset(self: Pin<&mut Self>) -> bool {
        true
    }
}

// Tracks whether a body has started writing so the retry loop knows when a
// reset is required before the next attempt.
#[pin_project]
pub(crate) struct ResetTrackingBody<B>
where
    B: ?Sized,
{
    needs_reset: bool,
    #[pin]
    body: B,
}

impl<B> ResetTrackingBody<B> {
    pub(crate) fn new(body: B) -> ResetTrackingBody<B> {
        ResetTrackingBody {
            needs_reset: false,
            body,
        }
    }
}

impl<B> ResetTrackingBody<B>
where
    B: Body + ?Sized,
{
    pub(crate) fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        self.body.content_length()
    }

    pub(crate) fn content_type(&self) -> HeaderValue {
        self.body.content_type()
    }

    pub(crate) async fn write(self: Pin<&mut Self>, w: &mut BodyWriter) -> Result<(), BoxError> {
        let this = self.project();
        *this.needs_reset = true;
        this.body.write(w).await
    }

    pub(crate) async fn reset(self: Pin<&mut Self>) -> bool {
        let this = self.project();
        let reset = this.body.reset().await;
        if reset {
            *this.needs_reset = false;
        }
        reset
    }
}
