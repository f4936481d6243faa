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
use http::{Method, StatusCode};

/// A structured event emitted while a request attempt progresses.
///
/// Events are emitted in the order the underlying operations complete: the
/// attempt start, transport milestones, response headers, one event per
/// received body chunk, the end of the body, and any terminal error.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RequestEvent {
    /// The attempt started.
    Started {
        /// The request method.
        method: Method,
        /// The effective request path.
        path: String,
    },
    /// The transport assigned a socket to the attempt.
    SocketAssigned,
    /// DNS resolution completed.
    DnsResolved,
    /// The TCP connection was established.
    TcpConnected,
    /// The TLS session was established.
    TlsConnected,
    /// The response's headers were received.
    HeadersReceived {
        /// The response status.
        status: StatusCode,
    },
    /// A chunk of the response body was received.
    Chunk {
        /// The size of the chunk in bytes.
        bytes: usize,
    },
    /// The response body was fully received.
    BodyComplete {
        /// The total decoded size of the body in bytes.
        total_bytes: u64,
    },
    /// The attempt failed.
    Failed {
        /// The error's message.
        message: String,
    },
}

/// An observer receiving [`RequestEvent`]s for a single request.
///
/// Observers are attached per request via
/// [`RequestBuilder::observer`](crate::RequestBuilder::observer) and may be
/// invoked from arbitrary execution contexts.
pub trait RequestObserver: Sync + Send {
    /// Handles an event.
    fn on_event(&self, event: &RequestEvent);
}
