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
use crate::body::{Body, ResetTrackingBody};
use crate::errors::{BoxError, Error};
use crate::observe::RequestEvent;
use crate::raw::{BodyError, ConnectTimeoutError, RawBody, ReadTimeoutError, Service, TransportConfig};
use crate::request::RequestParams;
use crate::response::{self, Response};
use crate::timing::TimingRecorder;
use async_compression::tokio::bufread::{GzipDecoder, ZlibDecoder};
use bytes::Bytes;
use futures::{future, stream};
use http::header::{ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::header::{Entry, HeaderValue};
use http::{HeaderMap, Uri};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use std::{error, io};
use tokio::io::AsyncReadExt;
use tokio::time;
use tokio_util::io::StreamReader;
use tracing::info;

static GZIP_DEFLATE: Lazy<HeaderValue> = Lazy::new(|| HeaderValue::from_static("gzip, deflate"));

#[derive(Copy, Clone)]
pub(crate) struct AttemptEnv<'a> {
    pub name: &'a str,
    pub auto_parse_json: bool,
    pub auto_decode_utf8: bool,
}

// Performs a single, non-retrying HTTP attempt: exactly one of a Response or
// a typed terminal error.
pub(crate) async fn execute<T, B>(
    raw: &T,
    env: AttemptEnv<'_>,
    params: Arc<RequestParams>,
    body: Option<Pin<&mut ResetTrackingBody<dyn Body + Sync + Send + '_>>>,
) -> Result<Response, Error>
where
    T: Service<http::Request<RawBody>, Response = http::Response<B>> + Sync + Send,
    T::Error: Into<BoxError>,
    B: HttpBody<Data = Bytes> + Send + Unpin,
    B::Error: Into<BoxError>,
{
    let recorder = Arc::new(TimingRecorder::new(params.timing(), params.observer()));
    recorder.emit(RequestEvent::Started {
        method: params.method().clone(),
        path: params.effective_path(),
    });

    let attempt = run(raw, &env, &params, body, &recorder);
    let result = match params.drop_request_after() {
        Some(limit) => match time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::user_timeout(env.name)),
        },
        None => attempt.await,
    };

    match result {
        Ok(response) => Ok(response),
        Err(mut error) => {
            recorder.emit(RequestEvent::Failed {
                message: error.to_string(),
            });
            error.set_params(params.clone());
            error.set_timings(recorder.snapshot());
            Err(error)
        }
    }
}

async fn run<T, B>(
    raw: &T,
    env: &AttemptEnv<'_>,
    params: &Arc<RequestParams>,
    body: Option<Pin<&mut ResetTrackingBody<dyn Body + Sync + Send + '_>>>,
    recorder: &Arc<TimingRecorder>,
) -> Result<Response, Error>
where
    T: Service<http::Request<RawBody>, Response = http::Response<B>> + Sync + Send,
    T::Error: Into<BoxError>,
    B: HttpBody<Data = Bytes> + Send + Unpin,
    B::Error: Into<BoxError>,
{
    let headers = attempt_headers(params, &body);
    let (raw_body, writer) = RawBody::new(body);
    let request = build_request(env.name, params, headers, raw_body, recorder)?;

    let (body_result, response_result) = future::join(writer.write(), raw.call(request)).await;

    let response = match (body_result, response_result) {
        (Ok(()), Ok(response)) => response,
        (Ok(()), Err(e)) => return Err(classify_transport(env.name, e.into())),
        (Err(e), Ok(response)) => {
            info!(error = %e, "request body reported an error on a successful request");
            response
        }
        (Err(body), Err(transport)) => {
            return Err(deconflict_errors(env.name, body, transport.into()))
        }
    };

    recorder.response_received();
    recorder.emit(RequestEvent::HeadersReceived {
        status: response.status(),
    });

    let (parts, incoming) = response.into_parts();
    let mut headers = parts.headers;
    let encoding = content_encoding(&headers);

    let bytes = collect_body(env.name, incoming, encoding, params.read_timeout(), recorder).await?;

    recorder.end_received();
    recorder.emit(RequestEvent::BodyComplete {
        total_bytes: bytes.len() as u64,
    });

    if encoding != Encoding::Identity {
        headers.remove(CONTENT_ENCODING);
        headers.remove(CONTENT_LENGTH);
    }

    let decoded = response::decode_body(env.auto_parse_json, env.auto_decode_utf8, &headers, bytes);
    let (body, parse_error) = match decoded {
        Ok(body) => (body, None),
        Err((cause, body)) => (body, Some(cause)),
    };

    let mut response = Response::new(parts.status, headers, body);
    response.set_params(params.clone());
    response.set_timings(recorder.snapshot());

    match parse_error {
        None => Ok(response),
        Some(cause) => Err(Error::body_parse_failed(env.name, Box::new(cause), response)),
    }
}

fn attempt_headers(
    params: &RequestParams,
    body: &Option<Pin<&mut ResetTrackingBody<dyn Body + Sync + Send + '_>>>,
) -> HeaderMap {
    let mut headers = params.headers().clone();
    headers.remove(CONNECTION);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    headers.remove(CONTENT_TYPE);

    if let Entry::Vacant(entry) = headers.entry(ACCEPT_ENCODING) {
        entry.insert(GZIP_DEFLATE.clone());
    }

    if let Some(body) = body {
        if let Some(length) = body.content_length() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        headers.insert(CONTENT_TYPE, body.content_type());
    }

    headers
}

fn build_request(
    name: &str,
    params: &RequestParams,
    headers: HeaderMap,
    raw_body: RawBody,
    recorder: &Arc<TimingRecorder>,
) -> Result<http::Request<RawBody>, Error> {
    let uri = Uri::builder()
        .scheme(params.scheme().clone())
        .authority(format!("{}:{}", params.hostname(), params.port()))
        .path_and_query(params.effective_path())
        .build()
        .map_err(|e| Error::internal(name, Box::new(e)))?;

    let mut request = http::Request::new(raw_body);
    *request.method_mut() = params.method().clone();
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;
    request.extensions_mut().insert(TransportConfig {
        connect_timeout: params.connect_timeout(),
        read_timeout: params.read_timeout(),
    });
    request.extensions_mut().insert(recorder.clone());

    Ok(request)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Encoding {
    Identity,
    Gzip,
    Deflate,
}

fn content_encoding(headers: &HeaderMap) -> Encoding {
    match headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok()) {
        Some(v) if v.eq_ignore_ascii_case("gzip") => Encoding::Gzip,
        Some(v) if v.eq_ignore_ascii_case("deflate") => Encoding::Deflate,
        _ => Encoding::Identity,
    }
}

// Bytes are accumulated into a single buffer and decoded once at the end, so
// chunk boundaries that split multi-byte code points or compressed frames are
// handled uniformly.
async fn collect_body<B>(
    name: &str,
    body: B,
    encoding: Encoding,
    read_timeout: Duration,
    recorder: &Arc<TimingRecorder>,
) -> Result<Vec<u8>, Error>
where
    B: HttpBody<Data = Bytes> + Send + Unpin,
    B::Error: Into<BoxError>,
{
    let events = recorder.clone();
    let frames = stream::try_unfold(body, move |mut body| {
        let events = events.clone();
        async move {
            loop {
                let frame = match time::timeout(read_timeout, body.frame()).await {
                    Err(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            ReadTimeoutError(()),
                        ))
                    }
                    Ok(None) => return Ok(None),
                    Ok(Some(Err(e))) => return Err(io::Error::new(io::ErrorKind::Other, e.into())),
                    Ok(Some(Ok(frame))) => frame,
                };

                if let Ok(data) = frame.into_data() {
                    events.emit(RequestEvent::Chunk { bytes: data.len() });
                    return Ok(Some((data, body)));
                }
            }
        }
    });
    let reader = StreamReader::new(Box::pin(frames));

    let mut bytes = vec![];
    let result = match encoding {
        Encoding::Gzip => GzipDecoder::new(reader).read_to_end(&mut bytes).await,
        Encoding::Deflate => ZlibDecoder::new(reader).read_to_end(&mut bytes).await,
        Encoding::Identity => {
            let mut reader = reader;
            reader.read_to_end(&mut bytes).await
        }
    };

    match result {
        Ok(_) => Ok(bytes),
        Err(e) if chain_contains::<ReadTimeoutError>(&e) => {
            Err(Error::read_timeout(name, Box::new(e)))
        }
        Err(e) => Err(Error::network(name, Box::new(e))),
    }
}

fn classify_transport(name: &str, error: BoxError) -> Error {
    if chain_contains::<BodyError>(&*error) {
        Error::body_stream(name, error)
    } else if chain_contains::<ConnectTimeoutError>(&*error) {
        Error::connection_timeout(name, error)
    } else if chain_contains::<ReadTimeoutError>(&*error) {
        Error::read_timeout(name, error)
    } else {
        Error::network(name, error)
    }
}

// An error in the body write will cause an error on the transport side, and
// vice versa. To pick the right one, we see if the transport error was due to
// the body write aborting or not.
fn deconflict_errors(name: &str, body_error: BoxError, transport_error: BoxError) -> Error {
    if chain_contains::<BodyError>(&*transport_error) {
        Error::body_stream(name, body_error)
    } else {
        classify_transport(name, transport_error)
    }
}

fn chain_contains<T>(error: &(dyn error::Error + 'static)) -> bool
where
    T: error::Error + 'static,
{
    let mut current: Option<&(dyn error::Error + 'static)> = Some(error);
    while let Some(error) = current {
        if error.is::<T>() {
            return true;
        }
        current = error.source();
    }
    false
}
