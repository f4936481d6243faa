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
use crate::body::{Body, BytesBody};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::builder::{Builder, Complete};
use crate::errors::{BoxError, Error, ErrorKind, FailureKind};
use crate::filter::Filter;
use crate::observe::{RequestEvent, RequestObserver};
use crate::raw::{BodyWriter, BuildRawClient, ConnectTimeoutError, RawBody, Service};
use crate::request::RequestParams;
use crate::response::{Response, ResponseBody};
use crate::Client;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use futures::{join, stream, StreamExt};
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, HOST};
use http::StatusCode;
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time;

// mock transports

#[derive(Clone)]
struct RawFn<F>(F);

fn raw_fn<F>(f: F) -> RawFn<F> {
    RawFn(f)
}

impl<F, R, Fut, S, E> Service<R> for RawFn<F>
where
    F: Fn(R) -> Fut,
    Fut: Future<Output = Result<S, E>> + Send,
{
    type Response = S;
    type Error = E;

    fn call(&self, req: R) -> impl Future<Output = Result<S, E>> + Send {
        (self.0)(req)
    }
}

struct Raw<T>(T);

impl<T> BuildRawClient for Raw<T>
where
    T: Clone,
{
    type RawClient = T;

    fn build_raw_client(&self, _: &Builder<Complete<Self>>) -> Result<T, Error> {
        Ok(self.0.clone())
    }
}

fn json_response(status: u16, body: &str) -> http::Response<Full<Bytes>> {
    http::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

// local server harness

async fn server<F, Fut>(listener: TcpListener, requests: u32, handler: F)
where
    F: Fn(http::Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<BoxBody<Bytes, Infallible>>> + Send + 'static,
{
    for _ in 0..requests {
        let (socket, _) = listener.accept().await.unwrap();
        let handler = handler.clone();
        let service = hyper::service::service_fn(move |req| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler(req).await) }
        });

        let _ = hyper::server::conn::http1::Builder::new()
            .keep_alive(false)
            .serve_connection(TokioIo::new(socket), service)
            .await;
    }
}

async fn test<F, Fut, G, Gut>(requests: u32, handler: F, check: G)
where
    F: Fn(http::Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<BoxBody<Bytes, Infallible>>> + Send + 'static,
    G: FnOnce(Builder) -> Gut,
    Gut: Future<Output = ()>,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let builder = Client::builder()
        .base_url(&format!("http://127.0.0.1:{}", port))
        .unwrap()
        .name("service");

    join!(server(listener, requests, handler), check(builder));
}

fn full(status: u16, content_type: &str, body: Vec<u8>) -> http::Response<BoxBody<Bytes, Infallible>> {
    http::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(body)).boxed())
        .unwrap()
}

#[tokio::test]
async fn happy_path() {
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));

    let check_breaker = breaker.clone();
    test(
        1,
        |_| async { full(200, "application/json", b"{\"a\":1}".to_vec()) },
        |builder| async move {
            let client = builder.circuit_breaker(check_breaker.clone()).build().unwrap();

            let response = client.get("/").send().await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.body().as_json(), Some(&json!({ "a": 1 })));
            assert!(response.retry_errors().is_empty());
            assert_eq!(check_breaker.metrics().successes, 1);
        },
    )
    .await;
}

#[tokio::test]
async fn timings_are_ordered() {
    test(
        1,
        |_| async { full(200, "application/json", b"{}".to_vec()) },
        |builder| async move {
            let client = builder.build().unwrap();

            let response = client.get("/").send().await.unwrap();

            let timings = response.timings().unwrap();
            let socket = timings.socket().unwrap();
            let lookup = timings.lookup().unwrap();
            let connect = timings.connect().unwrap();
            let response_at = timings.response().unwrap();
            let end = timings.end().unwrap();

            assert!(socket <= lookup);
            assert!(lookup <= connect);
            assert!(connect <= response_at);
            assert!(response_at <= end);
            // no TLS handshake on a plaintext connection
            assert_eq!(timings.secure_connect(), None);
            assert_eq!(timings.phases().total(), Some(end));
        },
    )
    .await;
}

#[tokio::test]
async fn host_header_and_hostname_invariant() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let expected_host = format!("127.0.0.1:{}", port);

    let handler_host = expected_host.clone();
    let handler = move |req: http::Request<Incoming>| {
        let handler_host = handler_host.clone();
        async move {
            assert_eq!(req.headers().get(HOST).unwrap(), handler_host.as_str());
            assert_eq!(req.headers().get("accept").unwrap(), "application/json");
            full(200, "application/json", b"{}".to_vec())
        }
    };

    let builder = Client::builder()
        .base_url(&format!("http://127.0.0.1:{}", port))
        .unwrap();

    join!(server(listener, 1, handler), async move {
        let client = builder.build().unwrap();
        let response = client.get("/").send().await.unwrap();
        assert_eq!(response.params().unwrap().hostname(), "127.0.0.1");
    });
}

#[tokio::test]
async fn json_decode_failure() {
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));

    let check_breaker = breaker.clone();
    test(
        1,
        |_| async { full(200, "application/json", b"/no".to_vec()) },
        |builder| async move {
            let client = builder.circuit_breaker(check_breaker.clone()).build().unwrap();

            let error = client.get("/").send().await.unwrap_err();

            assert_eq!(error.kind(), ErrorKind::BodyParseFailed);
            assert_eq!(error.response().unwrap().body().as_str(), Some("/no"));
            assert_eq!(check_breaker.metrics().failures, 1);
        },
    )
    .await;
}

#[tokio::test]
async fn retry_to_success() {
    let attempts = Arc::new(AtomicUsize::new(0));

    let handler_attempts = attempts.clone();
    test(
        3,
        move |_| {
            let n = handler_attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    full(501, "application/json", vec![])
                } else {
                    full(200, "application/json", b"{\"foo\":\"bar\"}".to_vec())
                }
            }
        },
        |builder| async move {
            let client = builder
                .retries(3)
                .backoff_factor(2.0)
                .min_timeout(Duration::from_millis(10))
                .max_timeout(Duration::from_millis(40))
                .randomize(false)
                .build()
                .unwrap();

            let response = client.get("/").send().await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.body().as_json(), Some(&json!({ "foo": "bar" })));
            assert_eq!(response.retry_errors().len(), 2);
            for error in response.retry_errors() {
                assert_eq!(error.kind(), ErrorKind::ResponseFilterFailed);
            }
        },
    )
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gzip_response_bodies_decode() {
    test(
        1,
        |_| async {
            let mut encoder = GzEncoder::new(vec![], Compression::default());
            encoder.write_all(b"{\"a\":1}").unwrap();
            let body = encoder.finish().unwrap();

            http::Response::builder()
                .status(200)
                .header(CONTENT_TYPE, "application/json")
                .header(CONTENT_ENCODING, "gzip")
                .body(Full::new(Bytes::from(body)).boxed())
                .unwrap()
        },
        |builder| async move {
            let client = builder.build().unwrap();

            let response = client.get("/").send().await.unwrap();

            assert_eq!(response.body().as_json(), Some(&json!({ "a": 1 })));
            assert_eq!(response.headers().get(CONTENT_ENCODING), None);
        },
    )
    .await;
}

#[tokio::test]
async fn deflate_response_bodies_decode() {
    test(
        1,
        |_| async {
            let mut encoder = ZlibEncoder::new(vec![], Compression::default());
            encoder.write_all(b"hello world").unwrap();
            let body = encoder.finish().unwrap();

            http::Response::builder()
                .status(200)
                .header(CONTENT_TYPE, "text/plain")
                .header(CONTENT_ENCODING, "deflate")
                .body(Full::new(Bytes::from(body)).boxed())
                .unwrap()
        },
        |builder| async move {
            let client = builder.build().unwrap();

            let response = client.get("/").send().await.unwrap();

            assert_eq!(response.body().as_str(), Some("hello world"));
        },
    )
    .await;
}

#[tokio::test]
async fn read_timeout_waiting_for_headers() {
    test(
        1,
        |_| async {
            time::sleep(Duration::from_secs(1)).await;
            full(200, "application/json", vec![])
        },
        |builder| async move {
            let client = builder
                .read_timeout(Duration::from_millis(50))
                .build()
                .unwrap();

            let error = client.get("/").send().await.unwrap_err();

            assert_eq!(
                error.kind(),
                ErrorKind::RequestFailed(FailureKind::ReadTimeout)
            );
        },
    )
    .await;
}

struct StreamedBody;

#[async_trait]
impl Body for StreamedBody {
    fn content_length(&self) -> Option<u64> {
        None
    }

    fn content_type(&self) -> http::HeaderValue {
        http::HeaderValue::from_static("text/plain")
    }

    async fn write(self: Pin<&mut Self>, w: &mut BodyWriter) -> Result<(), BoxError> {
        w.write_all(b"hello ").await?;
        w.flush().await?;
        w.write_bytes(Bytes::from_static(b"world")).await?;
        Ok(())
    }

    async fn reset(self: Pin<&mut Self>) -> bool {
        false
    }
}

#[tokio::test]
async fn streaming_request_body() {
    test(
        1,
        |req| async {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, Bytes::from_static(b"hello world"));
            full(200, "application/json", b"{}".to_vec())
        },
        |builder| async move {
            let client = builder.build().unwrap();

            let response = client
                .post("/upload")
                .body(StreamedBody)
                .send()
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
        },
    )
    .await;
}

#[tokio::test]
async fn fixed_request_body_sets_headers() {
    test(
        1,
        |req| async move {
            assert_eq!(req.headers().get("content-length").unwrap(), "4");
            assert_eq!(req.headers().get(CONTENT_TYPE).unwrap(), "application/json");
            let body = req.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, Bytes::from_static(b"true"));
            full(200, "application/json", b"{}".to_vec())
        },
        |builder| async move {
            let client = builder.build().unwrap();

            let response = client.post("/flag").json(&true).send().await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
        },
    )
    .await;
}

struct ExplodingBody;

#[async_trait]
impl Body for ExplodingBody {
    fn content_length(&self) -> Option<u64> {
        None
    }

    fn content_type(&self) -> http::HeaderValue {
        http::HeaderValue::from_static("text/plain")
    }

    async fn write(self: Pin<&mut Self>, w: &mut BodyWriter) -> Result<(), BoxError> {
        w.write_all(b"partial").await?;
        w.flush().await?;
        Err("stream exploded".into())
    }

    async fn reset(self: Pin<&mut Self>) -> bool {
        false
    }
}

#[tokio::test]
async fn request_body_errors_are_body_stream_failures() {
    let mock = raw_fn(|req: http::Request<RawBody>| async {
        // consume the body so the writer runs and reports its error
        let result = req.into_body().collect().await;
        let error = result.err().expect("body should abort");
        Err::<http::Response<Full<Bytes>>, BoxError>(Box::new(error))
    });

    let client = Client::builder()
        .hostname("upstream")
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let error = client
        .post("/upload")
        .body(ExplodingBody)
        .send()
        .await
        .unwrap_err();

    assert_eq!(
        error.kind(),
        ErrorKind::RequestFailed(FailureKind::BodyStream)
    );
    assert_eq!(error.cause().unwrap().to_string(), "stream exploded");
}

#[tokio::test]
async fn circuit_trips_after_error_volume() {
    // S,S,E,S,E,E,E,S,E,E,S: 11 commands in the current bucket, 6 errors
    let outcomes = "ssnsxxnsnxs";
    let calls = Arc::new(AtomicUsize::new(0));

    let mock_calls = calls.clone();
    let mock = raw_fn(move |_: http::Request<RawBody>| {
        let n = mock_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = outcomes.as_bytes()[n];
        async move {
            match outcome {
                b's' => Ok(json_response(200, "{}")),
                b'n' => Ok(json_response(501, "{}")),
                b'x' => Err::<_, BoxError>("connection reset".into()),
                _ => panic!("unexpected call {}", n),
            }
        }
    });

    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
        volume_threshold: 10,
        ..BreakerConfig::default()
    }));

    let client = Client::builder()
        .hostname("upstream")
        .circuit_breaker(breaker.clone())
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    for _ in 0..11 {
        let _ = client.get("/").send().await;
    }
    assert!(breaker.is_open());

    let error = client.get("/").send().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 11);

    // an open breaker rejects before any retry attempt is consumed
    let retrying = Client::builder()
        .hostname("upstream")
        .retries(3)
        .circuit_breaker(breaker.clone())
        .raw_client_builder(Raw(raw_fn(|_: http::Request<RawBody>| async {
            Ok::<_, BoxError>(json_response(200, "{}"))
        })))
        .build()
        .unwrap();

    let error = retrying.get("/").send().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::CircuitOpen);
    assert!(error.retry_errors().is_empty());
}

#[tokio::test]
async fn request_side_short_circuit() {
    struct Synthetic;

    #[async_trait]
    impl Filter for Synthetic {
        async fn request(&self, _: &mut RequestParams) -> Result<Option<Response>, BoxError> {
            let mut headers = http::HeaderMap::new();
            headers.insert("x", http::HeaderValue::from_static("y"));
            Ok(Some(Response::new(
                StatusCode::NOT_FOUND,
                headers,
                ResponseBody::Json(json!({ "foo": "bar" })),
            )))
        }
    }

    struct MarkSeen(Arc<AtomicUsize>);

    #[async_trait]
    impl Filter for MarkSeen {
        async fn response(&self, response: &mut Response) -> Result<(), BoxError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            response.body_mut().as_json_mut().unwrap()["seen"] = json!(true);
            Ok(())
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let mock_calls = calls.clone();
    let mock = raw_fn(move |_: http::Request<RawBody>| {
        mock_calls.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(json_response(200, "{}")) }
    });

    let seen = Arc::new(AtomicUsize::new(0));
    let client = Client::builder()
        .hostname("upstream")
        .filter(Synthetic)
        .filter(MarkSeen(seen.clone()))
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let response = client.get("/widgets").send().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers().get("x").unwrap(), "y");
    assert_eq!(
        response.body().as_json(),
        Some(&json!({ "foo": "bar", "seen": true })),
    );
}

#[tokio::test(start_paused = true)]
async fn global_deadline_rejects_with_user_timeout() {
    // two instant failures, then an attempt that outlives the deadline
    let calls = Arc::new(AtomicUsize::new(0));
    let mock_calls = calls.clone();
    let mock = raw_fn(move |_: http::Request<RawBody>| {
        let n = mock_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Ok::<_, BoxError>(json_response(503, "{}"))
            } else {
                time::sleep(Duration::from_millis(45)).await;
                Ok(json_response(200, "{}"))
            }
        }
    });

    let client = Client::builder()
        .hostname("upstream")
        .retries(2)
        .min_timeout(Duration::ZERO)
        .max_timeout(Duration::ZERO)
        .randomize(false)
        .drop_all_requests_after(Duration::from_millis(40))
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let error = client.get("/").send().await.unwrap_err();

    assert_eq!(
        error.kind(),
        ErrorKind::RequestFailed(FailureKind::UserTimeout)
    );
    assert_eq!(error.retry_errors().len(), 2);
    for error in error.retry_errors() {
        assert_eq!(error.kind(), ErrorKind::ResponseFilterFailed);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn per_attempt_deadline_rejects_with_user_timeout() {
    let mock = raw_fn(|_: http::Request<RawBody>| async {
        time::sleep(Duration::from_millis(50)).await;
        Ok::<_, BoxError>(json_response(200, "{}"))
    });

    let client = Client::builder()
        .hostname("upstream")
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let error = client
        .get("/")
        .drop_request_after(Duration::from_millis(20))
        .send()
        .await
        .unwrap_err();

    assert_eq!(
        error.kind(),
        ErrorKind::RequestFailed(FailureKind::UserTimeout)
    );
}

#[tokio::test(start_paused = true)]
async fn read_timeout_mid_body() {
    let mock = raw_fn(|_: http::Request<RawBody>| async {
        let frames = stream::iter(vec![Ok::<_, Infallible>(Frame::data(Bytes::from_static(
            b"partial",
        )))])
        .chain(stream::once(async {
            time::sleep(Duration::from_millis(50)).await;
            Ok(Frame::data(Bytes::from_static(b"late")))
        }));

        let response = http::Response::builder()
            .status(200)
            .header(CONTENT_TYPE, "text/plain")
            .body(StreamBody::new(Box::pin(frames)))
            .unwrap();
        Ok::<_, BoxError>(response)
    });

    let client = Client::builder()
        .hostname("upstream")
        .read_timeout(Duration::from_millis(20))
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let error = client.get("/").send().await.unwrap_err();

    assert_eq!(
        error.kind(),
        ErrorKind::RequestFailed(FailureKind::ReadTimeout)
    );
}

#[tokio::test]
async fn connect_timeouts_classify_precisely() {
    let mock = raw_fn(|_: http::Request<RawBody>| async {
        Err::<http::Response<Full<Bytes>>, BoxError>(Box::new(ConnectTimeoutError(())))
    });

    let client = Client::builder()
        .hostname("upstream")
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let error = client.get("/").send().await.unwrap_err();

    assert_eq!(
        error.kind(),
        ErrorKind::RequestFailed(FailureKind::ConnectionTimeout)
    );
}

#[tokio::test]
async fn zero_retries_surface_the_raw_error() {
    let mock = raw_fn(|_: http::Request<RawBody>| async {
        Err::<http::Response<Full<Bytes>>, BoxError>("connection reset".into())
    });

    let client = Client::builder()
        .hostname("upstream")
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let error = client.get("/").send().await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::RequestFailed(FailureKind::Network));
    assert!(error.retry_errors().is_empty());
    assert_eq!(
        error.to_string(),
        "palisade: NETWORK. connection reset"
    );
}

#[tokio::test]
async fn exhausted_retries_wrap_the_latest_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mock_calls = calls.clone();
    let mock = raw_fn(move |_: http::Request<RawBody>| {
        mock_calls.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(json_response(503, "{}")) }
    });

    let retries = Arc::new(AtomicUsize::new(0));
    let on_retry = retries.clone();
    let client = Client::builder()
        .hostname("upstream")
        .retries(2)
        .min_timeout(Duration::ZERO)
        .max_timeout(Duration::ZERO)
        .randomize(false)
        .on_retry(move |_, _, _| {
            on_retry.fetch_add(1, Ordering::SeqCst);
        })
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let error = client.get("/").send().await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::MaxRetriesReached);
    assert_eq!(error.retry_errors().len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(retries.load(Ordering::SeqCst), 2);

    let cause = error.cause().unwrap().downcast_ref::<Error>().unwrap();
    assert_eq!(cause.kind(), ErrorKind::ResponseFilterFailed);
}

#[tokio::test]
async fn should_retry_vetoes_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mock_calls = calls.clone();
    let mock = raw_fn(move |_: http::Request<RawBody>| {
        mock_calls.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(json_response(503, "{}")) }
    });

    let client = Client::builder()
        .hostname("upstream")
        .retries(3)
        .should_retry(|error, _| error.kind() != ErrorKind::ResponseFilterFailed)
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let error = client.get("/").send().await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ShouldRetryRejected);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let cause = error.cause().unwrap().downcast_ref::<Error>().unwrap();
    assert_eq!(cause.kind(), ErrorKind::ResponseFilterFailed);
}

#[tokio::test]
async fn per_request_breaker_factory() {
    let built = Arc::new(AtomicUsize::new(0));
    let factory_built = built.clone();

    let mock = raw_fn(|_: http::Request<RawBody>| async {
        Ok::<_, BoxError>(json_response(200, "{}"))
    });

    let client = Client::builder()
        .hostname("upstream")
        .breaker_factory(move |_| {
            factory_built.fetch_add(1, Ordering::SeqCst);
            Arc::new(CircuitBreaker::new(BreakerConfig::default()))
        })
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    client.get("/").send().await.unwrap();
    client.get("/").send().await.unwrap();

    assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn per_request_timing_override_wins() {
    let mock = raw_fn(|_: http::Request<RawBody>| async {
        Ok::<_, BoxError>(json_response(200, "{}"))
    });

    let client = Client::builder()
        .hostname("upstream")
        .timing(true)
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let with_timings = client.get("/").send().await.unwrap();
    assert!(with_timings.timings().is_some());

    let without = client.get("/").timing(false).send().await.unwrap();
    assert!(without.timings().is_none());
}

struct EventLog(Mutex<Vec<&'static str>>);

impl RequestObserver for EventLog {
    fn on_event(&self, event: &RequestEvent) {
        let label = match event {
            RequestEvent::Started { .. } => "started",
            RequestEvent::SocketAssigned => "socket",
            RequestEvent::DnsResolved => "dns",
            RequestEvent::TcpConnected => "tcp",
            RequestEvent::TlsConnected => "tls",
            RequestEvent::HeadersReceived { .. } => "headers",
            RequestEvent::Chunk { .. } => "chunk",
            RequestEvent::BodyComplete { .. } => "body-complete",
            RequestEvent::Failed { .. } => "failed",
        };
        self.0.lock().push(label);
    }
}

#[tokio::test]
async fn observer_sees_the_event_sequence() {
    test(
        1,
        |_| async { full(200, "application/json", b"{\"a\":1}".to_vec()) },
        |builder| async move {
            let log = Arc::new(EventLog(Mutex::new(vec![])));

            let client = builder.build().unwrap();
            client
                .get("/")
                .observer(log.clone())
                .send()
                .await
                .unwrap();

            let events = log.0.lock().clone();
            assert_eq!(events[0], "started");
            assert_eq!(events[1], "socket");
            assert_eq!(events[2], "dns");
            assert_eq!(events[3], "tcp");
            assert_eq!(events[4], "headers");
            assert!(events.contains(&"chunk"));
            assert_eq!(events.last(), Some(&"body-complete"));
        },
    )
    .await;
}

#[tokio::test]
async fn bytes_body_retries_after_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mock_calls = calls.clone();
    let mock = raw_fn(move |req: http::Request<RawBody>| {
        let n = mock_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, Bytes::from_static(b"payload"));
            if n == 0 {
                Ok::<_, BoxError>(json_response(503, "{}"))
            } else {
                Ok(json_response(200, "{}"))
            }
        }
    });

    let client = Client::builder()
        .hostname("upstream")
        .retries(1)
        .min_timeout(Duration::ZERO)
        .max_timeout(Duration::ZERO)
        .randomize(false)
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    let response = client
        .put("/widgets")
        .body(BytesBody::new("payload", http::HeaderValue::from_static("text/plain")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.retry_errors().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unresettable_body_stops_the_retry_loop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mock_calls = calls.clone();
    let mock = raw_fn(move |req: http::Request<RawBody>| {
        mock_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            let _ = req.into_body().collect().await;
            Ok::<_, BoxError>(json_response(503, "{}"))
        }
    });

    let client = Client::builder()
        .hostname("upstream")
        .retries(3)
        .min_timeout(Duration::ZERO)
        .max_timeout(Duration::ZERO)
        .randomize(false)
        .raw_client_builder(Raw(mock))
        .build()
        .unwrap();

    // StreamedBody refuses to reset, so only one attempt is made
    let error = client
        .post("/upload")
        .body(StreamedBody)
        .send()
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ResponseFilterFailed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn config_construction() {
    let config = r#"
        {
            "hostname": "widgets.my-network.com",
            "name": "widgets",
            "scheme": "https",
            "retries": 3,
            "min-timeout": "100ms",
            "max-timeout": "1s"
        }
    "#;
    let config = serde_json::from_str::<palisade_config::ServiceConfig>(config).unwrap();

    let client = Client::new(&config).unwrap();
    assert_eq!(client.name(), "widgets");
    assert_eq!(client.hostname(), "widgets.my-network.com");
}
