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
use crate::attempt::{self, AttemptEnv};
use crate::body::{Body, ResetTrackingBody};
use crate::breaker::CircuitBreaker;
use crate::client::{BreakerSource, Client, ClientState};
use crate::errors::{BoxError, Error};
use crate::filter;
use crate::raw::{RawBody, Service};
use crate::request::{Request, RequestParams};
use crate::response::Response;
use crate::retry::Operation;
use bytes::Bytes;
use http_body::Body as HttpBody;
use parking_lot::Mutex;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, info};

pub(crate) async fn send<T, B>(client: &Client<T>, request: Request<'_>) -> Result<Response, Error>
where
    T: Service<http::Request<RawBody>, Response = http::Response<B>> + Sync + Send,
    T::Error: Into<BoxError>,
    B: HttpBody<Data = Bytes> + Send + Unpin,
    B::Error: Into<BoxError>,
{
    let state = client.state();
    let name = state.name.as_str();

    let params = Arc::new(request.params);
    let mut body = request.body;

    let breaker = match &state.breakers {
        BreakerSource::Disabled => None,
        BreakerSource::Shared(breaker) => Some(breaker.clone()),
        BreakerSource::PerRequest(factory) => Some(factory(&params)),
    };

    let operation = Operation::with_rng(&state.retry, &state.rng)
        .map_err(|e| Error::internal(name, Box::new(e)))?;

    // shared with the deadline arm below, which reports the errors recorded
    // up to the moment the deadline fired
    let retry_errors = Mutex::new(Vec::new());

    let drive = drive(
        state,
        name,
        &params,
        body.as_mut().map(|b| b.as_mut()),
        breaker.as_ref(),
        operation,
        &retry_errors,
    );

    match params.drop_all_requests_after() {
        Some(limit) => {
            tokio::pin!(drive);
            tokio::select! {
                result = &mut drive => result,
                _ = time::sleep(limit) => {
                    info!(client = name, "global deadline elapsed, abandoning the call");
                    let mut error = Error::user_timeout(name);
                    error.set_params(params.clone());
                    error.set_retry_errors(mem::take(&mut *retry_errors.lock()));
                    Err(error)
                }
            }
        }
        None => drive.await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive<'a, 'b, T, B>(
    state: &ClientState<T>,
    name: &str,
    params: &Arc<RequestParams>,
    mut body: Option<Pin<&'a mut ResetTrackingBody<dyn Body + Sync + Send + 'b>>>,
    breaker: Option<&Arc<CircuitBreaker>>,
    mut operation: Operation,
    retry_errors: &Mutex<Vec<Error>>,
) -> Result<Response, Error>
where
    T: Service<http::Request<RawBody>, Response = http::Response<B>> + Sync + Send,
    T::Error: Into<BoxError>,
    B: HttpBody<Data = Bytes> + Send + Unpin,
    B::Error: Into<BoxError>,
{
    let mut attempt_number = operation.attempt();

    loop {
        // an open breaker rejects the call before any attempt is consumed
        let permit = match breaker {
            None => None,
            Some(breaker) => match breaker.acquire() {
                Some(permit) => Some(permit),
                None => {
                    let mut error = Error::circuit_open(name);
                    error.set_params(params.clone());
                    error.set_retry_errors(mem::take(&mut *retry_errors.lock()));
                    return Err(error);
                }
            },
        };

        debug!(client = name, attempt = attempt_number, "dispatching attempt");

        let raw = &state.raw;
        let env = AttemptEnv {
            name,
            auto_parse_json: state.auto_parse_json,
            auto_decode_utf8: state.auto_decode_utf8,
        };
        let attempt_body = body.as_mut().map(|b| b.as_mut());
        let result = filter::execute(name, &state.filters, (**params).clone(), move |filtered| {
            attempt::execute(raw, env, Arc::new(filtered), attempt_body)
        })
        .await;

        let error = match result {
            Ok(mut response) => {
                if let Some(permit) = &permit {
                    permit.success();
                }
                response.set_retry_errors(mem::take(&mut *retry_errors.lock()));
                return Ok(response);
            }
            Err(error) => {
                if let Some(permit) = &permit {
                    permit.failure();
                }
                error
            }
        };

        if !(state.should_retry)(&error, params.as_ref()) {
            info!(client = name, "retry policy rejected the failed attempt");
            let prior = mem::take(&mut *retry_errors.lock());
            let mut error = Error::should_retry_rejected(name, error, prior);
            error.set_params(params.clone());
            return Err(error);
        }

        if operation.remaining() == 0 {
            if state.retry.retries == 0 {
                // callers that disabled retries see the raw typed error
                return Err(error);
            }
            info!(client = name, "exceeded retry limits");
            let prior = mem::take(&mut *retry_errors.lock());
            let mut error = Error::max_retries_reached(name, error, prior);
            error.set_params(params.clone());
            return Err(error);
        }

        if let Some(b) = &mut body {
            let mut b = b.as_mut();
            if b.needs_reset() && !b.as_mut().reset().await {
                info!(client = name, "unable to reset request body when retrying");
                let mut error = error;
                error.set_retry_errors(mem::take(&mut *retry_errors.lock()));
                return Err(error);
            }
        }

        let next = operation.attempts() + 1;
        (state.on_retry)(next, &error, params.as_ref());
        info!(client = name, attempt = next, "retrying failed request");
        retry_errors.lock().push(error);

        match operation.retry(false).await {
            Some(ordinal) => attempt_number = ordinal,
            None => {
                return Err(Error::internal(
                    name,
                    "retry schedule exhausted unexpectedly".into(),
                ))
            }
        }
    }
}
