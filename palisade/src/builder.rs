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
//! The client builder.
use crate::breaker::{self, CircuitBreaker};
use crate::client::{BreakerSource, Client, ClientState};
use crate::errors::Error;
use crate::filter::{Filter, ServerErrorFilter};
use crate::raw::{BuildRawClient, DefaultRawClientBuilder};
use crate::request::RequestParams;
use crate::retry::{RetryConfig, RetrySchedule};
use crate::rng::ClientRng;
use http::uri::Scheme;
use palisade_config::ServiceConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DEFAULT_NAME: &str = "palisade";

/// A builder to construct [`Client`]s.
pub struct Builder<T = Complete>(T);

impl<T> std::fmt::Debug for Builder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder").finish_non_exhaustive()
    }
}

/// The hostname builder stage.
pub struct HostStage(());

/// The complete builder stage.
pub struct Complete<T = DefaultRawClientBuilder> {
    name: String,
    hostname: String,
    scheme: Scheme,
    port: Option<u16>,
    pathname: String,
    query: BTreeMap<String, Vec<String>>,
    filters: Vec<Arc<dyn Filter>>,
    retry: RetryConfig,
    should_retry: Arc<dyn Fn(&Error, &RequestParams) -> bool + Sync + Send>,
    on_retry: Arc<dyn Fn(u32, &Error, &RequestParams) + Sync + Send>,
    breakers: BreakerSource,
    connect_timeout: Duration,
    read_timeout: Duration,
    drop_request_after: Option<Duration>,
    drop_all_requests_after: Option<Duration>,
    timing: bool,
    auto_parse_json: bool,
    auto_decode_utf8: bool,
    rng_seed: Option<u64>,
    raw_client_builder: T,
}

impl Default for Builder<HostStage> {
    #[inline]
    fn default() -> Self {
        Builder::new()
    }
}

impl Builder<HostStage> {
    /// Creates a new builder with default settings.
    #[inline]
    pub fn new() -> Self {
        Builder(HostStage(()))
    }

    /// Sets the hostname this client will send requests to.
    pub fn hostname(self, hostname: &str) -> Builder {
        Builder(Complete {
            name: DEFAULT_NAME.to_string(),
            hostname: hostname.to_string(),
            scheme: Scheme::HTTPS,
            port: None,
            pathname: "/".to_string(),
            query: BTreeMap::new(),
            filters: vec![Arc::new(ServerErrorFilter)],
            retry: RetryConfig::default(),
            should_retry: Arc::new(|_, _| true),
            on_retry: Arc::new(|_, _, _| {}),
            breakers: BreakerSource::Disabled,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            drop_request_after: None,
            drop_all_requests_after: None,
            timing: true,
            auto_parse_json: true,
            auto_decode_utf8: true,
            rng_seed: None,
            raw_client_builder: DefaultRawClientBuilder,
        })
    }

    /// Parses a URL string into the builder's default request options.
    ///
    /// The URL's scheme, hostname, port, path, and query become the client's
    /// defaults; the pathname defaults to `/`.
    pub fn base_url(self, url: &str) -> Result<Builder, Error> {
        let url = Url::parse(url).map_err(|e| Error::internal(DEFAULT_NAME, Box::new(e)))?;

        let scheme = match url.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => {
                return Err(Error::internal(
                    DEFAULT_NAME,
                    format!("unsupported scheme {}", other).into(),
                ))
            }
        };
        let hostname = url
            .host_str()
            .ok_or_else(|| Error::internal(DEFAULT_NAME, "URL has no hostname".into()))?;

        let mut query = BTreeMap::<String, Vec<String>>::new();
        for (name, value) in url.query_pairs() {
            query
                .entry(name.into_owned())
                .or_default()
                .push(value.into_owned());
        }

        let mut builder = self.hostname(hostname).scheme(scheme).pathname(url.path());
        builder.0.query = query;
        builder.0.port = url.port();

        Ok(builder)
    }

    /// Applies configuration settings from a [`ServiceConfig`] to the builder.
    pub fn from_config(self, config: &ServiceConfig) -> Result<Builder, Error> {
        let hostname = config.hostname().ok_or_else(|| {
            Error::internal(DEFAULT_NAME, "hostname missing from configuration".into())
        })?;

        let mut builder = self.hostname(hostname);

        if let Some(name) = config.name() {
            builder = builder.name(name);
        }

        if let Some(scheme) = config.scheme() {
            let scheme = Scheme::try_from(scheme)
                .map_err(|e| Error::internal(DEFAULT_NAME, Box::new(e)))?;
            builder = builder.scheme(scheme);
        }

        if let Some(port) = config.port() {
            builder = builder.port(port);
        }

        if let Some(pathname) = config.pathname() {
            builder = builder.pathname(pathname);
        }

        if let Some(connect_timeout) = config.connect_timeout() {
            builder = builder.connect_timeout(connect_timeout);
        }

        if let Some(read_timeout) = config.read_timeout() {
            builder = builder.read_timeout(read_timeout);
        }

        if let Some(limit) = config.drop_request_after() {
            builder = builder.drop_request_after(limit);
        }

        if let Some(limit) = config.drop_all_requests_after() {
            builder = builder.drop_all_requests_after(limit);
        }

        if let Some(retries) = config.retries() {
            builder = builder.retries(retries);
        }

        if let Some(factor) = config.backoff_factor() {
            builder = builder.backoff_factor(factor);
        }

        if let Some(min_timeout) = config.min_timeout() {
            builder = builder.min_timeout(min_timeout);
        }

        if let Some(max_timeout) = config.max_timeout() {
            builder = builder.max_timeout(max_timeout);
        }

        if let Some(randomize) = config.randomize() {
            builder = builder.randomize(randomize);
        }

        if let Some(timing) = config.timing() {
            builder = builder.timing(timing);
        }

        if let Some(auto_parse_json) = config.auto_parse_json() {
            builder = builder.auto_parse_json(auto_parse_json);
        }

        if let Some(auto_decode_utf8) = config.auto_decode_utf8() {
            builder = builder.auto_decode_utf8(auto_decode_utf8);
        }

        if let Some(breaker) = config.breaker() {
            let mut breaker_config = breaker::BreakerConfig::default();
            if let Some(window_duration) = breaker.window_duration() {
                breaker_config.window_duration = window_duration;
            }
            if let Some(num_buckets) = breaker.num_buckets() {
                breaker_config.num_buckets = num_buckets;
            }
            if let Some(error_threshold) = breaker.error_threshold() {
                breaker_config.error_threshold = error_threshold;
            }
            if let Some(volume_threshold) = breaker.volume_threshold() {
                breaker_config.volume_threshold = volume_threshold;
            }
            if let Some(wait) = breaker.wait_duration_in_open_state() {
                breaker_config.wait_duration_in_open_state = Some(wait);
            }
            if let Some(timeout_duration) = breaker.timeout_duration() {
                breaker_config.timeout_duration = timeout_duration;
            }
            builder = builder.breaker(breaker_config);
        }

        Ok(builder)
    }
}

impl<T> Builder<Complete<T>> {
    /// Sets the client's name.
    ///
    /// The name prefixes every error message produced by the client. It
    /// defaults to `palisade`.
    pub fn name(mut self, name: &str) -> Self {
        self.0.name = name.to_string();
        self
    }

    /// Returns the builder's configured name.
    pub fn get_name(&self) -> &str {
        &self.0.name
    }

    /// Returns the builder's configured hostname.
    pub fn get_hostname(&self) -> &str {
        &self.0.hostname
    }

    /// Sets the scheme used for requests.
    ///
    /// Defaults to `https`.
    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.0.scheme = scheme;
        self
    }

    /// Returns the builder's configured scheme.
    pub fn get_scheme(&self) -> &Scheme {
        &self.0.scheme
    }

    /// Sets the port used for requests.
    ///
    /// Defaults to the scheme's well-known port.
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = Some(port);
        self
    }

    /// Returns the builder's configured port, if one was set.
    pub fn get_port(&self) -> Option<u16> {
        self.0.port
    }

    /// Sets the default pathname of requests.
    ///
    /// Defaults to `/`.
    pub fn pathname(mut self, pathname: &str) -> Self {
        self.0.pathname = pathname.to_string();
        self
    }

    /// Returns the builder's configured default pathname.
    pub fn get_pathname(&self) -> &str {
        &self.0.pathname
    }

    /// Returns the builder's configured default query parameters.
    pub fn get_query(&self) -> &BTreeMap<String, Vec<String>> {
        &self.0.query
    }

    /// Appends a filter to the pipeline.
    ///
    /// Filters run in the order they are added; the built-in filter failing
    /// responses with a status of 500 or above is always first.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Filter + 'static,
    {
        self.0.filters.push(Arc::new(filter));
        self
    }

    /// Sets the number of times a failed call is retried.
    ///
    /// Defaults to 0.
    pub fn retries(mut self, retries: u32) -> Self {
        self.0.retry.retries = retries;
        self
    }

    /// Sets the exponential growth factor of the backoff schedule.
    ///
    /// Defaults to 2.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.0.retry.factor = factor;
        self
    }

    /// Sets the lower bound of a single backoff delay.
    ///
    /// Defaults to 200 milliseconds.
    pub fn min_timeout(mut self, min_timeout: Duration) -> Self {
        self.0.retry.min_timeout = min_timeout;
        self
    }

    /// Sets the upper bound of a single backoff delay.
    ///
    /// Defaults to 400 milliseconds.
    pub fn max_timeout(mut self, max_timeout: Duration) -> Self {
        self.0.retry.max_timeout = max_timeout;
        self
    }

    /// Sets whether backoff delays are scaled by a random factor in `[1, 2)`.
    ///
    /// Defaults to true.
    pub fn randomize(mut self, randomize: bool) -> Self {
        self.0.retry.randomize = randomize;
        self
    }

    /// Sets the policy deciding whether a failed attempt is retried.
    ///
    /// The policy receives the typed error of the failed attempt and the
    /// call's request parameters. The default policy retries every error.
    pub fn should_retry<F>(mut self, should_retry: F) -> Self
    where
        F: Fn(&Error, &RequestParams) -> bool + Sync + Send + 'static,
    {
        self.0.should_retry = Arc::new(should_retry);
        self
    }

    /// Sets a callback invoked before each retry with the ordinal of the next
    /// attempt, the error of the failed one, and the call's parameters.
    pub fn on_retry<F>(mut self, on_retry: F) -> Self
    where
        F: Fn(u32, &Error, &RequestParams) + Sync + Send + 'static,
    {
        self.0.on_retry = Arc::new(on_retry);
        self
    }

    /// Installs a circuit breaker shared by all of the client's calls.
    ///
    /// No breaker is installed by default.
    pub fn breaker(mut self, config: breaker::BreakerConfig) -> Self {
        self.0.breakers = BreakerSource::Shared(Arc::new(CircuitBreaker::new(config)));
        self
    }

    /// Installs an existing circuit breaker shared by all of the client's
    /// calls.
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.0.breakers = BreakerSource::Shared(breaker);
        self
    }

    /// Installs a factory producing a circuit breaker for each call.
    pub fn breaker_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&RequestParams) -> Arc<CircuitBreaker> + Sync + Send + 'static,
    {
        self.0.breakers = BreakerSource::PerRequest(Arc::new(factory));
        self
    }

    /// Sets the default connection timeout of attempts.
    ///
    /// Defaults to 1 second.
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.0.connect_timeout = connect_timeout;
        self
    }

    /// Returns the builder's configured connection timeout.
    pub fn get_connect_timeout(&self) -> Duration {
        self.0.connect_timeout
    }

    /// Sets the default read timeout of attempts.
    ///
    /// Defaults to 2 seconds.
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.0.read_timeout = read_timeout;
        self
    }

    /// Returns the builder's configured read timeout.
    pub fn get_read_timeout(&self) -> Duration {
        self.0.read_timeout
    }

    /// Sets a default end-to-end deadline for each individual attempt.
    ///
    /// Unset by default.
    pub fn drop_request_after(mut self, limit: Duration) -> Self {
        self.0.drop_request_after = Some(limit);
        self
    }

    /// Sets a default global deadline for whole calls, across all attempts.
    ///
    /// Unset by default.
    pub fn drop_all_requests_after(mut self, limit: Duration) -> Self {
        self.0.drop_all_requests_after = Some(limit);
        self
    }

    /// Sets whether attempts record timings.
    ///
    /// Defaults to true. An explicit per-request setting wins over this
    /// value.
    pub fn timing(mut self, timing: bool) -> Self {
        self.0.timing = timing;
        self
    }

    /// Sets whether JSON response bodies are parsed automatically.
    ///
    /// Defaults to true.
    pub fn auto_parse_json(mut self, auto_parse_json: bool) -> Self {
        self.0.auto_parse_json = auto_parse_json;
        self
    }

    /// Sets whether response bodies are decoded to UTF-8 strings.
    ///
    /// Defaults to true.
    pub fn auto_decode_utf8(mut self, auto_decode_utf8: bool) -> Self {
        self.0.auto_decode_utf8 = auto_decode_utf8;
        self
    }

    /// Sets a seed used to initialize the client's random number generator.
    ///
    /// If set, clients created with the same configuration will generate the
    /// same backoff schedules.
    ///
    /// Defaults to no seed.
    pub fn rng_seed(mut self, rng_seed: u64) -> Self {
        self.0.rng_seed = Some(rng_seed);
        self
    }

    /// Returns the builder's configured RNG seed.
    pub fn get_rng_seed(&self) -> Option<u64> {
        self.0.rng_seed
    }

    /// Sets the raw client builder.
    ///
    /// Defaults to [`DefaultRawClientBuilder`].
    pub fn raw_client_builder<U>(self, raw_client_builder: U) -> Builder<Complete<U>> {
        Builder(Complete {
            name: self.0.name,
            hostname: self.0.hostname,
            scheme: self.0.scheme,
            port: self.0.port,
            pathname: self.0.pathname,
            query: self.0.query,
            filters: self.0.filters,
            retry: self.0.retry,
            should_retry: self.0.should_retry,
            on_retry: self.0.on_retry,
            breakers: self.0.breakers,
            connect_timeout: self.0.connect_timeout,
            read_timeout: self.0.read_timeout,
            drop_request_after: self.0.drop_request_after,
            drop_all_requests_after: self.0.drop_all_requests_after,
            timing: self.0.timing,
            auto_parse_json: self.0.auto_parse_json,
            auto_decode_utf8: self.0.auto_decode_utf8,
            rng_seed: self.0.rng_seed,
            raw_client_builder,
        })
    }
}

impl<T> Builder<Complete<T>>
where
    T: BuildRawClient,
{
    /// Creates a new [`Client`].
    ///
    /// Fails synchronously when the configuration is invalid: an empty
    /// hostname or a retry minimum timeout exceeding the maximum.
    pub fn build(&self) -> Result<Client<T::RawClient>, Error> {
        let config = &self.0;

        if config.hostname.is_empty() {
            return Err(Error::internal(&config.name, "hostname is empty".into()));
        }

        RetrySchedule::new(&config.retry)
            .map_err(|e| Error::internal(&config.name, Box::new(e)))?;

        let raw = config.raw_client_builder.build_raw_client(self)?;

        let port = config.port.unwrap_or(if config.scheme == Scheme::HTTPS {
            443
        } else {
            80
        });

        Ok(Client::from_state(ClientState {
            raw,
            name: config.name.clone(),
            hostname: config.hostname.clone(),
            scheme: config.scheme.clone(),
            port,
            pathname: config.pathname.clone(),
            query: config.query.clone(),
            filters: config.filters.clone(),
            retry: config.retry.clone(),
            should_retry: config.should_retry.clone(),
            on_retry: config.on_retry.clone(),
            breakers: config.breakers.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            drop_request_after: config.drop_request_after,
            drop_all_requests_after: config.drop_all_requests_after,
            timing: config.timing,
            auto_parse_json: config.auto_parse_json,
            auto_decode_utf8: config.auto_decode_utf8,
            rng: ClientRng::new(config.rng_seed),
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn url_constructor_matches_explicit_configuration() {
        let from_url = Builder::new()
            .base_url("http://widgets.my-network.com:8080/api/widgets?color=red&color=blue&limit=10")
            .unwrap();

        let explicit = Builder::new()
            .hostname("widgets.my-network.com")
            .scheme(Scheme::HTTP)
            .port(8080)
            .pathname("/api/widgets");

        assert_eq!(from_url.get_hostname(), explicit.get_hostname());
        assert_eq!(from_url.get_scheme(), explicit.get_scheme());
        assert_eq!(from_url.get_port(), explicit.get_port());
        assert_eq!(from_url.get_pathname(), explicit.get_pathname());
        assert_eq!(
            from_url.get_query().get("color").map(Vec::as_slice),
            Some(&["red".to_string(), "blue".to_string()][..]),
        );
        assert_eq!(
            from_url.get_query().get("limit").map(Vec::as_slice),
            Some(&["10".to_string()][..]),
        );
    }

    #[test]
    fn url_pathname_defaults_to_root() {
        let builder = Builder::new()
            .base_url("https://widgets.my-network.com")
            .unwrap();

        assert_eq!(builder.get_pathname(), "/");
        assert_eq!(builder.get_port(), None);
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let error = Builder::new()
            .base_url("ftp://widgets.my-network.com")
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Internal);
    }

    #[test]
    fn inverted_retry_bounds_fail_build() {
        let error = Builder::new()
            .hostname("widgets.my-network.com")
            .min_timeout(Duration::from_millis(500))
            .max_timeout(Duration::from_millis(100))
            .build()
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Internal);
    }

    #[test]
    fn empty_hostname_fails_build() {
        let error = Builder::new().hostname("").build().unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Internal);
    }
}
