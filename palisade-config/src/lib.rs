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
//! Deserializable configuration types for `palisade` clients.
#![warn(missing_docs, clippy::all)]
// reserve the right to add non-eq config in the future
#![allow(clippy::derive_partial_eq_without_eq)]

use serde::de::Deserializer;
use serde::Deserialize;
use staged_builder::staged_builder;
use std::collections::HashMap;
use std::time::Duration;

#[cfg(test)]
mod test;

/// Configuration for a collection of clients.
///
/// This type can be constructed programmatically via the
/// `ClientsConfigBuilder` API or deserialized from e.g. a configuration file.
/// Default values for various configuration options can be set at the top
/// level in addition to being specified per-client.
///
/// # Examples
///
/// ```yaml
/// clients:
///   widget-service:
///     hostname: widgets.my-network.com
///     retries: 3
///   metadata-service:
///     hostname: metadata.my-network.com
///     read-timeout: 10s
/// # options set at this level will apply as defaults to all configured clients
/// connect-timeout: 500ms
/// ```
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[staged_builder]
#[builder(update)]
pub struct ClientsConfig {
    #[builder(map(key(type = String, into), value(type = ServiceConfig)))]
    clients: HashMap<String, ServiceConfig>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    connect_timeout: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    read_timeout: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    drop_request_after: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    drop_all_requests_after: Option<Duration>,
    #[builder(default, into)]
    retries: Option<u32>,
    #[builder(default, into)]
    backoff_factor: Option<f64>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    min_timeout: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    max_timeout: Option<Duration>,
    #[builder(default, into)]
    randomize: Option<bool>,
    #[builder(default, into)]
    breaker: Option<BreakerConfig>,
}

impl ClientsConfig {
    /// Returns the configuration for the specified client with top-level
    /// defaults applied.
    pub fn merged_client(&self, name: &str) -> Option<ServiceConfig> {
        let mut client = self.clients.get(name).cloned()?;

        if client.name.is_none() {
            client.name = Some(name.to_string());
        }

        if client.connect_timeout.is_none() {
            client.connect_timeout = self.connect_timeout;
        }

        if client.read_timeout.is_none() {
            client.read_timeout = self.read_timeout;
        }

        if client.drop_request_after.is_none() {
            client.drop_request_after = self.drop_request_after;
        }

        if client.drop_all_requests_after.is_none() {
            client.drop_all_requests_after = self.drop_all_requests_after;
        }

        if client.retries.is_none() {
            client.retries = self.retries;
        }

        if client.backoff_factor.is_none() {
            client.backoff_factor = self.backoff_factor;
        }

        if client.min_timeout.is_none() {
            client.min_timeout = self.min_timeout;
        }

        if client.max_timeout.is_none() {
            client.max_timeout = self.max_timeout;
        }

        if client.randomize.is_none() {
            client.randomize = self.randomize;
        }

        if client.breaker.is_none() {
            client.breaker = self.breaker.clone();
        }

        Some(client)
    }

    /// Returns the connection timeout applied to clients without one.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Returns the read timeout applied to clients without one.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }
}

/// The configuration for an individual client.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[staged_builder]
#[builder(update)]
pub struct ServiceConfig {
    #[builder(default, into)]
    name: Option<String>,
    #[builder(default, into)]
    hostname: Option<String>,
    #[builder(default, into)]
    scheme: Option<String>,
    #[builder(default, into)]
    port: Option<u16>,
    #[builder(default, into)]
    pathname: Option<String>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    connect_timeout: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    read_timeout: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    drop_request_after: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    drop_all_requests_after: Option<Duration>,
    #[builder(default, into)]
    retries: Option<u32>,
    #[builder(default, into)]
    backoff_factor: Option<f64>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    min_timeout: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    max_timeout: Option<Duration>,
    #[builder(default, into)]
    randomize: Option<bool>,
    #[builder(default, into)]
    timing: Option<bool>,
    #[builder(default, into)]
    auto_parse_json: Option<bool>,
    #[builder(default, into)]
    auto_decode_utf8: Option<bool>,
    #[builder(default, into)]
    breaker: Option<BreakerConfig>,
}

impl ServiceConfig {
    /// Returns the client's name, used to prefix error messages.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the hostname of the upstream service.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Returns the scheme used for requests.
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// Returns the port used for requests.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns the default pathname of requests.
    pub fn pathname(&self) -> Option<&str> {
        self.pathname.as_deref()
    }

    /// Returns the connection timeout of attempts.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Returns the read timeout of attempts.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Returns the end-to-end deadline of individual attempts.
    pub fn drop_request_after(&self) -> Option<Duration> {
        self.drop_request_after
    }

    /// Returns the global deadline of whole calls.
    pub fn drop_all_requests_after(&self) -> Option<Duration> {
        self.drop_all_requests_after
    }

    /// Returns the number of times a failed call is retried.
    pub fn retries(&self) -> Option<u32> {
        self.retries
    }

    /// Returns the exponential growth factor of the backoff schedule.
    pub fn backoff_factor(&self) -> Option<f64> {
        self.backoff_factor
    }

    /// Returns the lower bound of a single backoff delay.
    pub fn min_timeout(&self) -> Option<Duration> {
        self.min_timeout
    }

    /// Returns the upper bound of a single backoff delay.
    pub fn max_timeout(&self) -> Option<Duration> {
        self.max_timeout
    }

    /// Returns whether backoff delays are randomized.
    pub fn randomize(&self) -> Option<bool> {
        self.randomize
    }

    /// Returns whether attempts record timings.
    pub fn timing(&self) -> Option<bool> {
        self.timing
    }

    /// Returns whether JSON response bodies are parsed automatically.
    pub fn auto_parse_json(&self) -> Option<bool> {
        self.auto_parse_json
    }

    /// Returns whether response bodies are decoded to UTF-8 strings.
    pub fn auto_decode_utf8(&self) -> Option<bool> {
        self.auto_decode_utf8
    }

    /// Returns the circuit breaker configuration.
    pub fn breaker(&self) -> Option<&BreakerConfig> {
        self.breaker.as_ref()
    }
}

/// Circuit breaker configuration for a client.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[staged_builder]
#[builder(update)]
pub struct BreakerConfig {
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    window_duration: Option<Duration>,
    #[builder(default, into)]
    num_buckets: Option<usize>,
    #[builder(default, into)]
    error_threshold: Option<f64>,
    #[builder(default, into)]
    volume_threshold: Option<u64>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    wait_duration_in_open_state: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    timeout_duration: Option<Duration>,
}

impl BreakerConfig {
    /// Returns the total duration of the rolling window.
    pub fn window_duration(&self) -> Option<Duration> {
        self.window_duration
    }

    /// Returns the number of buckets in the window.
    pub fn num_buckets(&self) -> Option<usize> {
        self.num_buckets
    }

    /// Returns the error percentage above which the breaker trips.
    pub fn error_threshold(&self) -> Option<f64> {
        self.error_threshold
    }

    /// Returns the minimum number of observations before the breaker may
    /// trip.
    pub fn volume_threshold(&self) -> Option<u64> {
        self.volume_threshold
    }

    /// Returns the time spent open before a probe is allowed through.
    pub fn wait_duration_in_open_state(&self) -> Option<Duration> {
        self.wait_duration_in_open_state
    }

    /// Returns the time after which an unsettled command is charged as a
    /// timeout.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_duration
    }
}

fn de_opt_duration<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    humantime_serde::Serde::deserialize(d).map(humantime_serde::Serde::into_inner)
}
