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
use super::*;

#[test]
fn empty() {
    let config = "{}";
    let config = serde_json::from_str::<ClientsConfig>(config).unwrap();
    let expected = ClientsConfig::default();
    assert_eq!(config, expected);
}

#[test]
fn minimal() {
    let config = r#"
        {
            "clients": {
                "widgets": {
                    "hostname": "widgets.my-network.com"
                }
            }
        }
    "#;
    let config = serde_json::from_str::<ClientsConfig>(config).unwrap();
    let expected = ServiceConfig::builder()
        .name(Some("widgets".to_string()))
        .hostname(Some("widgets.my-network.com".to_string()))
        .build();
    assert_eq!(config.merged_client("widgets"), Some(expected));
}

#[test]
fn root_defaults() {
    let config = r#"
        {
            "clients": {
                "widgets": {
                    "hostname": "widgets.my-network.com"
                }
            },
            "connect-timeout": "500ms",
            "read-timeout": "11 seconds",
            "retries": 3,
            "min-timeout": "100ms",
            "max-timeout": "2s"
        }
    "#;
    let config = serde_json::from_str::<ClientsConfig>(config).unwrap();
    let expected = ServiceConfig::builder()
        .name(Some("widgets".to_string()))
        .hostname(Some("widgets.my-network.com".to_string()))
        .connect_timeout(Duration::from_millis(500))
        .read_timeout(Duration::from_secs(11))
        .retries(3u32)
        .min_timeout(Duration::from_millis(100))
        .max_timeout(Duration::from_secs(2))
        .build();
    assert_eq!(config.merged_client("widgets"), Some(expected));
}

#[test]
fn client_overrides() {
    let config = r#"
        {
            "clients": {
                "widgets": {
                    "hostname": "widgets.my-network.com",
                    "scheme": "http",
                    "port": 8080,
                    "pathname": "/api",
                    "connect-timeout": "250ms",
                    "retries": 5,
                    "randomize": false,
                    "timing": false
                }
            },
            "connect-timeout": "500ms",
            "retries": 3
        }
    "#;
    let config = serde_json::from_str::<ClientsConfig>(config).unwrap();
    let client = config.merged_client("widgets").unwrap();

    assert_eq!(client.scheme(), Some("http"));
    assert_eq!(client.port(), Some(8080));
    assert_eq!(client.pathname(), Some("/api"));
    assert_eq!(client.connect_timeout(), Some(Duration::from_millis(250)));
    assert_eq!(client.retries(), Some(5));
    assert_eq!(client.randomize(), Some(false));
    assert_eq!(client.timing(), Some(false));
}

#[test]
fn breaker_section() {
    let config = r#"
        {
            "clients": {
                "widgets": {
                    "hostname": "widgets.my-network.com",
                    "breaker": {
                        "window-duration": "10s",
                        "num-buckets": 10,
                        "error-threshold": 50.0,
                        "volume-threshold": 10,
                        "wait-duration-in-open-state": "5s",
                        "timeout-duration": "3s"
                    }
                }
            }
        }
    "#;
    let config = serde_json::from_str::<ClientsConfig>(config).unwrap();
    let client = config.merged_client("widgets").unwrap();
    let breaker = client.breaker().unwrap();

    assert_eq!(breaker.window_duration(), Some(Duration::from_secs(10)));
    assert_eq!(breaker.num_buckets(), Some(10));
    assert_eq!(breaker.error_threshold(), Some(50.0));
    assert_eq!(breaker.volume_threshold(), Some(10));
    assert_eq!(
        breaker.wait_duration_in_open_state(),
        Some(Duration::from_secs(5))
    );
    assert_eq!(breaker.timeout_duration(), Some(Duration::from_secs(3)));
}

#[test]
fn unknown_client() {
    let config = serde_json::from_str::<ClientsConfig>("{}").unwrap();
    assert_eq!(config.merged_client("nonexistent"), None);
}
