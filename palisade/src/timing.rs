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
use crate::observe::{RequestEvent, RequestObserver};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Times elapsed since the start of an attempt at each transport event.
///
/// Every component is optional: an event that did not occur (for example the
/// TLS handshake of a plaintext connection) leaves its slot empty. When the
/// transport reuses a pre-connected resource the `lookup`, `connect`, and
/// `secure_connect` events collapse onto `socket`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Timings {
    pub(crate) socket: Option<Duration>,
    pub(crate) lookup: Option<Duration>,
    pub(crate) connect: Option<Duration>,
    pub(crate) secure_connect: Option<Duration>,
    pub(crate) response: Option<Duration>,
    pub(crate) end: Option<Duration>,
}

impl Timings {
    /// Time at which the transport assigned a socket to the attempt.
    pub fn socket(&self) -> Option<Duration> {
        self.socket
    }

    /// Time at which DNS resolution completed.
    pub fn lookup(&self) -> Option<Duration> {
        self.lookup
    }

    /// Time at which the TCP connection was established.
    pub fn connect(&self) -> Option<Duration> {
        self.connect
    }

    /// Time at which the TLS session was established.
    pub fn secure_connect(&self) -> Option<Duration> {
        self.secure_connect
    }

    /// Time at which the first byte of the response headers arrived.
    pub fn response(&self) -> Option<Duration> {
        self.response
    }

    /// Time at which the response body was fully received.
    pub fn end(&self) -> Option<Duration> {
        self.end
    }

    /// Returns the derived per-phase view of the timings.
    pub fn phases(&self) -> TimingPhases {
        fn diff(end: Option<Duration>, start: Option<Duration>) -> Option<Duration> {
            Some(end?.saturating_sub(start?))
        }

        TimingPhases {
            wait: self.socket,
            dns: diff(self.lookup, self.socket),
            tcp: diff(self.connect, self.lookup),
            tls: diff(self.secure_connect, self.connect),
            first_byte: diff(self.response, self.secure_connect),
            download: diff(self.end, self.response),
            total: self.end,
        }
    }
}

/// Durations of the individual phases of an attempt, derived from [`Timings`].
///
/// A phase is absent when either of its endpoints is absent.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TimingPhases {
    pub(crate) wait: Option<Duration>,
    pub(crate) dns: Option<Duration>,
    pub(crate) tcp: Option<Duration>,
    pub(crate) tls: Option<Duration>,
    pub(crate) first_byte: Option<Duration>,
    pub(crate) download: Option<Duration>,
    pub(crate) total: Option<Duration>,
}

impl TimingPhases {
    /// Time spent waiting for a socket.
    pub fn wait(&self) -> Option<Duration> {
        self.wait
    }

    /// Time spent resolving DNS.
    pub fn dns(&self) -> Option<Duration> {
        self.dns
    }

    /// Time spent establishing the TCP connection.
    pub fn tcp(&self) -> Option<Duration> {
        self.tcp
    }

    /// Time spent in the TLS handshake.
    pub fn tls(&self) -> Option<Duration> {
        self.tls
    }

    /// Time spent waiting for the first byte of the response.
    pub fn first_byte(&self) -> Option<Duration> {
        self.first_byte
    }

    /// Time spent downloading the response body.
    pub fn download(&self) -> Option<Duration> {
        self.download
    }

    /// Total time of the attempt.
    pub fn total(&self) -> Option<Duration> {
        self.total
    }
}

/// Records transport events for a single attempt against a monotonic clock.
///
/// A recorder is handed to the raw client through the request's extensions.
/// Raw client implementations report transport milestones through the public
/// event methods; each event is recorded at most once, and later signals for
/// an already-recorded event are ignored.
pub struct TimingRecorder {
    start: Instant,
    enabled: bool,
    observer: Option<Arc<dyn RequestObserver>>,
    slots: Mutex<Timings>,
}

impl TimingRecorder {
    pub(crate) fn new(enabled: bool, observer: Option<Arc<dyn RequestObserver>>) -> TimingRecorder {
        TimingRecorder {
            start: Instant::now(),
            enabled,
            observer,
            slots: Mutex::new(Timings::default()),
        }
    }

    fn record<F>(&self, slot: F)
    where
        F: FnOnce(&mut Timings) -> &mut Option<Duration>,
    {
        let elapsed = self.start.elapsed();
        let mut slots = self.slots.lock();
        let slot = slot(&mut slots);
        if slot.is_none() {
            *slot = Some(elapsed);
        }
    }

    pub(crate) fn emit(&self, event: RequestEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }

    /// Records the transport assigning a socket to the attempt.
    pub fn socket_assigned(&self) {
        self.record(|t| &mut t.socket);
        self.emit(RequestEvent::SocketAssigned);
    }

    /// Records the completion of DNS resolution.
    pub fn dns_resolved(&self) {
        self.record(|t| &mut t.lookup);
        self.emit(RequestEvent::DnsResolved);
    }

    /// Records the establishment of the TCP connection.
    pub fn tcp_connected(&self) {
        self.record(|t| &mut t.connect);
        self.emit(RequestEvent::TcpConnected);
    }

    /// Records the establishment of the TLS session.
    pub fn tls_connected(&self) {
        self.record(|t| &mut t.secure_connect);
        self.emit(RequestEvent::TlsConnected);
    }

    /// Records that the transport reused a pre-connected resource.
    ///
    /// The lookup, connect, and secure-connect events collapse onto the socket
    /// event, since no name resolution or handshakes took place.
    pub fn socket_reused(&self) {
        let mut slots = self.slots.lock();
        let socket = match slots.socket {
            Some(socket) => socket,
            None => {
                let socket = self.start.elapsed();
                slots.socket = Some(socket);
                socket
            }
        };
        slots.lookup.get_or_insert(socket);
        slots.connect.get_or_insert(socket);
        slots.secure_connect.get_or_insert(socket);
    }

    pub(crate) fn response_received(&self) {
        self.record(|t| &mut t.response);
    }

    pub(crate) fn end_received(&self) {
        self.record(|t| &mut t.end);
    }

    pub(crate) fn snapshot(&self) -> Option<Timings> {
        if self.enabled {
            Some(*self.slots.lock())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn timings(millis: [Option<u64>; 6]) -> Timings {
        let d = |m: Option<u64>| m.map(Duration::from_millis);
        Timings {
            socket: d(millis[0]),
            lookup: d(millis[1]),
            connect: d(millis[2]),
            secure_connect: d(millis[3]),
            response: d(millis[4]),
            end: d(millis[5]),
        }
    }

    #[test]
    fn phases_from_complete_timings() {
        let phases = timings([Some(1), Some(3), Some(6), Some(10), Some(30), Some(45)]).phases();

        assert_eq!(phases.wait(), Some(Duration::from_millis(1)));
        assert_eq!(phases.dns(), Some(Duration::from_millis(2)));
        assert_eq!(phases.tcp(), Some(Duration::from_millis(3)));
        assert_eq!(phases.tls(), Some(Duration::from_millis(4)));
        assert_eq!(phases.first_byte(), Some(Duration::from_millis(20)));
        assert_eq!(phases.download(), Some(Duration::from_millis(15)));
        assert_eq!(phases.total(), Some(Duration::from_millis(45)));
    }

    #[test]
    fn phases_absent_without_endpoints() {
        let phases = timings([Some(1), Some(3), Some(6), None, Some(30), None]).phases();

        assert_eq!(phases.tls(), None);
        assert_eq!(phases.first_byte(), None);
        assert_eq!(phases.download(), None);
        assert_eq!(phases.total(), None);
        assert_eq!(phases.dns(), Some(Duration::from_millis(2)));
    }

    #[test]
    fn events_record_once() {
        let recorder = TimingRecorder::new(true, None);
        recorder.socket_assigned();
        let first = recorder.snapshot().unwrap().socket();

        std::thread::sleep(Duration::from_millis(5));
        recorder.socket_assigned();

        assert_eq!(recorder.snapshot().unwrap().socket(), first);
    }

    #[test]
    fn reused_socket_collapses_connect_events() {
        let recorder = TimingRecorder::new(true, None);
        recorder.socket_assigned();
        recorder.socket_reused();

        let timings = recorder.snapshot().unwrap();
        assert_eq!(timings.lookup(), timings.socket());
        assert_eq!(timings.connect(), timings.socket());
        assert_eq!(timings.secure_connect(), timings.socket());
    }

    #[test]
    fn disabled_recorder_has_no_timings() {
        let recorder = TimingRecorder::new(false, None);
        recorder.socket_assigned();

        assert_eq!(recorder.snapshot(), None);
    }
}
