/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Sync telemetry. We record; some external system submits.
//!
//! The engine pushes counters, gauges and events into an injected
//! [`TelemetrySink`]; nothing here buffers or uploads. Device-health
//! snapshots (storage, OS/app versions) come from outside the core and go
//! to the same sink - the core only ever emits sync metrics.

use std::sync::Mutex;
use std::time::Instant;

pub const COUNTER_PUSH_OK: &str = "sync.push.ok";
pub const COUNTER_PUSH_FAIL: &str = "sync.push.fail";
pub const COUNTER_PULL_APPLIED: &str = "sync.pull.applied";
pub const COUNTER_CONFLICTS: &str = "sync.conflicts";
pub const COUNTER_ESCALATIONS: &str = "sync.escalations";
pub const GAUGE_QUEUE_DEPTH: &str = "sync.queue.depth";
pub const GAUGE_QUEUE_OLDEST_MS: &str = "sync.queue.oldest_ms";
pub const EVENT_SYNC_START: &str = "sync_start";
pub const EVENT_SYNC_SUCCESS: &str = "sync_success";
pub const EVENT_SYNC_FAILURE: &str = "sync_failure";

pub trait TelemetrySink: Send + Sync {
    fn counter(&self, name: &'static str, value: u64);
    fn gauge(&self, name: &'static str, value: u64);
    fn event(&self, name: &'static str, duration_ms: Option<u64>);
}

/// The default sink: swallows everything.
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn counter(&self, _name: &'static str, _value: u64) {}
    fn gauge(&self, _name: &'static str, _value: u64) {}
    fn event(&self, _name: &'static str, _duration_ms: Option<u64>) {}
}

/// Per-cycle accumulator. Counts are gathered as the cycle runs and flushed
/// to the sink in one go at the end, so a crashed cycle reports nothing
/// rather than half a picture.
pub struct CycleRecorder {
    started: Instant,
    pub pushed: u32,
    pub pulled: u32,
    pub conflicts: u32,
    pub escalations: u32,
    pub queued_for_retry: u32,
}

impl CycleRecorder {
    pub fn start(sink: &dyn TelemetrySink) -> Self {
        sink.event(EVENT_SYNC_START, None);
        Self {
            started: Instant::now(),
            pushed: 0,
            pulled: 0,
            conflicts: 0,
            escalations: 0,
            queued_for_retry: 0,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn finish(
        &self,
        sink: &dyn TelemetrySink,
        success: bool,
        queue_depth: u32,
        queue_oldest_ms: Option<u64>,
    ) -> u64 {
        let duration = self.elapsed_ms();
        sink.counter(COUNTER_PUSH_OK, self.pushed as u64);
        sink.counter(COUNTER_PUSH_FAIL, self.queued_for_retry as u64);
        sink.counter(COUNTER_PULL_APPLIED, self.pulled as u64);
        sink.counter(COUNTER_CONFLICTS, self.conflicts as u64);
        sink.counter(COUNTER_ESCALATIONS, self.escalations as u64);
        sink.gauge(GAUGE_QUEUE_DEPTH, queue_depth as u64);
        if let Some(age) = queue_oldest_ms {
            sink.gauge(GAUGE_QUEUE_OLDEST_MS, age);
        }
        sink.event(
            if success {
                EVENT_SYNC_SUCCESS
            } else {
                EVENT_SYNC_FAILURE
            },
            Some(duration),
        );
        duration
    }
}

/// Captures everything for assertions. Lives here rather than in a test
/// module because the integration tests use it too.
#[derive(Default)]
pub struct TestTelemetry {
    pub counters: Mutex<Vec<(&'static str, u64)>>,
    pub gauges: Mutex<Vec<(&'static str, u64)>>,
    pub events: Mutex<Vec<(&'static str, Option<u64>)>>,
}

impl TestTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .sum()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|(n, _)| *n).collect()
    }
}

impl TelemetrySink for TestTelemetry {
    fn counter(&self, name: &'static str, value: u64) {
        self.counters.lock().unwrap().push((name, value));
    }
    fn gauge(&self, name: &'static str, value: u64) {
        self.gauges.lock().unwrap().push((name, value));
    }
    fn event(&self, name: &'static str, duration_ms: Option<u64>) {
        self.events.lock().unwrap().push((name, duration_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_recorder_flushes_once() {
        let sink = TestTelemetry::new();
        let mut cycle = CycleRecorder::start(&sink);
        cycle.pushed = 3;
        cycle.conflicts = 1;
        cycle.finish(&sink, true, 2, Some(1234));

        assert_eq!(sink.counter_total(COUNTER_PUSH_OK), 3);
        assert_eq!(sink.counter_total(COUNTER_CONFLICTS), 1);
        assert_eq!(sink.counter_total(COUNTER_PULL_APPLIED), 0);
        assert_eq!(sink.event_names(), vec![EVENT_SYNC_START, EVENT_SYNC_SUCCESS]);
        let gauges = sink.gauges.lock().unwrap();
        assert!(gauges.contains(&(GAUGE_QUEUE_DEPTH, 2)));
        assert!(gauges.contains(&(GAUGE_QUEUE_OLDEST_MS, 1234)));
    }

    #[test]
    fn test_failure_event() {
        let sink = TestTelemetry::new();
        let cycle = CycleRecorder::start(&sink);
        cycle.finish(&sink, false, 0, None);
        assert_eq!(sink.event_names(), vec![EVENT_SYNC_START, EVENT_SYNC_FAILURE]);
    }
}
