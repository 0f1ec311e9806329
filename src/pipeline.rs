/// The capture pipeline: source → tracker → linker → dispatcher.
///
/// Runs on a single thread. Encounters are processed one at a time in
/// arrival order; the tracker lock is held for the record, link pass and
/// eviction of one encounter and released before any listener runs.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::dispatch::{Dispatcher, Event};
use crate::encounter::Encounter;
use crate::linker::{IdentityLinker, Link, LinkerConfig};
use crate::source::{EncounterSource, SourcePoll};
use crate::tracker::{DeviceTracker, SharedTracker};

/// Event-time clock: the newest encounter timestamp, advanced by the wall
/// time elapsed since it was processed. Replayed and live captures age
/// devices the same way.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventClock {
    anchor: Option<(DateTime<Utc>, Instant)>,
}

impl EventClock {
    pub fn observe(&mut self, timestamp: DateTime<Utc>) {
        let newer = self.anchor.map_or(true, |(latest, _)| timestamp >= latest);
        if newer {
            self.anchor = Some((timestamp, Instant::now()));
        }
    }

    /// `None` until the first encounter.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        let (latest, seen_at) = self.anchor?;
        let elapsed = chrono::Duration::from_std(seen_at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        Some(latest + elapsed)
    }
}

/// Why [`Pipeline::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shutdown {
    SourceFinished,
    SourceFailed(String),
    Stopped,
}

pub struct Pipeline {
    tracker: SharedTracker,
    linker: IdentityLinker,
    dispatcher: Dispatcher,
    clock: EventClock,
    poll_interval: Duration,
    processed: u64,
}

impl Pipeline {
    pub fn new(tracker: SharedTracker, linker: LinkerConfig, dispatcher: Dispatcher, poll_interval: Duration) -> Self {
        Self {
            tracker,
            linker: IdentityLinker::new(linker),
            dispatcher,
            clock: EventClock::default(),
            poll_interval,
            processed: 0,
        }
    }

    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    pub fn links(&self) -> &[Link] {
        self.linker.links()
    }

    /// Encounters accepted from the source so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Fold one encounter into the tracker, run a link pass and publish
    /// the encounter followed by any new links.
    pub fn process(&mut self, encounter: Encounter) {
        self.clock.observe(encounter.timestamp);
        self.processed += 1;
        let shared = Arc::clone(&self.tracker);
        let links = {
            let mut tracker = shared.lock().unwrap_or_else(PoisonError::into_inner);
            tracker.record(&encounter);
            self.link_pass(&mut tracker)
        };

        self.dispatcher.publish(&Event::Encounter(encounter));
        for link in links {
            self.dispatcher.publish(&Event::Linked(link));
        }
    }

    /// Link pass without a new encounter, for quiet periods.
    pub fn tick(&mut self) {
        let shared = Arc::clone(&self.tracker);
        let links = {
            let mut tracker = shared.lock().unwrap_or_else(PoisonError::into_inner);
            self.link_pass(&mut tracker)
        };
        for link in links {
            self.dispatcher.publish(&Event::Linked(link));
        }
    }

    fn link_pass(&mut self, tracker: &mut DeviceTracker) -> Vec<Link> {
        let Some(now) = self.clock.now() else {
            return Vec::new();
        };
        let links = self.linker.scan(tracker, now);
        for id in tracker.evict_inactive(now) {
            self.linker.forget(&id);
        }
        links
    }

    /// Drive `source` until it finishes, fails, or `stop` is raised.
    pub fn run(&mut self, source: &mut dyn EncounterSource, stop: &AtomicBool) -> Shutdown {
        log::info!("Reading encounters from {}", source.describe());
        let shutdown = loop {
            if stop.load(Ordering::Relaxed) {
                break Shutdown::Stopped;
            }
            match source.next_encounter(self.poll_interval) {
                Ok(SourcePoll::Encounter(encounter)) => self.process(encounter),
                Ok(SourcePoll::Idle) => self.tick(),
                Ok(SourcePoll::Finished) => break Shutdown::SourceFinished,
                Err(e) => {
                    log::error!("{} failed: {}", source.describe(), e);
                    break Shutdown::SourceFailed(e.to_string());
                }
            }
        };

        self.tick();
        let reason = match &shutdown {
            Shutdown::SourceFinished => format!("{} finished", source.describe()),
            Shutdown::SourceFailed(e) => e.clone(),
            Shutdown::Stopped => "stopped".to_string(),
        };
        log::info!(
            "Pipeline done after {} encounters and {} links: {}",
            self.processed,
            self.linker.links().len(),
            reason
        );
        self.dispatcher.publish(&Event::SourceClosed(reason));
        shutdown
    }
}

/// A stop flag that can be shared with a signal handler or another thread.
pub fn stop_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EventKind;
    use crate::error::SourceError;
    use crate::source::ChannelSource;
    use crate::tracker::TrackerConfig;
    use chrono::{Duration as Delta, TimeZone};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 7, 14, 9, 0, 0).unwrap() + Delta::milliseconds(ms)
    }

    fn recording_dispatcher() -> (Dispatcher, Rc<RefCell<Vec<Event>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        let mut dispatcher = Dispatcher::new();
        dispatcher.subscribe_many(&EventKind::ALL, move |e: &Event| -> anyhow::Result<()> {
            sink.borrow_mut().push(e.clone());
            Ok(())
        });
        (dispatcher, events)
    }

    fn pipeline(dispatcher: Dispatcher) -> Pipeline {
        Pipeline::new(
            DeviceTracker::shared(TrackerConfig::default()),
            LinkerConfig::default(),
            dispatcher,
            Duration::from_millis(5),
        )
    }

    fn run_all(pipeline: &mut Pipeline, encounters: Vec<Encounter>) -> Shutdown {
        let (tx, rx) = mpsc::channel();
        for e in encounters {
            tx.send(e).unwrap();
        }
        drop(tx);
        let mut source = ChannelSource::new(rx, "test");
        pipeline.run(&mut source, &AtomicBool::new(false))
    }

    /// 100 reads of AA:AA over 10 s, a 15 s gap, then 50 reads of BB:BB
    /// at the broadcast interval.
    fn rotation_scenario() -> Vec<Encounter> {
        let mut out = Vec::new();
        for i in 0..100 {
            out.push(Encounter::new("AA:AA", "01", at(i * 100), -60 - (i % 3) as i16));
        }
        let start = 99 * 100 + 15_000;
        for i in 0..50 {
            out.push(Encounter::new("BB:BB", "02", at(start + i * 250), -61 + (i % 2) as i16));
        }
        out
    }

    // ── End to end ──────────────────────────────────────────────────

    #[test]
    fn rotation_is_linked_exactly_once() {
        let (dispatcher, events) = recording_dispatcher();
        let mut pipeline = pipeline(dispatcher);
        assert_eq!(run_all(&mut pipeline, rotation_scenario()), Shutdown::SourceFinished);

        assert_eq!(pipeline.links().len(), 1);
        let link = &pipeline.links()[0];
        assert_eq!(link.old.key, "AA:AA");
        assert_eq!(link.new.key, "BB:BB");
        assert_eq!(link.gap_ms(), 15_000);

        let events = events.borrow();
        let linked = events.iter().filter(|e| e.kind() == EventKind::Linked).count();
        let encounters = events.iter().filter(|e| e.kind() == EventKind::Encounter).count();
        assert_eq!(linked, 1);
        assert_eq!(encounters, 150);
        assert_eq!(events.last().map(Event::kind), Some(EventKind::SourceClosed));
        assert_eq!(pipeline.processed(), 150);
    }

    #[test]
    fn encounters_are_published_in_arrival_order() {
        let (dispatcher, events) = recording_dispatcher();
        let mut pipeline = pipeline(dispatcher);
        let input = rotation_scenario();
        run_all(&mut pipeline, input.clone());

        let published: Vec<Encounter> = events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Encounter(e) => Some(e.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(published, input);
    }

    #[test]
    fn reads_stay_monotonic_per_device() {
        let (dispatcher, _) = recording_dispatcher();
        let mut pipeline = pipeline(dispatcher);
        let mut input = rotation_scenario();
        // duplicate captures on other channels and one late straggler
        input.insert(10, Encounter::new("AA:AA", "01", at(903), -60));
        input.insert(20, Encounter::new("AA:AA", "01", at(500), -60));
        run_all(&mut pipeline, input);

        let tracker = pipeline.tracker().lock().unwrap();
        for device in tracker.devices() {
            for pair in device.reads().windows(2) {
                assert!(pair[0].timestamp < pair[1].timestamp);
            }
        }
        assert_eq!(tracker.devices()[0].len(), 100);
    }

    #[test]
    fn link_is_published_after_its_encounter() {
        let (dispatcher, events) = recording_dispatcher();
        let mut pipeline = pipeline(dispatcher);
        run_all(&mut pipeline, rotation_scenario());

        let events = events.borrow();
        let idx = events
            .iter()
            .position(|e| e.kind() == EventKind::Linked)
            .unwrap();
        // AA:AA last read at 9.9 s goes stale once the clock passes 29.9 s
        match &events[idx - 1] {
            Event::Encounter(e) => {
                assert!(e.timestamp >= at(29_900) && e.timestamp <= at(30_150));
                assert_eq!(e.device_key, "BB:BB");
            }
            other => panic!("unexpected {other:?}"),
        };
    }

    #[test]
    fn tracker_is_unlocked_while_listeners_run() {
        let tracker = DeviceTracker::shared(TrackerConfig::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        {
            let tracker = Arc::clone(&tracker);
            let seen = Rc::clone(&seen);
            dispatcher.subscribe(EventKind::Encounter, move |_: &Event| -> anyhow::Result<()> {
                let guard = tracker.try_lock().map_err(|_| anyhow::anyhow!("tracker still locked"))?;
                seen.borrow_mut().push(guard.len());
                Ok(())
            });
        }
        let mut pipeline = Pipeline::new(tracker, LinkerConfig::default(), dispatcher, Duration::from_millis(5));
        pipeline.process(Encounter::new("AA", "01", at(0), -60));
        pipeline.process(Encounter::new("BB", "02", at(100), -60));
        pipeline.tick();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    // ── Termination ─────────────────────────────────────────────────

    struct FailingSource;

    impl EncounterSource for FailingSource {
        fn describe(&self) -> String {
            "failing".into()
        }

        fn next_encounter(&mut self, _timeout: Duration) -> Result<SourcePoll, SourceError> {
            Err(SourceError::TransportLost("ttyACM0".into()))
        }
    }

    #[test]
    fn lost_source_is_announced() {
        let (dispatcher, events) = recording_dispatcher();
        let mut pipeline = pipeline(dispatcher);
        let shutdown = pipeline.run(&mut FailingSource, &AtomicBool::new(false));
        assert!(matches!(shutdown, Shutdown::SourceFailed(ref e) if e.contains("ttyACM0")));
        match events.borrow().as_slice() {
            [Event::SourceClosed(reason)] => assert!(reason.contains("Transport lost")),
            other => panic!("unexpected {other:?}"),
        };
    }

    #[test]
    fn stop_flag_ends_run() {
        let (dispatcher, events) = recording_dispatcher();
        let mut pipeline = pipeline(dispatcher);
        let (_tx, rx) = mpsc::channel::<Encounter>();
        let mut source = ChannelSource::new(rx, "idle");
        let stop = AtomicBool::new(true);
        assert_eq!(pipeline.run(&mut source, &stop), Shutdown::Stopped);
        assert_eq!(events.borrow().len(), 1);
    }

    #[test]
    fn idle_ticks_link_after_source_goes_quiet() {
        let (dispatcher, _) = recording_dispatcher();
        let mut pipeline = pipeline(dispatcher);
        pipeline.process(Encounter::new("AA", "01", at(0), -60));
        pipeline.process(Encounter::new("BB", "02", at(5_000), -60));
        pipeline.tick();
        assert!(pipeline.links().is_empty());

        // pretend the newest encounter was seen long ago
        pipeline.clock.anchor = Some((at(5_000), Instant::now() - Duration::from_secs(16)));
        pipeline.tick();
        assert_eq!(pipeline.links().len(), 1);
    }

    #[test]
    fn clock_follows_newest_timestamp() {
        let mut clock = EventClock::default();
        assert!(clock.now().is_none());
        clock.observe(at(1_000));
        clock.observe(at(500));
        let now = clock.now().unwrap();
        assert!(now >= at(1_000) && now < at(2_000));
    }
}
