//! The digest control loop.
//!
//! Every tick asks the store which servers are due and dispatches one task per
//! due server. Each server moves `Idle -> Due -> Producing -> Idle`; a server
//! that has not returned to `Idle` is never dispatched twice, which together
//! with marking the window only after a successful production gives at most one
//! digest per scheduling period.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, Semaphore},
    time::MissedTickBehavior,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info, info_span, instrument};

use crate::{
    base::{
        error::{DigestError, DigestResult},
        types::{ProduceOutcome, ServerId},
    },
    digest::{producer::DigestProducer, store::ConfigStore},
};

/// Where a server is in the production cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Idle,
    Due,
    Producing,
}

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick: Duration,
    pub max_concurrency: usize,
    /// Stops the loop and fails any digest still being sent.
    pub cancel: CancellationToken,
}

impl SchedulerOptions {
    pub fn new(tick: Duration, max_concurrency: usize) -> Self {
        Self {
            tick,
            max_concurrency,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: ServerState,
    consecutive_failures: u32,
}

/// Digest scheduler for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct DigestScheduler {
    inner: Arc<DigestSchedulerInner>,
}

struct DigestSchedulerInner {
    store: ConfigStore,
    producer: DigestProducer,
    options: SchedulerOptions,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    slots: Mutex<HashMap<ServerId, Slot>>,
}

impl DigestScheduler {
    pub fn new(store: ConfigStore, producer: DigestProducer, options: SchedulerOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrency.max(1)));

        Self {
            inner: Arc::new(DigestSchedulerInner {
                store,
                producer,
                options,
                permits,
                tracker: TaskTracker::new(),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Tick until cancelled, then wait for in-flight productions to settle.
    #[instrument(name = "DigestScheduler::run", skip_all)]
    pub async fn run(&self) {
        let inner = &self.inner;

        let mut interval = tokio::time::interval(inner.options.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Digest scheduler started, ticking every {:?}.", inner.options.tick);

        loop {
            tokio::select! {
                _ = inner.options.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(inner.store.now()).await;
                }
            }
        }

        inner.tracker.close();
        inner.tracker.wait().await;

        info!("Digest scheduler stopped.");
    }

    /// Dispatch production for every due server that is idle.
    ///
    /// Returns the number of servers dispatched.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due = self.inner.store.list_due(now).await;
        let mut dispatched = 0;

        for server_id in due {
            if !self.try_mark_due(&server_id).await {
                debug!(server_id = %server_id, "Digest still in flight, not dispatching again.");
                continue;
            }

            let this = self.clone();
            let span = info_span!("digest", server_id = %server_id);

            self.inner.tracker.spawn(async move { this.process(server_id, now).await }.instrument(span));

            dispatched += 1;
        }

        if dispatched > 0 {
            debug!("Dispatched {} digest(s).", dispatched);
        }

        dispatched
    }

    /// The current state of `server_id`.
    pub async fn state(&self, server_id: &str) -> ServerState {
        self.inner.slots.lock().await.get(server_id).map(|s| s.state).unwrap_or_default()
    }

    /// How many productions in a row have failed for `server_id`.
    pub async fn consecutive_failures(&self, server_id: &str) -> u32 {
        self.inner.slots.lock().await.get(server_id).map(|s| s.consecutive_failures).unwrap_or_default()
    }

    /// Wait until every dispatched production has finished.
    pub async fn wait_in_flight(&self) {
        let tracker = &self.inner.tracker;

        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    // Internals.

    async fn try_mark_due(&self, server_id: &str) -> bool {
        let mut slots = self.inner.slots.lock().await;
        let slot = slots.entry(server_id.to_string()).or_default();

        if slot.state != ServerState::Idle {
            return false;
        }

        slot.state = ServerState::Due;
        true
    }

    async fn set_state(&self, server_id: &str, state: ServerState) {
        self.inner.slots.lock().await.entry(server_id.to_string()).or_default().state = state;
    }

    async fn process(&self, server_id: ServerId, now: DateTime<Utc>) {
        let inner = &self.inner;

        let result = match inner.permits.clone().acquire_owned().await {
            Ok(_permit) => {
                self.set_state(&server_id, ServerState::Producing).await;
                self.produce_and_mark(&server_id, now).await
            }
            Err(err) => Err(DigestError::production(&server_id, err)),
        };

        let mut slots = inner.slots.lock().await;
        let slot = slots.entry(server_id.clone()).or_default();
        slot.state = ServerState::Idle;

        match result {
            Ok(outcome) => {
                slot.consecutive_failures = 0;
                info!(?outcome, "Digest window closed at {}.", now);
            }
            Err(err) => {
                slot.consecutive_failures += 1;
                error!(failures = slot.consecutive_failures, "Error while producing digest: {}", err);
            }
        }
    }

    async fn produce_and_mark(&self, server_id: &str, now: DateTime<Utc>) -> DigestResult<ProduceOutcome> {
        let outcome = self.inner.producer.produce(server_id, now, &self.inner.options.cancel).await?;
        self.inner.store.mark_digested(server_id, now).await?;

        Ok(outcome)
    }
}

// Tests.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::{
        base::{
            clock::Clock,
            types::{BufferedMessage, Document, Void},
        },
        digest::{
            buffer::MessageBuffer,
            names::NameDirectory,
            producer::ProducerOptions,
            store::{ServerConfig, StoreOptions},
        },
        service::{
            mail::{GenericMailClient, MailClient},
            persistence::ConfigPersistence,
            render::Renderer,
        },
    };

    /// Mail client that records sends and can be told to fail or to hold.
    #[derive(Default)]
    struct TestMail {
        fail: AtomicBool,
        sent: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
        bodies: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenericMailClient for TestMail {
        async fn send(&self, document: &Document, _recipients: &[String]) -> Void {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("smtp unavailable"));
            }

            self.sent.fetch_add(1, Ordering::SeqCst);
            self.bodies.lock().unwrap().push(String::from_utf8(document.body.clone())?);

            Ok(())
        }
    }

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    struct Harness {
        store: ConfigStore,
        buffer: MessageBuffer,
        mail: Arc<TestMail>,
        scheduler: DigestScheduler,
    }

    /// Servers register at T-61min with an hourly interval.
    async fn harness(mail: TestMail, max_concurrency: usize) -> Harness {
        harness_with(mail, max_concurrency, ConfigPersistence::memory(), t() - TimeDelta::minutes(61)).await
    }

    async fn harness_with(mail: TestMail, max_concurrency: usize, persistence: ConfigPersistence, clock_at: DateTime<Utc>) -> Harness {
        let options = StoreOptions::new(TimeDelta::minutes(60)).with_clock(Clock::fixed(clock_at));
        let store = ConfigStore::open(persistence, options).await.unwrap();
        let buffer = MessageBuffer::new(store.clone());

        let mail = Arc::new(mail);
        let producer = DigestProducer::new(store.clone(), buffer.clone(), NameDirectory::new(), Renderer::html(), MailClient::new(mail.clone()), ProducerOptions::default());
        let scheduler = DigestScheduler::new(store.clone(), producer, SchedulerOptions::new(Duration::from_secs(60), max_concurrency));

        Harness { store, buffer, mail, scheduler }
    }

    async fn configure(store: &ConfigStore, server_id: &str) {
        store.add_channel(server_id, "C1").await.unwrap();
        store.add_emails(server_id, &["team@example.com"]).await.unwrap();
    }

    fn message(content: &str, posted_at: DateTime<Utc>) -> BufferedMessage {
        BufferedMessage {
            channel_id: "C1".to_string(),
            author_display_name: "alice".to_string(),
            content: content.to_string(),
            posted_at,
        }
    }

    #[tokio::test]
    async fn test_successful_digest_advances_window() {
        let h = harness(TestMail::default(), 4).await;
        configure(&h.store, "S").await;

        h.buffer.append("S", message("at T-30", t() - TimeDelta::minutes(30))).await;
        h.buffer.append("S", message("at T-10", t() - TimeDelta::minutes(10))).await;

        assert_eq!(h.scheduler.tick(t()).await, 1);
        h.scheduler.wait_in_flight().await;

        assert_eq!(h.mail.sent.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get("S").await.unwrap().last_digest_at, t());
        assert_eq!(h.buffer.len("S").await, 0);
        assert_eq!(h.scheduler.state("S").await, ServerState::Idle);

        let bodies = h.mail.bodies.lock().unwrap();
        let first = bodies[0].find("at T-30").unwrap();
        let second = bodies[0].find("at T-10").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_failed_digest_is_retried() {
        let mail = TestMail::default();
        mail.fail.store(true, Ordering::SeqCst);

        let h = harness(mail, 4).await;
        configure(&h.store, "S").await;
        h.buffer.append("S", message("hello", t() - TimeDelta::minutes(1))).await;

        let before = h.store.get("S").await.unwrap().last_digest_at;

        h.scheduler.tick(t()).await;
        h.scheduler.wait_in_flight().await;

        assert_eq!(h.store.get("S").await.unwrap().last_digest_at, before);
        assert_eq!(h.buffer.len("S").await, 1);
        assert_eq!(h.scheduler.consecutive_failures("S").await, 1);

        // Still due on the next tick, and succeeds once the mail server is back.
        h.mail.fail.store(false, Ordering::SeqCst);
        let later = t() + TimeDelta::minutes(1);

        assert_eq!(h.scheduler.tick(later).await, 1);
        h.scheduler.wait_in_flight().await;

        assert_eq!(h.mail.sent.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get("S").await.unwrap().last_digest_at, later);
        assert_eq!(h.scheduler.consecutive_failures("S").await, 0);
    }

    #[tokio::test]
    async fn test_skipped_server_still_advances() {
        let h = harness(TestMail::default(), 4).await;
        h.store.add_channel("S", "C1").await.unwrap();

        h.scheduler.tick(t()).await;
        h.scheduler.wait_in_flight().await;

        assert_eq!(h.mail.sent.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.get("S").await.unwrap().last_digest_at, t());
    }

    #[tokio::test]
    async fn test_not_due_is_not_dispatched() {
        let h = harness(TestMail::default(), 4).await;
        configure(&h.store, "S").await;

        assert_eq!(h.scheduler.tick(t() - TimeDelta::minutes(2)).await, 0);
    }

    #[tokio::test]
    async fn test_in_flight_server_is_not_dispatched_twice() {
        let gate = Arc::new(Semaphore::new(0));
        let mail = TestMail {
            gate: Some(gate.clone()),
            ..Default::default()
        };

        let h = harness(mail, 4).await;
        configure(&h.store, "S").await;

        assert_eq!(h.scheduler.tick(t()).await, 1);
        assert_ne!(h.scheduler.state("S").await, ServerState::Idle);
        assert_eq!(h.scheduler.tick(t() + TimeDelta::minutes(1)).await, 0);

        gate.add_permits(1);
        h.scheduler.wait_in_flight().await;

        assert_eq!(h.mail.sent.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.state("S").await, ServerState::Idle);
        assert_eq!(h.store.get("S").await.unwrap().last_digest_at, t());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let gate = Arc::new(Semaphore::new(0));
        let mail = TestMail {
            gate: Some(gate.clone()),
            ..Default::default()
        };

        let h = harness(mail, 1).await;
        for server_id in ["A", "B", "C"] {
            configure(&h.store, server_id).await;
        }

        assert_eq!(h.scheduler.tick(t()).await, 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.add_permits(3);
        h.scheduler.wait_in_flight().await;

        assert_eq!(h.mail.sent.load(Ordering::SeqCst), 3);
        assert_eq!(h.mail.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_servers_are_processed_independently() {
        let h = harness(TestMail::default(), 4).await;
        configure(&h.store, "A").await;

        // "B" has no recipients and is skipped without affecting "A".
        h.store.add_channel("B", "C1").await.unwrap();

        assert_eq!(h.scheduler.tick(t()).await, 2);
        h.scheduler.wait_in_flight().await;

        assert_eq!(h.mail.sent.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get("A").await.unwrap().last_digest_at, t());
        assert_eq!(h.store.get("B").await.unwrap().last_digest_at, t());
    }

    #[tokio::test]
    async fn test_cancel_fails_in_flight_digest_closed() {
        let gate = Arc::new(Semaphore::new(0));
        let mail = TestMail {
            gate: Some(gate.clone()),
            ..Default::default()
        };

        // The loop reads the store clock, so it must already read T.
        let mut record = ServerConfig::new("S", TimeDelta::minutes(60), t() - TimeDelta::minutes(61));
        record.monitored_channels.insert("C1".to_string());
        record.recipient_emails.insert("team@example.com".to_string());

        let h = harness_with(mail, 4, ConfigPersistence::memory_with([record]), t()).await;
        h.buffer.append("S", message("hello", t() - TimeDelta::minutes(1))).await;

        let cancel = h.scheduler.inner.options.cancel.clone();
        let runner = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        // Let the first tick dispatch and block in the send.
        while h.mail.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        runner.await.unwrap();

        assert_eq!(h.mail.sent.load(Ordering::SeqCst), 0);
        assert_eq!(h.buffer.len("S").await, 1);
        assert_eq!(h.store.get("S").await.unwrap().last_digest_at, t() - TimeDelta::minutes(61));
        assert_eq!(h.scheduler.consecutive_failures("S").await, 1);
    }
}
