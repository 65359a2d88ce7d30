//! Durable reminder scheduler.
//!
//! A long-lived task sleeps until the soonest pending event, then pushes a
//! fire record into an mpsc channel. The consumer acknowledges each fire
//! through a oneshot; only an acknowledged fire deletes the event, so
//! delivery is at-most-once with bounded retries on callback failure.
//! The scheduler never calls back into the orchestration graph itself.

pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use murmur_schema::{ReminderDetails, ScheduleError};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

pub use store::{ReminderStore, StoredEvent, FILE_VERSION};

const MAX_SLEEP: Duration = Duration::from_secs(60);
const ACK_TIMEOUT: Duration = Duration::from_secs(180);
const FIRE_BACKOFF_SECS: &[u64] = &[30, 60, 300];

pub fn fire_backoff(attempts: u32) -> Duration {
    let idx = (attempts.saturating_sub(1) as usize).min(FIRE_BACKOFF_SECS.len() - 1);
    Duration::from_secs(FIRE_BACKOFF_SECS[idx])
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_reminders_per_user: usize,
    pub startup_grace: Duration,
    pub max_fire_attempts: u32,
    pub cleanup_terminal_events: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_reminders_per_user: 5,
            startup_grace: Duration::ZERO,
            max_fire_attempts: 3,
            cleanup_terminal_events: true,
        }
    }
}

/// One due reminder handed to the consumer. Send the outcome back through
/// `ack`; a dropped ack counts as a failed delivery.
#[derive(Debug)]
pub struct ReminderFire {
    pub event_id: String,
    pub details: ReminderDetails,
    pub ack: oneshot::Sender<Result<(), String>>,
}

#[derive(Debug, Clone)]
struct PendingEvent {
    id: String,
    details: ReminderDetails,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
    firing: bool,
    terminal: bool,
}

impl PendingEvent {
    fn due(&self, now: DateTime<Utc>) -> bool {
        !self.firing && !self.terminal && self.next_attempt_at <= now
    }
}

struct Inner {
    config: SchedulerConfig,
    store: ReminderStore,
    events: Mutex<Vec<PendingEvent>>,
    next_seq: Mutex<u64>,
    fire_tx: mpsc::Sender<ReminderFire>,
    rearm: Notify,
}

#[derive(Clone)]
pub struct ReminderScheduler {
    inner: Arc<Inner>,
}

impl ReminderScheduler {
    /// Load persisted events and build the scheduler plus its fire channel.
    /// Events overdue by more than the grace window are dropped; the rest
    /// are rescheduled (overdue-within-grace fires immediately).
    pub fn new(
        config: SchedulerConfig,
        store: ReminderStore,
    ) -> Result<(Self, mpsc::Receiver<ReminderFire>), ScheduleError> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(config.startup_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut next_seq = 1u64;
        let mut pending = Vec::new();
        for stored in store.load()? {
            if let Ok(seq) = stored.id.parse::<u64>() {
                next_seq = next_seq.max(seq + 1);
            }
            if stored.fire_at + grace < now {
                tracing::info!(id = %stored.id, fire_at = %stored.fire_at, "dropping overdue reminder");
                continue;
            }
            pending.push(PendingEvent {
                id: stored.id,
                details: ReminderDetails {
                    content: stored.content,
                    fire_at: stored.fire_at,
                    channel_ref: stored.channel_ref,
                    user_ref: stored.user_ref,
                    created_at: stored.created_at,
                },
                attempts: 0,
                next_attempt_at: stored.fire_at.max(now),
                firing: false,
                terminal: false,
            });
        }

        let (fire_tx, fire_rx) = mpsc::channel(32);
        let scheduler = Self {
            inner: Arc::new(Inner {
                config,
                store,
                events: Mutex::new(pending),
                next_seq: Mutex::new(next_seq),
                fire_tx,
                rearm: Notify::new(),
            }),
        };
        // Re-persist so dropped entries do not return on the next start.
        {
            let events = scheduler.inner.events.try_lock().map_err(|_| {
                ScheduleError::Persistence("scheduler state locked during init".into())
            })?;
            scheduler.inner.store.persist(&snapshot(&events))?;
        }
        Ok((scheduler, fire_rx))
    }

    /// Add a reminder, enforcing the per-user cap.
    pub async fn schedule(&self, details: ReminderDetails) -> Result<String, ScheduleError> {
        let mut events = self.inner.events.lock().await;
        let active = events
            .iter()
            .filter(|e| !e.terminal && e.details.user_ref == details.user_ref)
            .count();
        let limit = self.inner.config.max_reminders_per_user;
        if active >= limit {
            return Err(ScheduleError::QuotaExceeded {
                user_ref: details.user_ref,
                limit,
            });
        }

        let id = {
            let mut seq = self.inner.next_seq.lock().await;
            let id = format!("{:06}", *seq);
            *seq += 1;
            id
        };

        events.push(PendingEvent {
            id: id.clone(),
            next_attempt_at: details.fire_at,
            details,
            attempts: 0,
            firing: false,
            terminal: false,
        });
        self.inner.store.persist(&snapshot(&events))?;
        drop(events);

        self.inner.rearm.notify_waiters();
        tracing::info!(id = %id, "reminder scheduled");
        Ok(id)
    }

    pub async fn cancel(&self, id: &str) -> Result<bool, ScheduleError> {
        let mut events = self.inner.events.lock().await;
        let before = events.len();
        events.retain(|e| e.id != id);
        let removed = events.len() != before;
        if removed {
            self.inner.store.persist(&snapshot(&events))?;
        }
        Ok(removed)
    }

    pub async fn pending(&self) -> Vec<StoredEvent> {
        let events = self.inner.events.lock().await;
        snapshot(&events)
    }

    /// Drive the scheduler until the process exits.
    pub async fn run(&self) {
        loop {
            let sleep = self.sleep_until_due().await;
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.inner.rearm.notified() => {}
            }
            self.poll_once().await;
        }
    }

    async fn sleep_until_due(&self) -> Duration {
        let events = self.inner.events.lock().await;
        let now = Utc::now();
        let soonest = events
            .iter()
            .filter(|e| !e.firing && !e.terminal)
            .map(|e| e.next_attempt_at)
            .min();
        match soonest {
            Some(at) => {
                let millis = (at - now).num_milliseconds().max(0) as u64;
                Duration::from_millis(millis).min(MAX_SLEEP)
            }
            None => MAX_SLEEP,
        }
    }

    /// Fire everything due right now. Each delivery settles in its own task
    /// so one slow consumer never delays the next reminder.
    pub async fn poll_once(&self) {
        let due: Vec<(String, ReminderDetails)> = {
            let mut events = self.inner.events.lock().await;
            let now = Utc::now();
            let mut due = Vec::new();
            for event in events.iter_mut() {
                if event.due(now) {
                    event.firing = true;
                    due.push((event.id.clone(), event.details.clone()));
                }
            }
            due
        };

        for (id, details) in due {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                deliver_and_settle(inner, id, details).await;
            });
        }
    }
}

async fn deliver_and_settle(inner: Arc<Inner>, id: String, details: ReminderDetails) {
    let (ack_tx, ack_rx) = oneshot::channel();
    let fire = ReminderFire {
        event_id: id.clone(),
        details,
        ack: ack_tx,
    };

    let outcome: Result<(), String> = if inner.fire_tx.send(fire).await.is_err() {
        Err("fire channel closed".into())
    } else {
        match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("consumer dropped ack".into()),
            Err(_) => Err("ack timed out".into()),
        }
    };

    let mut events = inner.events.lock().await;
    match outcome {
        Ok(()) => {
            events.retain(|e| e.id != id);
            tracing::info!(id = %id, "reminder delivered");
        }
        Err(reason) => {
            if let Some(event) = events.iter_mut().find(|e| e.id == id) {
                event.firing = false;
                event.attempts += 1;
                if event.attempts >= inner.config.max_fire_attempts {
                    tracing::error!(id = %id, attempts = event.attempts, "reminder delivery failed terminally: {reason}");
                    event.terminal = true;
                } else {
                    event.next_attempt_at =
                        Utc::now() + chrono::Duration::from_std(fire_backoff(event.attempts))
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    tracing::warn!(id = %id, attempts = event.attempts, "reminder delivery failed, will retry: {reason}");
                }
            }
            if inner.config.cleanup_terminal_events {
                events.retain(|e| !e.terminal);
            }
        }
    }
    if let Err(e) = inner.store.persist(&snapshot(&events)) {
        tracing::error!("failed to persist reminder state: {e}");
    }
    inner.rearm.notify_waiters();
}

fn snapshot(events: &[PendingEvent]) -> Vec<StoredEvent> {
    events
        .iter()
        .filter(|e| !e.terminal)
        .map(|e| StoredEvent {
            id: e.id.clone(),
            content: e.details.content.clone(),
            fire_at: e.details.fire_at,
            channel_ref: e.details.channel_ref.clone(),
            user_ref: e.details.user_ref.clone(),
            created_at: e.details.created_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration as TokioDuration};

    fn details(user: &str, fire_at: DateTime<Utc>) -> ReminderDetails {
        ReminderDetails {
            content: "stretch".into(),
            fire_at,
            channel_ref: "chan-1".into(),
            user_ref: user.into(),
            created_at: Utc::now(),
        }
    }

    fn new_scheduler(
        dir: &tempfile::TempDir,
        config: SchedulerConfig,
    ) -> (ReminderScheduler, mpsc::Receiver<ReminderFire>) {
        let store = ReminderStore::new(dir.path().join("events.json"));
        ReminderScheduler::new(config, store).unwrap()
    }

    #[tokio::test]
    async fn schedule_assigns_monotonic_ids_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _rx) = new_scheduler(&dir, SchedulerConfig::default());

        let future = Utc::now() + chrono::Duration::hours(1);
        let id1 = scheduler.schedule(details("u1", future)).await.unwrap();
        let id2 = scheduler.schedule(details("u1", future)).await.unwrap();
        assert!(id2 > id1);

        let stored = ReminderStore::new(dir.path().join("events.json"))
            .load()
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn quota_is_enforced_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            max_reminders_per_user: 2,
            ..SchedulerConfig::default()
        };
        let (scheduler, _rx) = new_scheduler(&dir, config);

        let future = Utc::now() + chrono::Duration::hours(1);
        scheduler.schedule(details("u1", future)).await.unwrap();
        scheduler.schedule(details("u1", future)).await.unwrap();
        let err = scheduler.schedule(details("u1", future)).await.unwrap_err();
        assert!(matches!(err, ScheduleError::QuotaExceeded { limit: 2, .. }));
        // Another user is unaffected.
        scheduler.schedule(details("u2", future)).await.unwrap();
    }

    #[tokio::test]
    async fn due_event_fires_and_ack_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, mut rx) = new_scheduler(&dir, SchedulerConfig::default());

        let past = Utc::now() - chrono::Duration::seconds(1);
        scheduler.schedule(details("u1", past)).await.unwrap();
        scheduler.poll_once().await;

        let fire = timeout(TokioDuration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fire.details.content, "stretch");
        fire.ack.send(Ok(())).unwrap();

        // Wait for the settle task to drain the event.
        for _ in 0..50 {
            if scheduler.pending().await.is_empty() {
                return;
            }
            tokio::time::sleep(TokioDuration::from_millis(10)).await;
        }
        panic!("event was not removed after ack");
    }

    #[tokio::test]
    async fn failed_ack_schedules_retry_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, mut rx) = new_scheduler(&dir, SchedulerConfig::default());

        let past = Utc::now() - chrono::Duration::seconds(1);
        scheduler.schedule(details("u1", past)).await.unwrap();
        scheduler.poll_once().await;

        let fire = timeout(TokioDuration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        fire.ack.send(Err("channel unavailable".into())).unwrap();

        for _ in 0..50 {
            let pending = scheduler.pending().await;
            if pending.len() == 1 {
                // Event kept; the next attempt is pushed out past now.
                let events = scheduler.inner.events.lock().await;
                if events[0].attempts == 1 {
                    assert!(events[0].next_attempt_at > Utc::now());
                    return;
                }
            }
            tokio::time::sleep(TokioDuration::from_millis(10)).await;
        }
        panic!("retry state never settled");
    }

    #[tokio::test]
    async fn overdue_events_are_dropped_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReminderStore::new(dir.path().join("events.json"));
        store
            .persist(&[
                StoredEvent {
                    id: "000001".into(),
                    content: "stale".into(),
                    fire_at: Utc::now() - chrono::Duration::hours(2),
                    channel_ref: "c".into(),
                    user_ref: "u".into(),
                    created_at: Utc::now() - chrono::Duration::hours(3),
                },
                StoredEvent {
                    id: "000002".into(),
                    content: "fresh".into(),
                    fire_at: Utc::now() + chrono::Duration::hours(1),
                    channel_ref: "c".into(),
                    user_ref: "u".into(),
                    created_at: Utc::now(),
                },
            ])
            .unwrap();

        let config = SchedulerConfig {
            startup_grace: Duration::from_secs(60),
            ..SchedulerConfig::default()
        };
        let (scheduler, _rx) =
            ReminderScheduler::new(config, ReminderStore::new(dir.path().join("events.json")))
                .unwrap();
        let pending = scheduler.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "fresh");

        // Next assigned id continues past the highest persisted one.
        let id = scheduler
            .schedule(details("u", Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(id, "000003");
    }

    #[tokio::test]
    async fn overdue_within_grace_fires_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReminderStore::new(dir.path().join("events.json"));
        store
            .persist(&[StoredEvent {
                id: "000001".into(),
                content: "just missed".into(),
                fire_at: Utc::now() - chrono::Duration::seconds(10),
                channel_ref: "c".into(),
                user_ref: "u".into(),
                created_at: Utc::now(),
            }])
            .unwrap();

        let config = SchedulerConfig {
            startup_grace: Duration::from_secs(3600),
            ..SchedulerConfig::default()
        };
        let (scheduler, mut rx) =
            ReminderScheduler::new(config, ReminderStore::new(dir.path().join("events.json")))
                .unwrap();
        scheduler.poll_once().await;
        let fire = timeout(TokioDuration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fire.details.content, "just missed");
        let _ = fire.ack.send(Ok(()));
    }

    #[test]
    fn backoff_escalates_and_caps() {
        assert_eq!(fire_backoff(1), Duration::from_secs(30));
        assert_eq!(fire_backoff(2), Duration::from_secs(60));
        assert_eq!(fire_backoff(3), Duration::from_secs(300));
        assert_eq!(fire_backoff(50), Duration::from_secs(300));
    }
}
