// Heart — the beat/cycle/epoch scheduler driving everything else.
//
// Grounded on the event-loop shape of a tokio::spawn'd task running
// `loop { select! { ... } }` over several intervals of different
// periods, generalized from three ad hoc timers to the three ticks this
// system needs, with the total ordering beat < cycle < epoch and
// cooperative overrun-skips-not-queues semantics `tokio::time::interval`
// gives for free (a slow tick just runs again immediately on its next
// poll rather than queuing up a backlog).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rand::RngCore;
use serde::Serialize;

pub type TickFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A point-in-time view of the scheduler clock, exposed to the status API.
#[derive(Debug, Clone, Serialize)]
pub struct HeartSnapshot {
    pub current_cycle: u64,
    pub current_epoch: u64,
    pub last_beat: Option<u64>,
    pub last_cycle: Option<u64>,
    pub last_epoch: Option<u64>,
}

/// Callbacks the scheduler drives. Implemented by `Node`.
pub trait HeartTicks: Send + Sync {
    fn on_beat(&self) -> TickFuture<'_>;
    fn on_cycle(&self) -> TickFuture<'_>;
    fn on_epoch(&self, personality: String) -> TickFuture<'_>;
}

#[derive(Debug, Clone, Copy)]
pub struct HeartConfig {
    pub beat_interval: Duration,
    pub cycle_interval: Duration,
    pub epoch_interval: Duration,
}

impl Default for HeartConfig {
    fn default() -> Self {
        Self {
            beat_interval: Duration::from_secs(5),
            cycle_interval: Duration::from_secs(20),
            epoch_interval: Duration::from_secs(300),
        }
    }
}

pub struct Heart {
    config: HeartConfig,
    personality: Arc<RwLock<String>>,
    current_cycle: AtomicU64,
    current_epoch: AtomicU64,
    last_beat: RwLock<Option<SystemTime>>,
    last_cycle: RwLock<Option<SystemTime>>,
    last_epoch: RwLock<Option<SystemTime>>,
}

fn random_personality() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Heart {
    pub fn new(config: HeartConfig) -> Self {
        Self {
            config,
            personality: Arc::new(RwLock::new(random_personality())),
            current_cycle: AtomicU64::new(0),
            current_epoch: AtomicU64::new(0),
            last_beat: RwLock::new(None),
            last_cycle: RwLock::new(None),
            last_epoch: RwLock::new(None),
        }
    }

    pub fn personality(&self) -> String {
        self.personality.read().clone()
    }

    pub fn snapshot(&self) -> HeartSnapshot {
        HeartSnapshot {
            current_cycle: self.current_cycle.load(Ordering::Acquire),
            current_epoch: self.current_epoch.load(Ordering::Acquire),
            last_beat: self.last_beat.read().map(unix_secs),
            last_cycle: self.last_cycle.read().map(unix_secs),
            last_epoch: self.last_epoch.read().map(unix_secs),
        }
    }

    /// Run the scheduler loop until `shutdown` resolves. Beat, cycle, and
    /// epoch ticks are driven by independent `tokio::time::interval`s; a
    /// handler that overruns its own period is never queued a second
    /// time, it simply runs again at the next tick the interval produces.
    pub async fn run<H: HeartTicks>(&self, handler: Arc<H>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut beat_timer = tokio::time::interval(self.config.beat_interval);
        let mut cycle_timer = tokio::time::interval(self.config.cycle_interval);
        let mut epoch_timer = tokio::time::interval(self.config.epoch_interval);

        beat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        cycle_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        epoch_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!("heart stopping");
                    return;
                }
                _ = beat_timer.tick() => {
                    *self.last_beat.write() = Some(SystemTime::now());
                    handler.on_beat().await;
                }
                _ = cycle_timer.tick() => {
                    self.current_cycle.fetch_add(1, Ordering::AcqRel);
                    *self.last_cycle.write() = Some(SystemTime::now());
                    handler.on_cycle().await;
                }
                _ = epoch_timer.tick() => {
                    self.current_epoch.fetch_add(1, Ordering::AcqRel);
                    *self.last_epoch.write() = Some(SystemTime::now());
                    let new_personality = random_personality();
                    *self.personality.write() = new_personality.clone();
                    tracing::debug!("epoch tick, personality regenerated");
                    handler.on_epoch(new_personality).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        beats: AtomicUsize,
        cycles: AtomicUsize,
        epochs: AtomicUsize,
    }

    impl HeartTicks for CountingHandler {
        fn on_beat(&self) -> TickFuture<'_> {
            self.beats.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
        fn on_cycle(&self) -> TickFuture<'_> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
        fn on_epoch(&self, _personality: String) -> TickFuture<'_> {
            self.epochs.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test(start_paused = true)]
    async fn beats_fire_more_often_than_cycles_and_epochs() {
        let heart = Heart::new(HeartConfig {
            beat_interval: Duration::from_millis(10),
            cycle_interval: Duration::from_millis(40),
            epoch_interval: Duration::from_millis(100),
        });
        let handler = Arc::new(CountingHandler {
            beats: AtomicUsize::new(0),
            cycles: AtomicUsize::new(0),
            epochs: AtomicUsize::new(0),
        });
        let (tx, rx) = tokio::sync::oneshot::channel();

        let handler_clone = handler.clone();
        let run = tokio::spawn(async move {
            heart.run(handler_clone, rx).await;
        });

        tokio::time::advance(Duration::from_millis(205)).await;
        let _ = tx.send(());
        run.await.unwrap();

        assert!(handler.beats.load(Ordering::SeqCst) > handler.cycles.load(Ordering::SeqCst));
        assert!(handler.cycles.load(Ordering::SeqCst) >= handler.epochs.load(Ordering::SeqCst));
        assert!(handler.epochs.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_counters_advance_with_ticks() {
        let heart = Heart::new(HeartConfig {
            beat_interval: Duration::from_millis(10),
            cycle_interval: Duration::from_millis(40),
            epoch_interval: Duration::from_millis(100),
        });
        let handler = Arc::new(CountingHandler {
            beats: AtomicUsize::new(0),
            cycles: AtomicUsize::new(0),
            epochs: AtomicUsize::new(0),
        });
        let (tx, rx) = tokio::sync::oneshot::channel();

        let heart = Arc::new(heart);
        let heart_clone = heart.clone();
        let run = tokio::spawn(async move {
            heart_clone.run(handler, rx).await;
        });

        tokio::time::advance(Duration::from_millis(205)).await;
        let _ = tx.send(());
        run.await.unwrap();

        let snapshot = heart.snapshot();
        assert!(snapshot.current_cycle >= 1);
        assert!(snapshot.current_epoch >= 1);
        assert!(snapshot.last_beat.is_some());
        assert!(snapshot.last_cycle.is_some());
        assert!(snapshot.last_epoch.is_some());
    }

    #[test]
    fn personality_is_32_hex_chars() {
        let p = random_personality();
        assert_eq!(p.len(), 32);
        assert!(p.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
