use owbus::notify::{NotifySearchCoordinator, PeriodicPusher};
use owbus::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

/// Records every period it is given; never touches a bus.
#[derive(Default)]
struct RecordingPusher {
    adjustments: Mutex<Vec<Option<Duration>>>,
    period: Mutex<Option<Duration>>,
    immediate: AtomicBool,
}

impl RecordingPusher {
    fn adjustments(&self) -> Vec<Option<Duration>> {
        self.adjustments.lock().unwrap().clone()
    }
}

impl PeriodicPusher for RecordingPusher {
    fn adjust_period(&self, period: Option<Duration>) -> bool {
        self.adjustments.lock().unwrap().push(period);
        let mut current = self.period.lock().unwrap();
        let changed = *current != period;
        *current = period;
        changed && period.is_some() && self.immediate.load(Ordering::SeqCst)
    }

    fn current_period(&self) -> Option<Duration> {
        *self.period.lock().unwrap()
    }
}

struct ManualClock(AtomicU64);

impl ManualClock {
    fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn current_time_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct Fixture {
    coordinator: NotifySearchCoordinator,
    pusher: Arc<RecordingPusher>,
    clock: Arc<ManualClock>,
}

fn fixture(immediate: bool) -> Fixture {
    let pusher = Arc::new(RecordingPusher::default());
    pusher.immediate.store(immediate, Ordering::SeqCst);
    let clock = Arc::new(ManualClock(AtomicU64::new(1_000)));
    let coordinator = NotifySearchCoordinator::new(
        NotifyScope::General,
        Arc::clone(&pusher) as Arc<dyn PeriodicPusher>,
        Arc::clone(&clock) as Arc<dyn TimeSource>,
        Handle::current(),
    );
    Fixture {
        coordinator,
        pusher,
        clock,
    }
}

fn result(serials: &[u64], write_ctm: u64) -> Arc<SearchResult> {
    let addresses = serials.iter().map(|s| DeviceAddress::new(0x28, *s)).collect();
    Arc::new(SearchResult::new(addresses, write_ctm).unwrap())
}

async fn expect_delivery(rx: &mut UnboundedReceiver<Arc<SearchResult>>) -> Arc<SearchResult> {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("channel closed")
}

async fn expect_nothing(rx: &mut UnboundedReceiver<Arc<SearchResult>>) {
    assert!(timeout(QUIET, rx.recv()).await.is_err(), "unexpected delivery");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_effective_period_is_minimum_of_subscribers() {
    let f = fixture(false);
    let (a, _rx_a) = Subscriber::channel("a");
    let (b, _rx_b) = Subscriber::channel("b");

    assert_eq!(f.coordinator.effective_period(), None);

    f.coordinator.schedule_search_notify_for(&a, 5_000).unwrap();
    f.coordinator.schedule_search_notify_for(&b, 1_000).unwrap();
    assert_eq!(f.coordinator.effective_period(), Some(Duration::from_millis(1_000)));
    assert_eq!(f.pusher.current_period(), Some(Duration::from_millis(1_000)));

    f.coordinator.update_scheduled_search_notify_for(a.id(), 500).unwrap();
    assert_eq!(f.pusher.current_period(), Some(Duration::from_millis(500)));

    f.coordinator.cancel_scheduled_search_notify_for(a.id()).unwrap();
    assert_eq!(f.pusher.current_period(), Some(Duration::from_millis(1_000)));

    f.coordinator.cancel_scheduled_search_notify_for(b.id()).unwrap();
    assert_eq!(f.pusher.current_period(), None);

    assert_eq!(
        f.pusher.adjustments(),
        vec![
            Some(Duration::from_millis(5_000)),
            Some(Duration::from_millis(1_000)),
            Some(Duration::from_millis(500)),
            Some(Duration::from_millis(1_000)),
            None,
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_schedule_usage_errors() {
    let f = fixture(false);
    let (a, _rx_a) = Subscriber::channel("a");
    let (b, _rx_b) = Subscriber::channel("b");

    assert_eq!(
        f.coordinator.schedule_search_notify_for(&a, 0),
        Err(ScheduleError::InvalidPeriod)
    );
    assert!(!f.coordinator.is_scheduled(a.id()));

    f.coordinator.schedule_search_notify_for(&a, 1_000).unwrap();
    assert_eq!(
        f.coordinator.schedule_search_notify_for(&a.clone(), 2_000),
        Err(ScheduleError::AlreadyScheduled(a.id()))
    );
    assert_eq!(f.coordinator.scheduled_period_msec(a.id()), Some(1_000));

    // Unregistered wins over a bad period
    assert_eq!(
        f.coordinator.update_scheduled_search_notify_for(b.id(), 0),
        Err(ScheduleError::NotScheduled(b.id()))
    );
    assert_eq!(
        f.coordinator.update_scheduled_search_notify_for(a.id(), 0),
        Err(ScheduleError::InvalidPeriod)
    );
    assert_eq!(
        f.coordinator.update_scheduled_search_notify_for(a.id(), 1_000),
        Err(ScheduleError::PeriodUnchanged {
            subscriber: a.id(),
            period_msec: 1_000
        })
    );
    assert_eq!(
        f.coordinator.cancel_scheduled_search_notify_for(b.id()),
        Err(ScheduleError::NotScheduled(b.id()))
    );

    // Failed calls never reached the pusher
    assert_eq!(f.pusher.adjustments(), vec![Some(Duration::from_millis(1_000))]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_changed_result_fans_out_to_all_subscribers() {
    let f = fixture(false);
    let (a, mut rx_a) = Subscriber::channel("a");
    let (b, mut rx_b) = Subscriber::channel("b");
    f.coordinator.schedule_search_notify_for(&a, 1_000).unwrap();
    f.coordinator.schedule_search_notify_for(&b, 2_000).unwrap();

    let first = result(&[1, 2], 900);
    f.coordinator.notify_search_result(Arc::clone(&first));

    assert_eq!(expect_delivery(&mut rx_a).await, first);
    assert_eq!(expect_delivery(&mut rx_b).await, first);
    assert_eq!(f.coordinator.stats().fan_outs, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unchanged_fingerprint_is_cached_but_not_delivered() {
    let f = fixture(false);
    let (a, mut rx_a) = Subscriber::channel("a");
    f.coordinator.schedule_search_notify_for(&a, 1_000).unwrap();

    f.coordinator.notify_search_result(result(&[1, 2], 900));
    expect_delivery(&mut rx_a).await;

    let repeat = result(&[1, 2], 950);
    f.coordinator.notify_search_result(Arc::clone(&repeat));
    expect_nothing(&mut rx_a).await;

    assert_eq!(f.coordinator.last_result(), Some(repeat));
    let stats = f.coordinator.stats();
    assert_eq!(stats.results_received, 2);
    assert_eq!(stats.results_suppressed, 1);
    assert_eq!(stats.fan_outs, 1);

    // Order matters to the fingerprint
    let reordered = result(&[2, 1], 975);
    f.coordinator.notify_search_result(Arc::clone(&reordered));
    assert_eq!(expect_delivery(&mut rx_a).await, reordered);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fresh_cached_result_goes_to_new_subscriber_only() {
    let f = fixture(false);
    let (a, mut rx_a) = Subscriber::channel("a");
    f.coordinator.schedule_search_notify_for(&a, 1_000).unwrap();

    let cached = result(&[1], 900);
    f.coordinator.notify_search_result(Arc::clone(&cached));
    expect_delivery(&mut rx_a).await;

    f.clock.set(1_000);
    let (b, mut rx_b) = Subscriber::channel("b");
    f.coordinator.schedule_search_notify_for(&b, 5_000).unwrap();

    assert_eq!(expect_delivery(&mut rx_b).await, cached);
    expect_nothing(&mut rx_a).await;
    assert_eq!(f.coordinator.stats().cached_deliveries, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_cached_result_is_not_delivered() {
    let f = fixture(false);
    f.coordinator.notify_search_result(result(&[1], 100));

    f.clock.set(1_000);
    let (a, mut rx_a) = Subscriber::channel("a");
    f.coordinator.schedule_search_notify_for(&a, 500).unwrap();

    expect_nothing(&mut rx_a).await;
    assert_eq!(f.coordinator.stats().cached_deliveries, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cached_result_exactly_at_period_is_delivered() {
    let f = fixture(false);
    f.coordinator.notify_search_result(result(&[1], 500));

    f.clock.set(1_000);
    let (a, mut rx_a) = Subscriber::channel("a");
    f.coordinator.schedule_search_notify_for(&a, 500).unwrap();

    expect_delivery(&mut rx_a).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_immediate_push_discards_cache() {
    let f = fixture(true);
    let seen = result(&[1, 2], 900);
    f.coordinator.notify_search_result(Arc::clone(&seen));
    assert!(f.coordinator.last_result().is_some());

    let (a, mut rx_a) = Subscriber::channel("a");
    f.coordinator.schedule_search_notify_for(&a, 1_000).unwrap();
    assert!(f.coordinator.last_result().is_none());
    expect_nothing(&mut rx_a).await;

    // Same inventory as before the subscription still counts as news
    f.coordinator.notify_search_result(result(&[1, 2], 1_000));
    assert_eq!(expect_delivery(&mut rx_a).await.fingerprint(), seen.fingerprint());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_immediate_push_on_update_discards_cache() {
    let f = fixture(true);
    let (a, mut rx_a) = Subscriber::channel("a");
    f.coordinator.schedule_search_notify_for(&a, 5_000).unwrap();

    let seen = result(&[1, 2], 900);
    f.coordinator.notify_search_result(Arc::clone(&seen));
    expect_delivery(&mut rx_a).await;

    f.coordinator.update_scheduled_search_notify_for(a.id(), 1_000).unwrap();
    assert!(f.coordinator.last_result().is_none());

    // The push started by the tighter period is delivered even though unchanged
    f.coordinator.notify_search_result(result(&[1, 2], 1_000));
    assert_eq!(expect_delivery(&mut rx_a).await.fingerprint(), seen.fingerprint());
    assert_eq!(f.coordinator.stats().results_suppressed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_without_immediate_push_keeps_cache() {
    let f = fixture(false);
    let (a, mut rx_a) = Subscriber::channel("a");
    f.coordinator.schedule_search_notify_for(&a, 5_000).unwrap();

    f.coordinator.notify_search_result(result(&[1], 900));
    expect_delivery(&mut rx_a).await;

    f.coordinator.update_scheduled_search_notify_for(a.id(), 1_000).unwrap();
    assert!(f.coordinator.last_result().is_some());

    f.coordinator.notify_search_result(result(&[1], 1_000));
    expect_nothing(&mut rx_a).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_subscriber_does_not_block_others() {
    let f = fixture(false);
    let noisy = Subscriber::from_fn("noisy", |_| panic!("subscriber failure"));
    let (quiet, mut rx) = Subscriber::channel("quiet");
    f.coordinator.schedule_search_notify_for(&noisy, 1_000).unwrap();
    f.coordinator.schedule_search_notify_for(&quiet, 1_000).unwrap();

    f.coordinator.notify_search_result(result(&[7], 900));
    expect_delivery(&mut rx).await;

    f.coordinator.notify_search_result(result(&[8], 950));
    expect_delivery(&mut rx).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callback_subscriber_receives_results() {
    let f = fixture(false);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let subscriber = Subscriber::from_fn("callback", move |found| {
        sink.lock().unwrap().push(found.len());
    });
    f.coordinator.schedule_search_notify_for(&subscriber, 1_000).unwrap();

    f.coordinator.notify_search_result(result(&[1, 2, 3], 900));

    timeout(WAIT, async {
        while received.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*received.lock().unwrap(), vec![3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_all() {
    let f = fixture(false);
    assert!(!f.coordinator.cancel_all_scheduled_search_notify_for());

    let (a, _rx_a) = Subscriber::channel("a");
    let (b, _rx_b) = Subscriber::channel("b");
    f.coordinator.schedule_search_notify_for(&a, 1_000).unwrap();
    f.coordinator.schedule_search_notify_for(&b, 2_000).unwrap();
    assert_eq!(f.coordinator.stats().currently_scheduled, 2);

    assert!(f.coordinator.cancel_all_scheduled_search_notify_for());
    assert_eq!(f.coordinator.subscriber_count(), 0);
    assert_eq!(f.pusher.current_period(), None);
    assert_eq!(f.coordinator.stats().currently_scheduled, 0);

    // Subscribers can come back afterwards
    f.coordinator.schedule_search_notify_for(&a, 1_000).unwrap();
    assert!(f.coordinator.is_scheduled(a.id()));
}
