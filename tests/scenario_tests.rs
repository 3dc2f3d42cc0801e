use owbus::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

fn started_bus() -> (Arc<SimulatedBus>, Arc<BusMaster>) {
    let driver = Arc::new(SimulatedBus::new("scenario-bus"));
    let bus = BusMaster::new(Arc::clone(&driver), Handle::current());
    assert_eq!(
        bus.query_start_bus_cmd(false).execute(),
        Ok(command::StartBusResult::Success)
    );
    (driver, bus)
}

async fn next(rx: &mut UnboundedReceiver<Arc<SearchResult>>, within: Duration) -> Arc<SearchResult> {
    timeout(within, rx.recv())
        .await
        .expect("no notification in time")
        .expect("channel closed")
}

fn general_period(bus: &BusMaster) -> Option<Duration> {
    bus.coordinator(NotifyScope::General).pusher().current_period()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inventory_changes_are_notified_until_cancelled() {
    let (driver, bus) = started_bus();
    let (a, mut rx) = Subscriber::channel("a");

    bus.schedule_search_notify_for(NotifyScope::General, &a, 250).unwrap();

    let empty = next(&mut rx, Duration::from_millis(500)).await;
    assert!(empty.is_empty());

    driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 1)));
    let one = next(&mut rx, Duration::from_millis(750)).await;
    assert_eq!(one.len(), 1);
    assert_ne!(one.fingerprint(), 0);

    driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 2)));
    driver.add_device(SimDevice::new(DeviceAddress::new(0x10, 3)));
    let three = loop {
        // Both additions may land in separate searches
        let found = next(&mut rx, Duration::from_millis(750)).await;
        if found.len() == 3 {
            break found;
        }
    };
    assert_ne!(three.fingerprint(), one.fingerprint());

    bus.cancel_scheduled_search_notify_for(NotifyScope::General, a.id())
        .unwrap();
    assert_eq!(general_period(&bus), None);

    // A notification already dispatched may still be queued; nothing new after that
    sleep(Duration::from_millis(100)).await;
    while rx.try_recv().is_ok() {}
    driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 4)));
    assert!(timeout(Duration::from_millis(750), rx.recv()).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unchanged_inventory_is_not_renotified() {
    let (driver, bus) = started_bus();
    driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 1)));
    let (a, mut rx) = Subscriber::channel("a");

    bus.schedule_search_notify_for(NotifyScope::General, &a, 50).unwrap();
    next(&mut rx, Duration::from_millis(500)).await;

    sleep(Duration::from_millis(400)).await;
    assert!(rx.try_recv().is_err());

    let stats = bus.notify_stats(NotifyScope::General);
    assert!(stats.results_received >= 3);
    assert_eq!(stats.fan_outs, 1);
    assert!(stats.results_suppressed >= 2);

    bus.cancel_all_scheduled_search_notify();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_faster_subscriber_drives_the_period() {
    let (_driver, bus) = started_bus();
    let (a, _rx_a) = Subscriber::channel("a");
    let (b, _rx_b) = Subscriber::channel("b");

    bus.schedule_search_notify_for(NotifyScope::General, &a, 500).unwrap();
    assert_eq!(general_period(&bus), Some(Duration::from_millis(500)));

    bus.schedule_search_notify_for(NotifyScope::General, &b, 250).unwrap();
    assert_eq!(general_period(&bus), Some(Duration::from_millis(250)));

    let before = bus.notify_stats(NotifyScope::General).results_received;
    sleep(Duration::from_millis(1_100)).await;
    let searched = bus.notify_stats(NotifyScope::General).results_received - before;
    assert!(searched >= 3, "only {searched} searches at 250 ms");

    bus.cancel_scheduled_search_notify_for(NotifyScope::General, b.id())
        .unwrap();
    assert_eq!(general_period(&bus), Some(Duration::from_millis(500)));

    assert!(bus.cancel_all_scheduled_search_notify());
    assert_eq!(general_period(&bus), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_with_same_period_is_rejected() {
    let (_driver, bus) = started_bus();
    let (a, _rx_a) = Subscriber::channel("a");
    bus.schedule_search_notify_for(NotifyScope::General, &a, 500).unwrap();

    assert_eq!(
        bus.update_scheduled_search_notify_for(NotifyScope::General, a.id(), 500),
        Err(ScheduleError::PeriodUnchanged {
            subscriber: a.id(),
            period_msec: 500
        })
    );
    assert_eq!(general_period(&bus), Some(Duration::from_millis(500)));

    bus.update_scheduled_search_notify_for(NotifyScope::General, a.id(), 200)
        .unwrap();
    assert_eq!(general_period(&bus), Some(Duration::from_millis(200)));

    bus.cancel_all_scheduled_search_notify();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_subscriber_receives_fresh_cached_result() {
    let (driver, bus) = started_bus();
    driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 1)));
    let (a, mut rx_a) = Subscriber::channel("a");
    let (b, mut rx_b) = Subscriber::channel("b");

    bus.schedule_search_notify_for(NotifyScope::General, &a, 10_000).unwrap();
    let first = next(&mut rx_a, Duration::from_millis(500)).await;

    // Same period: the timer stays put, so b is served from the cache
    bus.schedule_search_notify_for(NotifyScope::General, &b, 10_000).unwrap();
    let cached = next(&mut rx_b, Duration::from_millis(500)).await;
    assert_eq!(cached, first);
    assert!(timeout(Duration::from_millis(200), rx_a.recv()).await.is_err());
    assert_eq!(bus.notify_stats(NotifyScope::General).cached_deliveries, 1);

    bus.cancel_all_scheduled_search_notify();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_alarm_scope_reports_alarming_devices_only() {
    let (driver, bus) = started_bus();
    let quiet = DeviceAddress::new(0x28, 1);
    let hot = DeviceAddress::new(0x28, 2);
    driver.add_device(SimDevice::new(quiet));
    driver.add_device(SimDevice::new(hot));
    let (watcher, mut rx) = Subscriber::channel("alarm-watcher");

    bus.schedule_search_notify_for(NotifyScope::Alarm, &watcher, 100).unwrap();
    assert!(next(&mut rx, Duration::from_millis(500)).await.is_empty());

    driver.set_alarm(&hot, true);
    let alarming = next(&mut rx, Duration::from_millis(500)).await;
    assert_eq!(alarming.addresses(), &[hot]);

    // General scope never ran
    assert_eq!(bus.notify_stats(NotifyScope::General).results_received, 0);
    assert!(bus.cancel_all_scheduled_search_notify());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_searches_do_not_notify() {
    let (driver, bus) = started_bus();
    driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 1)));
    driver.fail_next_operations(3);
    let (a, mut rx) = Subscriber::channel("a");

    bus.schedule_search_notify_for(NotifyScope::General, &a, 50).unwrap();

    let found = next(&mut rx, Duration::from_secs(1)).await;
    assert_eq!(found.len(), 1);
    assert_eq!(driver.fault_stats().forced_failures, 3);
    let stats = bus.notify_stats(NotifyScope::General);
    assert!(stats.results_received >= 1);
    assert_eq!(stats.fan_outs, 1);

    bus.cancel_all_scheduled_search_notify();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stopped_bus_keeps_subscriptions_but_finds_nothing() {
    let (driver, bus) = started_bus();
    driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 1)));
    let (a, mut rx) = Subscriber::channel("a");

    bus.schedule_search_notify_for(NotifyScope::General, &a, 50).unwrap();
    next(&mut rx, Duration::from_millis(500)).await;

    assert_eq!(
        bus.query_stop_bus_cmd(false).execute(),
        Ok(command::StopBusResult::Success)
    );
    driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 2)));
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    assert!(bus.coordinator(NotifyScope::General).is_scheduled(a.id()));

    bus.query_start_bus_cmd(false).execute().unwrap();
    assert_eq!(next(&mut rx, Duration::from_millis(500)).await.len(), 2);

    bus.cancel_all_scheduled_search_notify();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscriber_may_cancel_itself_from_its_callback() {
    let (driver, bus) = started_bus();
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    let weak_bus = Arc::downgrade(&bus);
    let slot: Arc<std::sync::Mutex<Option<SubscriberId>>> = Arc::default();
    let own_id = Arc::clone(&slot);
    let once = Subscriber::from_fn("one-shot", move |found| {
        let id = *own_id.lock().unwrap();
        if let (Some(bus), Some(id)) = (weak_bus.upgrade(), id) {
            let cancelled = bus.cancel_scheduled_search_notify_for(NotifyScope::General, id);
            let _ = done_tx.send((found.len(), cancelled.is_ok()));
        }
    });
    *slot.lock().unwrap() = Some(once.id());

    bus.schedule_search_notify_for(NotifyScope::General, &once, 50).unwrap();
    let (len, cancelled) = timeout(Duration::from_secs(1), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(len, 0);
    assert!(cancelled);
    assert_eq!(general_period(&bus), None);

    driver.add_device(SimDevice::new(DeviceAddress::new(0x28, 1)));
    sleep(Duration::from_millis(200)).await;
    assert!(done_rx.try_recv().is_err());
}
