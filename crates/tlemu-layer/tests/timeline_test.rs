//! Integration test: timeline points, wait points and in-order collection.

mod common;

use common::FakeDriver;
use tlemu_layer::pool::Pools;
use tlemu_layer::timeline::TimelineSemaphore;

#[test]
fn test_point_advances_pending_only() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();
    let mut timeline = TimelineSemaphore::new(0);

    let fence = pools.acquire_fence(&*fake).expect("fence");
    timeline
        .create_point(&mut pools, &*fake, 0, 3, fence)
        .expect("create point");
    pools.unref_fence(fence);

    assert_eq!(timeline.highest_past, 0);
    assert_eq!(timeline.highest_pending, 3);
    assert_eq!(timeline.points().count(), 1);
}

#[test]
fn test_wait_for_observed_value_needs_no_semaphore() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();
    let mut timeline = TimelineSemaphore::new(5);

    let fence = pools.acquire_fence(&*fake).expect("fence");
    let resolved = timeline
        .create_wait_point(&mut pools, &*fake, 3, fence)
        .expect("resolve wait");
    assert!(resolved.is_none());
    assert_eq!(pools.stats().semaphores_created, 0);
}

#[test]
fn test_second_consumer_needs_serializing_signal() {
    let fake = FakeDriver::new(3);
    let mut pools = Pools::new();
    let mut timeline = TimelineSemaphore::new(0);

    let fence = pools.acquire_fence(&*fake).expect("fence");
    let point_semaphore = timeline
        .create_point(&mut pools, &*fake, 2, 1, fence)
        .expect("create point");

    let first = match timeline.create_wait_point(&mut pools, &*fake, 1, fence) {
        Ok(Some(resolved)) => resolved,
        other => panic!("expected a resolved wait, got {:?}", other),
    };
    assert_eq!(first.semaphore, point_semaphore);
    assert_eq!(first.serialize_on, None);

    let second = match timeline.create_wait_point(&mut pools, &*fake, 1, fence) {
        Ok(Some(resolved)) => resolved,
        other => panic!("expected a resolved wait, got {:?}", other),
    };
    assert_ne!(second.semaphore, point_semaphore);
    assert_eq!(second.serialize_on, Some(2));
}

#[test]
fn test_covering_point_is_lowest_reaching_value() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();
    let mut timeline = TimelineSemaphore::new(0);

    let fence = pools.acquire_fence(&*fake).expect("fence");
    for serial in [2, 5, 9] {
        timeline
            .create_point(&mut pools, &*fake, 0, serial, fence)
            .expect("create point");
    }

    assert_eq!(timeline.covering_point(1).map(|p| p.serial), Some(2));
    assert_eq!(timeline.covering_point(3).map(|p| p.serial), Some(5));
    assert_eq!(timeline.covering_point(9).map(|p| p.serial), Some(9));
    assert!(timeline.covering_point(10).is_none());
}

#[test]
fn test_collection_is_strictly_in_order() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();
    let mut timeline = TimelineSemaphore::new(0);

    let first_fence = pools.acquire_fence(&*fake).expect("fence");
    let second_fence = pools.acquire_fence(&*fake).expect("fence");
    timeline
        .create_point(&mut pools, &*fake, 0, 1, first_fence)
        .expect("create point");
    timeline
        .create_point(&mut pools, &*fake, 0, 2, second_fence)
        .expect("create point");

    fake.signal_fence(pools.fence(second_fence));
    timeline.collect_garbage(&mut pools, &*fake).expect("collect");
    assert_eq!(timeline.highest_past, 0);
    assert_eq!(timeline.points().count(), 2);

    fake.signal_fence(pools.fence(first_fence));
    timeline.collect_garbage(&mut pools, &*fake).expect("collect");
    assert_eq!(timeline.highest_past, 2);
    assert_eq!(timeline.highest_pending, 2);
    assert!(!timeline.has_points());

    // Neither signal was ever waited on by the device.
    assert_eq!(pools.stats().semaphores_destroyed, 2);
    assert_eq!(fake.stats().semaphores_destroyed, 2);
}

#[test]
fn test_pinned_point_survives_collection() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();
    let mut timeline = TimelineSemaphore::new(0);

    let fence = pools.acquire_fence(&*fake).expect("fence");
    timeline
        .create_point(&mut pools, &*fake, 0, 1, fence)
        .expect("create point");
    fake.signal_fence(pools.fence(fence));

    timeline.pin(1);
    timeline.collect_garbage(&mut pools, &*fake).expect("collect");
    assert!(timeline.has_points());
    assert_eq!(timeline.highest_past, 0);

    timeline.unpin(1);
    timeline.collect_garbage(&mut pools, &*fake).expect("collect");
    assert!(!timeline.has_points());
    assert_eq!(timeline.highest_past, 1);
}

#[test]
fn test_undo_point_restores_pending_and_recycles() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();
    let mut timeline = TimelineSemaphore::new(0);

    let fence = pools.acquire_fence(&*fake).expect("fence");
    timeline
        .create_point(&mut pools, &*fake, 0, 4, fence)
        .expect("create point");
    timeline.undo_point(&mut pools, &*fake, 0);

    assert_eq!(timeline.highest_pending, 0);
    assert!(!timeline.has_points());
    assert_eq!(pools.stats().free_semaphores, 1);
    assert_eq!(fake.stats().semaphores_destroyed, 0);
}

#[test]
fn test_undo_wait_point_keeps_semaphore_with_issued_signal() {
    let fake = FakeDriver::new(2);
    let mut pools = Pools::new();
    let mut timeline = TimelineSemaphore::new(0);

    let fence = pools.acquire_fence(&*fake).expect("fence");
    timeline
        .create_point(&mut pools, &*fake, 1, 1, fence)
        .expect("create point");
    let _first = timeline
        .create_wait_point(&mut pools, &*fake, 1, fence)
        .expect("first wait");

    // Not yet signaled: the fresh semaphore goes straight back to the pool.
    let unsent = match timeline.create_wait_point(&mut pools, &*fake, 1, fence) {
        Ok(Some(resolved)) => resolved,
        other => panic!("expected a resolved wait, got {:?}", other),
    };
    assert_eq!(timeline.undo_wait_point(&mut pools, &*fake, &unsent), None);
    assert_eq!(pools.stats().free_semaphores, 1);

    // Its serializing signal went out: the caller takes it over instead.
    let sent = match timeline.create_wait_point(&mut pools, &*fake, 1, fence) {
        Ok(Some(resolved)) => resolved,
        other => panic!("expected a resolved wait, got {:?}", other),
    };
    pools.semaphore_mut(sent.wait_semaphore).device_signaled = true;
    assert_eq!(
        timeline.undo_wait_point(&mut pools, &*fake, &sent),
        Some(sent.wait_semaphore)
    );
    assert!(!pools.semaphore(sent.wait_semaphore).device_waited);
    assert_eq!(pools.stats().free_semaphores, 0);
    assert_eq!(fake.stats().semaphores_destroyed, 0);
}

#[test]
fn test_host_signal_moves_both_counters() {
    let mut timeline = TimelineSemaphore::new(2);
    timeline.signal(7);
    assert_eq!(timeline.highest_past, 7);
    assert_eq!(timeline.highest_pending, 7);
}

#[test]
fn test_release_all_returns_everything_to_pools() {
    let fake = FakeDriver::new(2);
    let mut pools = Pools::new();
    let mut timeline = TimelineSemaphore::new(0);

    let fence = pools.acquire_fence(&*fake).expect("fence");
    timeline
        .create_point(&mut pools, &*fake, 0, 1, fence)
        .expect("create point");
    timeline
        .create_wait_point(&mut pools, &*fake, 1, fence)
        .expect("resolve wait");
    pools.unref_fence(fence);

    timeline.release_all(&mut pools, &*fake);
    assert!(!timeline.has_points());
    let stats = pools.stats();
    assert_eq!(stats.free_semaphores, 1);
    assert_eq!(stats.free_fences, 1);
}
