//! Integration test: semaphore and fence pool recycling rules.

mod common;

use ash::vk;
use common::FakeDriver;
use tlemu_layer::pool::Pools;

#[test]
fn test_waited_semaphore_is_recycled() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();

    let r = pools.acquire_semaphore(&*fake).expect("create semaphore");
    let handle = pools.semaphore(r).semaphore;
    {
        let entry = pools.semaphore_mut(r);
        entry.device_signaled = true;
        entry.device_waited = true;
        entry.queue = Some(0);
    }
    pools.unref_semaphore(&*fake, r);
    assert_eq!(pools.stats().free_semaphores, 1);

    let again = pools.acquire_semaphore(&*fake).expect("recycle semaphore");
    let entry = pools.semaphore(again);
    assert_eq!(entry.semaphore, handle);
    assert!(!entry.device_signaled);
    assert!(!entry.device_waited);
    assert_eq!(entry.queue, None);

    let stats = pools.stats();
    assert_eq!(stats.semaphores_created, 1);
    assert_eq!(stats.semaphores_recycled, 1);
    assert_eq!(fake.stats().semaphores_created, 1);
}

#[test]
fn test_unsignaled_semaphore_is_recycled() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();

    let r = pools.acquire_semaphore(&*fake).expect("create semaphore");
    pools.unref_semaphore(&*fake, r);

    assert_eq!(pools.stats().free_semaphores, 1);
    assert_eq!(fake.stats().semaphores_destroyed, 0);
}

#[test]
fn test_unwaited_signal_destroys_semaphore() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();

    let r = pools.acquire_semaphore(&*fake).expect("create semaphore");
    pools.semaphore_mut(r).device_signaled = true;
    pools.unref_semaphore(&*fake, r);

    let stats = pools.stats();
    assert_eq!(stats.free_semaphores, 0);
    assert_eq!(stats.semaphores_destroyed, 1);
    assert_eq!(fake.stats().semaphores_destroyed, 1);
    assert_eq!(fake.live_internal_objects(), 0);
}

#[test]
fn test_shared_reference_keeps_semaphore_alive() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();

    let r = pools.acquire_semaphore(&*fake).expect("create semaphore");
    pools.ref_semaphore(r);
    pools.unref_semaphore(&*fake, r);
    assert_eq!(pools.stats().free_semaphores, 0);

    pools.unref_semaphore(&*fake, r);
    assert_eq!(pools.stats().free_semaphores, 1);
}

#[test]
fn test_recycled_fence_is_reset() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();

    let r = pools.acquire_fence(&*fake).expect("create fence");
    let fence = pools.fence(r);
    fake.signal_fence(fence);
    pools.unref_fence(r);

    let again = pools.acquire_fence(&*fake).expect("recycle fence");
    assert_eq!(pools.fence(again), fence);
    assert!(!fake.is_signaled(fence));

    let stats = pools.stats();
    assert_eq!(stats.fences_created, 1);
    assert_eq!(stats.fences_recycled, 1);
}

#[test]
fn test_failed_creation_leaves_pool_untouched() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();
    fake.queue_result("vkCreateSemaphore", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

    match pools.acquire_semaphore(&*fake) {
        Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => {}
        other => panic!("expected ERROR_OUT_OF_DEVICE_MEMORY, got {:?}", other),
    }
    assert_eq!(pools.stats().semaphores_created, 0);

    // The failure is not sticky.
    pools.acquire_semaphore(&*fake).expect("second attempt");
}

#[test]
fn test_failed_reset_keeps_fence_in_pool() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();

    let r = pools.acquire_fence(&*fake).expect("create fence");
    pools.unref_fence(r);
    fake.queue_result("vkResetFences", vk::Result::ERROR_DEVICE_LOST);

    match pools.acquire_fence(&*fake) {
        Err(vk::Result::ERROR_DEVICE_LOST) => {}
        other => panic!("expected ERROR_DEVICE_LOST, got {:?}", other),
    }
    assert_eq!(pools.stats().free_fences, 1);
    assert_eq!(pools.stats().fences_created, 1);
}

#[test]
fn test_destroy_all_releases_referenced_objects() {
    let fake = FakeDriver::new(1);
    let mut pools = Pools::new();

    let _held = pools.acquire_semaphore(&*fake).expect("semaphore");
    let free = pools.acquire_semaphore(&*fake).expect("semaphore");
    pools.unref_semaphore(&*fake, free);
    let _fence = pools.acquire_fence(&*fake).expect("fence");
    assert_eq!(fake.live_internal_objects(), 3);

    pools.destroy_all(&*fake);
    assert_eq!(fake.live_internal_objects(), 0);
    assert_eq!(pools.stats().free_semaphores, 0);
}
