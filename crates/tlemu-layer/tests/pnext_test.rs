//! Integration test: pNext chain walking and application array views.

use std::ffi::c_void;

use ash::vk;
use tlemu_layer::pnext;

#[test]
fn test_null_array_is_empty() {
    let view = unsafe { pnext::array::<u64>(std::ptr::null(), 4) };
    assert!(view.is_empty());
}

#[test]
fn test_find_chained_timeline_values() {
    let wait_values = [3u64, 7];
    let mut protected = vk::ProtectedSubmitInfo::default();
    let mut timeline = vk::TimelineSemaphoreSubmitInfo::default().wait_semaphore_values(&wait_values);
    let info = vk::SubmitInfo::default()
        .push_next(&mut protected)
        .push_next(&mut timeline);

    let types = unsafe { pnext::structure_types(info.p_next) };
    assert_eq!(types.len(), 2);
    assert!(types.contains(&vk::StructureType::PROTECTED_SUBMIT_INFO));
    assert!(types.contains(&vk::StructureType::TIMELINE_SEMAPHORE_SUBMIT_INFO));

    let found = unsafe {
        pnext::find::<vk::TimelineSemaphoreSubmitInfo<'_>>(
            info.p_next,
            vk::StructureType::TIMELINE_SEMAPHORE_SUBMIT_INFO,
        )
    };
    match found {
        Some(values) => {
            let view = unsafe { pnext::array(values.p_wait_semaphore_values, values.wait_semaphore_value_count) };
            assert_eq!(view, &wait_values);
        }
        None => panic!("expected a chained VkTimelineSemaphoreSubmitInfo"),
    }

    let missing = unsafe {
        pnext::find::<vk::DeviceGroupSubmitInfo<'_>>(info.p_next, vk::StructureType::DEVICE_GROUP_SUBMIT_INFO)
    };
    assert!(missing.is_none());
}

#[test]
fn test_find_mut_patches_output_chain() {
    let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
    let features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan12);

    let p_next = features.p_next as *mut c_void;
    match unsafe {
        pnext::find_mut::<vk::PhysicalDeviceVulkan12Features<'_>>(
            p_next,
            vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
        )
    } {
        Some(found) => found.timeline_semaphore = vk::TRUE,
        None => panic!("expected a chained VkPhysicalDeviceVulkan12Features"),
    }

    assert_eq!(vulkan12.timeline_semaphore, vk::TRUE);
}
