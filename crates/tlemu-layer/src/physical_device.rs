//! Physical-device queries patched to report native-looking timeline support.

#![allow(non_snake_case)]

use ash::vk::{self, Handle};

use crate::handle_store;
use crate::pnext;

// ── Features ────────────────────────────────────────────────

unsafe fn patch_features(p_features: *mut vk::PhysicalDeviceFeatures2<'_>) {
    let Some(features) = p_features.as_mut() else {
        return;
    };
    if let Some(timeline) = pnext::find_mut::<vk::PhysicalDeviceTimelineSemaphoreFeatures<'_>>(
        features.p_next,
        vk::StructureType::PHYSICAL_DEVICE_TIMELINE_SEMAPHORE_FEATURES,
    ) {
        timeline.timeline_semaphore = vk::TRUE;
    }
    if let Some(vulkan12) = pnext::find_mut::<vk::PhysicalDeviceVulkan12Features<'_>>(
        features.p_next,
        vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
    ) {
        vulkan12.timeline_semaphore = vk::TRUE;
    }
}

pub unsafe extern "system" fn vkGetPhysicalDeviceFeatures2(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures2<'_>,
) {
    let Some(data) = handle_store::get_physical_device(physical_device.as_raw()) else {
        return;
    };
    if let Some(next) = data.get_physical_device_features2 {
        next(physical_device, p_features);
    }
    patch_features(p_features);
}

pub unsafe extern "system" fn vkGetPhysicalDeviceFeatures2KHR(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures2<'_>,
) {
    let Some(data) = handle_store::get_physical_device(physical_device.as_raw()) else {
        return;
    };
    if let Some(next) = data.get_physical_device_features2_khr {
        next(physical_device, p_features);
    }
    patch_features(p_features);
}

// ── Properties ──────────────────────────────────────────────

unsafe fn patch_properties(p_properties: *mut vk::PhysicalDeviceProperties2<'_>) {
    let Some(properties) = p_properties.as_mut() else {
        return;
    };
    if let Some(timeline) = pnext::find_mut::<vk::PhysicalDeviceTimelineSemaphoreProperties<'_>>(
        properties.p_next,
        vk::StructureType::PHYSICAL_DEVICE_TIMELINE_SEMAPHORE_PROPERTIES,
    ) {
        timeline.max_timeline_semaphore_value_difference = u64::MAX;
    }
    if let Some(vulkan12) = pnext::find_mut::<vk::PhysicalDeviceVulkan12Properties<'_>>(
        properties.p_next,
        vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_PROPERTIES,
    ) {
        vulkan12.max_timeline_semaphore_value_difference = u64::MAX;
    }
}

pub unsafe extern "system" fn vkGetPhysicalDeviceProperties2(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties2<'_>,
) {
    let Some(data) = handle_store::get_physical_device(physical_device.as_raw()) else {
        return;
    };
    if let Some(next) = data.get_physical_device_properties2 {
        next(physical_device, p_properties);
    }
    patch_properties(p_properties);
}

pub unsafe extern "system" fn vkGetPhysicalDeviceProperties2KHR(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties2<'_>,
) {
    let Some(data) = handle_store::get_physical_device(physical_device.as_raw()) else {
        return;
    };
    if let Some(next) = data.get_physical_device_properties2_khr {
        next(physical_device, p_properties);
    }
    patch_properties(p_properties);
}

// ── External semaphores ─────────────────────────────────────

/// Emulated timelines have no driver payload, so nothing can be exported or imported.
unsafe fn is_timeline_query(p_info: *const vk::PhysicalDeviceExternalSemaphoreInfo<'_>) -> bool {
    let Some(info) = p_info.as_ref() else {
        return false;
    };
    pnext::find::<vk::SemaphoreTypeCreateInfo<'_>>(info.p_next, vk::StructureType::SEMAPHORE_TYPE_CREATE_INFO)
        .is_some_and(|t| t.semaphore_type == vk::SemaphoreType::TIMELINE)
}

unsafe fn report_no_external_support(p_properties: *mut vk::ExternalSemaphoreProperties<'_>) {
    if let Some(properties) = p_properties.as_mut() {
        properties.export_from_imported_handle_types = vk::ExternalSemaphoreHandleTypeFlags::empty();
        properties.compatible_handle_types = vk::ExternalSemaphoreHandleTypeFlags::empty();
        properties.external_semaphore_features = vk::ExternalSemaphoreFeatureFlags::empty();
    }
}

pub unsafe extern "system" fn vkGetPhysicalDeviceExternalSemaphoreProperties(
    physical_device: vk::PhysicalDevice,
    p_external_semaphore_info: *const vk::PhysicalDeviceExternalSemaphoreInfo<'_>,
    p_external_semaphore_properties: *mut vk::ExternalSemaphoreProperties<'_>,
) {
    if is_timeline_query(p_external_semaphore_info) {
        return report_no_external_support(p_external_semaphore_properties);
    }
    let Some(data) = handle_store::get_physical_device(physical_device.as_raw()) else {
        return;
    };
    if let Some(next) = data.get_physical_device_external_semaphore_properties {
        next(physical_device, p_external_semaphore_info, p_external_semaphore_properties);
    }
}

pub unsafe extern "system" fn vkGetPhysicalDeviceExternalSemaphorePropertiesKHR(
    physical_device: vk::PhysicalDevice,
    p_external_semaphore_info: *const vk::PhysicalDeviceExternalSemaphoreInfo<'_>,
    p_external_semaphore_properties: *mut vk::ExternalSemaphoreProperties<'_>,
) {
    if is_timeline_query(p_external_semaphore_info) {
        return report_no_external_support(p_external_semaphore_properties);
    }
    let Some(data) = handle_store::get_physical_device(physical_device.as_raw()) else {
        return;
    };
    if let Some(next) = data.get_physical_device_external_semaphore_properties_khr {
        next(physical_device, p_external_semaphore_info, p_external_semaphore_properties);
    }
}
