//! Instance-level entry points: creation, destruction, enumeration.

#![allow(non_snake_case)]

use std::ffi::{c_char, CStr};
use std::mem;
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use tlemu_core::error::LayerError;
use tracing::{debug, error, info};

use crate::handle_store;
use crate::loader;
use crate::{LAYER_NAME, TIMELINE_EXTENSION_NAME};

/// Next-layer function pointers and bookkeeping for one `VkInstance`.
pub struct InstanceData {
    pub handle: vk::Instance,
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub fp: ash::InstanceFnV1_0,
    pub get_physical_device_features2: Option<vk::PFN_vkGetPhysicalDeviceFeatures2>,
    pub get_physical_device_features2_khr: Option<vk::PFN_vkGetPhysicalDeviceFeatures2>,
    pub get_physical_device_properties2: Option<vk::PFN_vkGetPhysicalDeviceProperties2>,
    pub get_physical_device_properties2_khr: Option<vk::PFN_vkGetPhysicalDeviceProperties2>,
    pub get_physical_device_external_semaphore_properties:
        Option<vk::PFN_vkGetPhysicalDeviceExternalSemaphoreProperties>,
    pub get_physical_device_external_semaphore_properties_khr:
        Option<vk::PFN_vkGetPhysicalDeviceExternalSemaphoreProperties>,
    physical_devices: Mutex<Vec<vk::PhysicalDevice>>,
}

impl InstanceData {
    unsafe fn load(instance: vk::Instance, gipa: vk::PFN_vkGetInstanceProcAddr) -> Self {
        let lookup = |name: &CStr| gipa(instance, name.as_ptr());
        Self {
            handle: instance,
            get_instance_proc_addr: gipa,
            fp: ash::InstanceFnV1_0::load(|name| mem::transmute(lookup(name))),
            get_physical_device_features2: mem::transmute(lookup(c"vkGetPhysicalDeviceFeatures2")),
            get_physical_device_features2_khr: mem::transmute(lookup(
                c"vkGetPhysicalDeviceFeatures2KHR",
            )),
            get_physical_device_properties2: mem::transmute(lookup(
                c"vkGetPhysicalDeviceProperties2",
            )),
            get_physical_device_properties2_khr: mem::transmute(lookup(
                c"vkGetPhysicalDeviceProperties2KHR",
            )),
            get_physical_device_external_semaphore_properties: mem::transmute(lookup(
                c"vkGetPhysicalDeviceExternalSemaphoreProperties",
            )),
            get_physical_device_external_semaphore_properties_khr: mem::transmute(lookup(
                c"vkGetPhysicalDeviceExternalSemaphorePropertiesKHR",
            )),
            physical_devices: Mutex::new(Vec::new()),
        }
    }
}

// ── Instance ────────────────────────────────────────────────

pub unsafe extern "system" fn vkCreateInstance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    crate::layer_config();
    match create_instance(p_create_info, p_allocator, p_instance) {
        Ok(()) => vk::Result::SUCCESS,
        Err(err) => {
            error!("vkCreateInstance failed: {}", err);
            err.into()
        }
    }
}

unsafe fn create_instance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> Result<(), LayerError> {
    let create_info = p_create_info
        .as_ref()
        .ok_or(LayerError::ChainInfoMissing("VkInstanceCreateInfo"))?;
    let link_info = loader::instance_link_info(create_info)
        .ok_or(LayerError::ChainInfoMissing("VkInstanceCreateInfo"))?;
    let link = link_info
        .u
        .p_layer_info
        .as_ref()
        .ok_or(LayerError::ChainInfoMissing("VkInstanceCreateInfo"))?;
    let gipa = link.pfn_next_get_instance_proc_addr;

    let create: Option<vk::PFN_vkCreateInstance> =
        mem::transmute(gipa(vk::Instance::null(), c"vkCreateInstance".as_ptr()));
    let create = create.ok_or(LayerError::MissingEntryPoint("vkCreateInstance"))?;

    // Advance the link for the next layer down.
    link_info.u.p_layer_info = link.p_next;

    create(p_create_info, p_allocator, p_instance).result()?;
    let instance = *p_instance;

    handle_store::store_instance(instance.as_raw(), Arc::new(InstanceData::load(instance, gipa)));
    info!("instance {:#x} created", instance.as_raw());
    Ok(())
}

pub unsafe extern "system" fn vkDestroyInstance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    let Some(data) = handle_store::remove_instance(instance.as_raw()) else {
        return;
    };
    for physical_device in data.physical_devices.lock().drain(..) {
        handle_store::remove_physical_device(physical_device.as_raw());
    }
    (data.fp.destroy_instance)(instance, p_allocator);
    debug!("instance {:#x} destroyed", instance.as_raw());
}

// ── Enumeration ─────────────────────────────────────────────

pub unsafe extern "system" fn vkEnumeratePhysicalDevices(
    instance: vk::Instance,
    p_physical_device_count: *mut u32,
    p_physical_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    let Some(data) = handle_store::get_instance(instance.as_raw()) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result =
        (data.fp.enumerate_physical_devices)(instance, p_physical_device_count, p_physical_devices);

    if !p_physical_devices.is_null()
        && (result == vk::Result::SUCCESS || result == vk::Result::INCOMPLETE)
    {
        let devices = std::slice::from_raw_parts(p_physical_devices, *p_physical_device_count as usize);
        let mut known = data.physical_devices.lock();
        for &physical_device in devices {
            handle_store::store_physical_device(physical_device.as_raw(), Arc::clone(&data));
            if !known.contains(&physical_device) {
                known.push(physical_device);
            }
        }
    }
    result
}

fn timeline_extension_properties() -> vk::ExtensionProperties {
    let mut properties = vk::ExtensionProperties {
        spec_version: 1,
        ..Default::default()
    };
    for (dst, src) in properties
        .extension_name
        .iter_mut()
        .zip(TIMELINE_EXTENSION_NAME.to_bytes_with_nul())
    {
        *dst = *src as c_char;
    }
    properties
}

unsafe fn is_this_layer(p_layer_name: *const c_char) -> bool {
    !p_layer_name.is_null() && CStr::from_ptr(p_layer_name) == LAYER_NAME
}

/// Only answers for this layer's own name; the loader asks each layer in turn.
pub unsafe extern "system" fn vkEnumerateInstanceExtensionProperties(
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if !is_this_layer(p_layer_name) {
        return vk::Result::ERROR_LAYER_NOT_PRESENT;
    }
    loader::write_out_array(&[timeline_extension_properties()], p_property_count, p_properties)
}

/// Advertise the emulated extension next to whatever the driver exposes, so
/// applications find it without naming this layer.
pub unsafe extern "system" fn vkEnumerateDeviceExtensionProperties(
    physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if is_this_layer(p_layer_name) {
        return loader::write_out_array(&[timeline_extension_properties()], p_property_count, p_properties);
    }
    let Some(data) = handle_store::get_physical_device(physical_device.as_raw()) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let enumerate = data.fp.enumerate_device_extension_properties;
    if !p_layer_name.is_null() {
        return enumerate(physical_device, p_layer_name, p_property_count, p_properties);
    }

    let mut count = 0u32;
    if let Err(err) = enumerate(physical_device, p_layer_name, &mut count, std::ptr::null_mut()).result() {
        return err;
    }
    let mut extensions = vec![vk::ExtensionProperties::default(); count as usize];
    if let Err(err) = enumerate(physical_device, p_layer_name, &mut count, extensions.as_mut_ptr()).result() {
        return err;
    }
    extensions.truncate(count as usize);

    let already_exposed = extensions
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == TIMELINE_EXTENSION_NAME);
    if !already_exposed {
        extensions.push(timeline_extension_properties());
    }
    loader::write_out_array(&extensions, p_property_count, p_properties)
}
