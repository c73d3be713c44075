//! TLEMU timeline semaphore layer
//!
//! This cdylib is a Vulkan layer that exposes `VK_KHR_timeline_semaphore` on
//! drivers that only implement binary semaphores and fences. Timeline values
//! are tracked in the layer; every device-side wait or signal is translated
//! into pooled binary semaphores, and submissions whose waits cannot be
//! resolved yet are held back per queue until another submission or a host
//! signal promises the value.

use std::ffi::{c_char, CStr};
use std::sync::OnceLock;

use ash::vk::{self, Handle};
use tlemu_core::config::{default_config_path, LayerConfig};
use tracing::{debug, warn};

pub mod device;
pub mod device_data;
pub mod driver;
pub mod handle_store;
pub mod host_sync;
pub mod instance;
pub mod loader;
pub mod physical_device;
pub mod pnext;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod submission;
pub mod sync;
pub mod timeline;

pub const LAYER_NAME: &CStr = c"VK_LAYER_TLEMU_timeline_semaphore";
pub const TIMELINE_EXTENSION_NAME: &CStr = c"VK_KHR_timeline_semaphore";

// ── Configuration singleton ─────────────────────────────────

static CONFIG: OnceLock<LayerConfig> = OnceLock::new();

/// Layer configuration, loaded once per process. Installs logging on first use.
pub fn layer_config() -> &'static LayerConfig {
    CONFIG.get_or_init(|| {
        let path = default_config_path();
        let (config, err) = LayerConfig::load_or_default(&path);
        tlemu_common::logging::init_logging(&config.logging.filter);
        if let Some(err) = err {
            warn!("ignoring config file {}: {}", path, err);
        }
        config
    })
}

// ── Loader negotiation ──────────────────────────────────────

/// Negotiate the layer interface version with the Vulkan loader.
#[no_mangle]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    p_version_struct: *mut loader::NegotiateLayerInterface,
) -> vk::Result {
    let Some(version) = p_version_struct.as_mut() else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if version.s_type != loader::LAYER_NEGOTIATE_INTERFACE_STRUCT {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if version.loader_layer_interface_version >= 2 {
        version.loader_layer_interface_version = loader::CURRENT_LOADER_LAYER_INTERFACE_VERSION;
        version.pfn_get_instance_proc_addr = Some(vkGetInstanceProcAddr);
        version.pfn_get_device_proc_addr = Some(vkGetDeviceProcAddr);
        version.pfn_get_physical_device_proc_addr = None;
    }
    debug!(
        "negotiated loader layer interface version {}",
        version.loader_layer_interface_version
    );
    vk::Result::SUCCESS
}

// ── Proc address tables ─────────────────────────────────────

/// Hooks that are resolved through `vkGetInstanceProcAddr` only.
unsafe fn instance_hook(name: &str) -> vk::PFN_vkVoidFunction {
    match name {
        "vkGetInstanceProcAddr" => {
            Some(std::mem::transmute(vkGetInstanceProcAddr as *const ()))
        }
        "vkCreateInstance" => {
            Some(std::mem::transmute(instance::vkCreateInstance as *const ()))
        }
        "vkDestroyInstance" => {
            Some(std::mem::transmute(instance::vkDestroyInstance as *const ()))
        }
        "vkEnumeratePhysicalDevices" => {
            Some(std::mem::transmute(instance::vkEnumeratePhysicalDevices as *const ()))
        }
        "vkEnumerateInstanceExtensionProperties" => {
            Some(std::mem::transmute(
                instance::vkEnumerateInstanceExtensionProperties as *const (),
            ))
        }
        "vkEnumerateDeviceExtensionProperties" => {
            Some(std::mem::transmute(
                instance::vkEnumerateDeviceExtensionProperties as *const (),
            ))
        }
        "vkCreateDevice" => {
            Some(std::mem::transmute(device::vkCreateDevice as *const ()))
        }

        // ── Physical device ─────────────────────────────────
        "vkGetPhysicalDeviceFeatures2" => {
            Some(std::mem::transmute(
                physical_device::vkGetPhysicalDeviceFeatures2 as *const (),
            ))
        }
        "vkGetPhysicalDeviceFeatures2KHR" => {
            Some(std::mem::transmute(
                physical_device::vkGetPhysicalDeviceFeatures2KHR as *const (),
            ))
        }
        "vkGetPhysicalDeviceProperties2" => {
            Some(std::mem::transmute(
                physical_device::vkGetPhysicalDeviceProperties2 as *const (),
            ))
        }
        "vkGetPhysicalDeviceProperties2KHR" => {
            Some(std::mem::transmute(
                physical_device::vkGetPhysicalDeviceProperties2KHR as *const (),
            ))
        }
        "vkGetPhysicalDeviceExternalSemaphoreProperties" => {
            Some(std::mem::transmute(
                physical_device::vkGetPhysicalDeviceExternalSemaphoreProperties as *const (),
            ))
        }
        "vkGetPhysicalDeviceExternalSemaphorePropertiesKHR" => {
            Some(std::mem::transmute(
                physical_device::vkGetPhysicalDeviceExternalSemaphorePropertiesKHR as *const (),
            ))
        }
        _ => None,
    }
}

/// Hooks visible through both proc address functions.
unsafe fn device_hook(name: &str) -> vk::PFN_vkVoidFunction {
    match name {
        "vkGetDeviceProcAddr" => {
            Some(std::mem::transmute(vkGetDeviceProcAddr as *const ()))
        }
        "vkDestroyDevice" => {
            Some(std::mem::transmute(device::vkDestroyDevice as *const ()))
        }

        // ── Semaphore ───────────────────────────────────────
        "vkCreateSemaphore" => {
            Some(std::mem::transmute(sync::vkCreateSemaphore as *const ()))
        }
        "vkDestroySemaphore" => {
            Some(std::mem::transmute(sync::vkDestroySemaphore as *const ()))
        }
        "vkImportSemaphoreFdKHR" => {
            Some(std::mem::transmute(sync::vkImportSemaphoreFdKHR as *const ()))
        }
        "vkGetSemaphoreCounterValue" | "vkGetSemaphoreCounterValueKHR" => {
            Some(std::mem::transmute(sync::vkGetSemaphoreCounterValue as *const ()))
        }
        "vkWaitSemaphores" | "vkWaitSemaphoresKHR" => {
            Some(std::mem::transmute(sync::vkWaitSemaphores as *const ()))
        }
        "vkSignalSemaphore" | "vkSignalSemaphoreKHR" => {
            Some(std::mem::transmute(sync::vkSignalSemaphore as *const ()))
        }

        // ── Queue ───────────────────────────────────────────
        "vkQueueSubmit" => {
            Some(std::mem::transmute(sync::vkQueueSubmit as *const ()))
        }
        "vkQueueBindSparse" => {
            Some(std::mem::transmute(sync::vkQueueBindSparse as *const ()))
        }
        "vkQueueWaitIdle" => {
            Some(std::mem::transmute(sync::vkQueueWaitIdle as *const ()))
        }
        "vkDeviceWaitIdle" => {
            Some(std::mem::transmute(sync::vkDeviceWaitIdle as *const ()))
        }
        "vkQueuePresentKHR" => {
            Some(std::mem::transmute(sync::vkQueuePresentKHR as *const ()))
        }
        "vkAcquireNextImageKHR" => {
            Some(std::mem::transmute(sync::vkAcquireNextImageKHR as *const ()))
        }
        _ => None,
    }
}

/// Resolve instance-level entry points: our hooks first, then the next layer.
#[no_mangle]
pub unsafe extern "system" fn vkGetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name).to_str().ok()?;

    if let Some(f) = instance_hook(name).or_else(|| unsafe { device_hook(name) }) {
        return Some(f);
    }
    let data = handle_store::get_instance(instance.as_raw())?;
    (data.get_instance_proc_addr)(instance, p_name)
}

/// Resolve device-level entry points: our hooks first, then the next layer.
#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name).to_str().ok()?;

    if let Some(f) = device_hook(name) {
        return Some(f);
    }
    let dev = handle_store::get_device(device.as_raw())?;
    (dev.get_device_proc_addr)(device, p_name)
}
