//! Device creation and destruction.

#![allow(non_snake_case)]

use std::ffi::{c_void, CStr};
use std::mem;
use std::sync::Arc;

use ash::vk::{self, Handle};
use tlemu_core::error::LayerError;
use tracing::{debug, error, info, warn};

use crate::device_data::{DeviceData, QueueInfo};
use crate::driver::{ChainDriver, Driver};
use crate::handle_store;
use crate::loader;
use crate::pnext;
use crate::TIMELINE_EXTENSION_NAME;

/// Layer state for one `VkDevice`.
pub struct LayerDevice {
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub chain: Arc<ChainDriver>,
    pub data: DeviceData,
    queues: Vec<vk::Queue>,
}

/// Hides the application's timeline feature request from a driver that
/// cannot honour it, and puts it back when dropped.
struct HiddenTimelineFeatures<'a> {
    timeline: Option<(&'a mut vk::PhysicalDeviceTimelineSemaphoreFeatures<'static>, vk::Bool32)>,
    vulkan12: Option<(&'a mut vk::PhysicalDeviceVulkan12Features<'static>, vk::Bool32)>,
}

impl HiddenTimelineFeatures<'_> {
    /// # Safety
    /// Writes through the application's `const` pNext chain, the same way
    /// `vkCreateDevice` already advances the loader link in that chain. Every
    /// write is undone on drop, before control returns to the application.
    unsafe fn hide(create_info: &vk::DeviceCreateInfo<'_>) -> Self {
        let p_next = create_info.p_next as *mut c_void;
        let timeline = pnext::find_mut::<vk::PhysicalDeviceTimelineSemaphoreFeatures<'static>>(
            p_next,
            vk::StructureType::PHYSICAL_DEVICE_TIMELINE_SEMAPHORE_FEATURES,
        )
        .map(|f| {
            let requested = mem::replace(&mut f.timeline_semaphore, vk::FALSE);
            (f, requested)
        });
        let vulkan12 = pnext::find_mut::<vk::PhysicalDeviceVulkan12Features<'static>>(
            p_next,
            vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_2_FEATURES,
        )
        .map(|f| {
            let requested = mem::replace(&mut f.timeline_semaphore, vk::FALSE);
            (f, requested)
        });
        Self { timeline, vulkan12 }
    }
}

impl Drop for HiddenTimelineFeatures<'_> {
    fn drop(&mut self) {
        if let Some((features, requested)) = self.timeline.as_mut() {
            features.timeline_semaphore = *requested;
        }
        if let Some((features, requested)) = self.vulkan12.as_mut() {
            features.timeline_semaphore = *requested;
        }
    }
}

// ── Device ──────────────────────────────────────────────────

pub unsafe extern "system" fn vkCreateDevice(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    match create_device(physical_device, p_create_info, p_allocator, p_device) {
        Ok(()) => vk::Result::SUCCESS,
        Err(err) => {
            error!("vkCreateDevice failed: {}", err);
            err.into()
        }
    }
}

unsafe fn create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> Result<(), LayerError> {
    let instance = handle_store::get_physical_device(physical_device.as_raw())
        .ok_or(LayerError::UnknownHandle("VkPhysicalDevice"))?;
    let create_info = p_create_info
        .as_ref()
        .ok_or(LayerError::ChainInfoMissing("VkDeviceCreateInfo"))?;
    let link_info = loader::device_link_info(create_info)
        .ok_or(LayerError::ChainInfoMissing("VkDeviceCreateInfo"))?;
    let link = link_info
        .u
        .p_layer_info
        .as_ref()
        .ok_or(LayerError::ChainInfoMissing("VkDeviceCreateInfo"))?;
    let gipa = link.pfn_next_get_instance_proc_addr;
    let gdpa = link.pfn_next_get_device_proc_addr;

    let create: Option<vk::PFN_vkCreateDevice> =
        mem::transmute(gipa(instance.handle, c"vkCreateDevice".as_ptr()));
    let create = create.ok_or(LayerError::MissingEntryPoint("vkCreateDevice"))?;

    // Advance the link for the next layer down.
    link_info.u.p_layer_info = link.p_next;

    // The driver never sees the emulated extension or its feature bit.
    let extensions: Vec<*const std::ffi::c_char> =
        pnext::array(create_info.pp_enabled_extension_names, create_info.enabled_extension_count)
            .iter()
            .copied()
            .filter(|&name| CStr::from_ptr(name) != TIMELINE_EXTENSION_NAME)
            .collect();
    let mut driver_info = *create_info;
    driver_info.enabled_extension_count = extensions.len() as u32;
    driver_info.pp_enabled_extension_names = extensions.as_ptr();

    let result = {
        let _hidden = HiddenTimelineFeatures::hide(create_info);
        create(physical_device, &driver_info, p_allocator, p_device)
    };
    result.result()?;
    let device = *p_device;

    let chain = Arc::new(ChainDriver::load(device, gdpa));
    let queues = match fetch_queues(&instance, physical_device, create_info, device, gdpa) {
        Ok(queues) => queues,
        Err(err) => {
            (chain.fp().destroy_device)(device, p_allocator);
            return Err(err);
        }
    };

    let config = crate::layer_config().scheduler;
    let driver: Arc<dyn Driver> = chain.clone();
    let layer_device = Arc::new(LayerDevice {
        get_device_proc_addr: gdpa,
        chain,
        data: DeviceData::new(driver, &queues, config),
        queues: queues.iter().map(|q| q.handle).collect(),
    });

    for (index, queue) in queues.iter().enumerate() {
        handle_store::store_queue(queue.handle.as_raw(), (Arc::clone(&layer_device), index));
    }
    handle_store::store_device(device.as_raw(), layer_device);
    info!(
        "device {:#x} created with {} queues (batch_serializing_submits={})",
        device.as_raw(),
        queues.len(),
        config.batch_serializing_submits
    );
    Ok(())
}

/// Fetch every queue the device was created with and hand it to the loader.
unsafe fn fetch_queues(
    instance: &crate::instance::InstanceData,
    physical_device: vk::PhysicalDevice,
    create_info: &vk::DeviceCreateInfo<'_>,
    device: vk::Device,
    gdpa: vk::PFN_vkGetDeviceProcAddr,
) -> Result<Vec<QueueInfo>, LayerError> {
    let mut family_count = 0u32;
    (instance.fp.get_physical_device_queue_family_properties)(
        physical_device,
        &mut family_count,
        std::ptr::null_mut(),
    );
    let mut families = vec![vk::QueueFamilyProperties::default(); family_count as usize];
    (instance.fp.get_physical_device_queue_family_properties)(
        physical_device,
        &mut family_count,
        families.as_mut_ptr(),
    );

    let get_device_queue: Option<vk::PFN_vkGetDeviceQueue> =
        mem::transmute(gdpa(device, c"vkGetDeviceQueue".as_ptr()));
    let get_device_queue = get_device_queue.ok_or(LayerError::MissingEntryPoint("vkGetDeviceQueue"))?;
    let get_device_queue2: Option<vk::PFN_vkGetDeviceQueue2> =
        mem::transmute(gdpa(device, c"vkGetDeviceQueue2".as_ptr()));
    let set_loader_data = loader::device_loader_data_callback(create_info);

    let mut queues = Vec::new();
    for queue_info in pnext::array(create_info.p_queue_create_infos, create_info.queue_create_info_count) {
        let family_index = queue_info.queue_family_index;
        for index in 0..queue_info.queue_count {
            let mut queue = vk::Queue::null();
            if queue_info.flags.is_empty() {
                get_device_queue(device, family_index, index, &mut queue);
            } else if let Some(get_device_queue2) = get_device_queue2 {
                let info = vk::DeviceQueueInfo2::default()
                    .flags(queue_info.flags)
                    .queue_family_index(family_index)
                    .queue_index(index);
                get_device_queue2(device, &info, &mut queue);
            } else {
                warn!(family_index, index, "queue created with flags but vkGetDeviceQueue2 is missing");
                continue;
            }

            if let Some(set_loader_data) = set_loader_data {
                set_loader_data(device, queue.as_raw() as usize as *mut c_void).result()?;
            }
            queues.push(QueueInfo {
                handle: queue,
                properties: families.get(family_index as usize).copied().unwrap_or_default(),
            });
        }
    }
    Ok(queues)
}

pub unsafe extern "system" fn vkDestroyDevice(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    let Some(layer_device) = handle_store::remove_device(device.as_raw()) else {
        return;
    };
    for queue in &layer_device.queues {
        handle_store::remove_queue(queue.as_raw());
    }
    layer_device.data.destroy();
    (layer_device.chain.fp().destroy_device)(device, p_allocator);
    debug!("device {:#x} destroyed", device.as_raw());
}
