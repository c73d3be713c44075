//! Semaphore and queue entry points routed into the timeline engine.

#![allow(non_snake_case)]

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use tracing::trace;

use crate::handle_store;
use crate::pnext;

fn to_vk(result: VkResult<()>) -> vk::Result {
    match result {
        Ok(()) => vk::Result::SUCCESS,
        Err(err) => err,
    }
}

// ── Semaphore ───────────────────────────────────────────────

pub unsafe extern "system" fn vkCreateSemaphore(
    device: vk::Device,
    p_create_info: *const vk::SemaphoreCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_semaphore: *mut vk::Semaphore,
) -> vk::Result {
    let Some(dev) = handle_store::get_device(device.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let Some(create_info) = p_create_info.as_ref() else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let type_info = pnext::find::<vk::SemaphoreTypeCreateInfo<'_>>(
        create_info.p_next,
        vk::StructureType::SEMAPHORE_TYPE_CREATE_INFO,
    );
    match type_info {
        Some(info) if info.semaphore_type == vk::SemaphoreType::TIMELINE => {
            *p_semaphore = dev.data.create_timeline(info.initial_value);
            vk::Result::SUCCESS
        }
        _ => (dev.chain.fp().create_semaphore)(device, p_create_info, p_allocator, p_semaphore),
    }
}

pub unsafe extern "system" fn vkDestroySemaphore(
    device: vk::Device,
    semaphore: vk::Semaphore,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if semaphore == vk::Semaphore::null() {
        return;
    }
    let Some(dev) = handle_store::get_device(device.as_raw()) else {
        return;
    };
    if dev.data.is_timeline(semaphore) {
        dev.data.destroy_timeline(semaphore);
    } else {
        dev.data.forget_semaphore(semaphore);
        (dev.chain.fp().destroy_semaphore)(device, semaphore, p_allocator);
    }
}

pub unsafe extern "system" fn vkImportSemaphoreFdKHR(
    device: vk::Device,
    p_import_semaphore_fd_info: *const vk::ImportSemaphoreFdInfoKHR<'_>,
) -> vk::Result {
    let Some(dev) = handle_store::get_device(device.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let result = (dev.chain.external_semaphore_fd().import_semaphore_fd_khr)(device, p_import_semaphore_fd_info);
    if result == vk::Result::SUCCESS {
        if let Some(info) = p_import_semaphore_fd_info.as_ref() {
            if info.flags.contains(vk::SemaphoreImportFlags::TEMPORARY) {
                trace!(semaphore = ?info.semaphore, "temporary payload imported");
                dev.data.mark_temporary(info.semaphore);
            }
        }
    }
    result
}

pub unsafe extern "system" fn vkGetSemaphoreCounterValue(
    device: vk::Device,
    semaphore: vk::Semaphore,
    p_value: *mut u64,
) -> vk::Result {
    let Some(dev) = handle_store::get_device(device.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    match dev.data.counter_value(semaphore) {
        Ok(value) => {
            *p_value = value;
            vk::Result::SUCCESS
        }
        Err(err) => err,
    }
}

pub unsafe extern "system" fn vkWaitSemaphores(
    device: vk::Device,
    p_wait_info: *const vk::SemaphoreWaitInfo<'_>,
    timeout: u64,
) -> vk::Result {
    let Some(dev) = handle_store::get_device(device.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let Some(wait_info) = p_wait_info.as_ref() else {
        return vk::Result::SUCCESS;
    };
    let semaphores = pnext::array(wait_info.p_semaphores, wait_info.semaphore_count);
    let values = pnext::array(wait_info.p_values, wait_info.semaphore_count);
    let targets: Vec<(vk::Semaphore, u64)> = semaphores.iter().copied().zip(values.iter().copied()).collect();
    let wait_any = wait_info.flags.contains(vk::SemaphoreWaitFlags::ANY);

    match dev.data.wait_semaphores(&targets, wait_any, timeout) {
        Ok(true) => vk::Result::SUCCESS,
        Ok(false) => vk::Result::TIMEOUT,
        Err(err) => err,
    }
}

pub unsafe extern "system" fn vkSignalSemaphore(
    device: vk::Device,
    p_signal_info: *const vk::SemaphoreSignalInfo<'_>,
) -> vk::Result {
    let Some(dev) = handle_store::get_device(device.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let Some(signal_info) = p_signal_info.as_ref() else {
        return vk::Result::SUCCESS;
    };
    to_vk(dev.data.signal_semaphore(signal_info.semaphore, signal_info.value))
}

// ── Queue ───────────────────────────────────────────────────

pub unsafe extern "system" fn vkQueueSubmit(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo<'_>,
    fence: vk::Fence,
) -> vk::Result {
    let Some((dev, index)) = handle_store::get_queue(queue.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    to_vk(dev.data.queue_submit(index, pnext::array(p_submits, submit_count), fence))
}

pub unsafe extern "system" fn vkQueueBindSparse(
    queue: vk::Queue,
    bind_info_count: u32,
    p_bind_info: *const vk::BindSparseInfo<'_>,
    fence: vk::Fence,
) -> vk::Result {
    let Some((dev, index)) = handle_store::get_queue(queue.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    to_vk(dev.data.queue_bind_sparse(index, pnext::array(p_bind_info, bind_info_count), fence))
}

pub unsafe extern "system" fn vkQueueWaitIdle(queue: vk::Queue) -> vk::Result {
    let Some((dev, index)) = handle_store::get_queue(queue.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    to_vk(dev.data.queue_wait_idle(index))
}

pub unsafe extern "system" fn vkDeviceWaitIdle(device: vk::Device) -> vk::Result {
    let Some(dev) = handle_store::get_device(device.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    to_vk(dev.data.device_wait_idle())
}

// ── Swapchain ───────────────────────────────────────────────

/// Presentation has to follow every deferred submission on the queue.
pub unsafe extern "system" fn vkQueuePresentKHR(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let Some((dev, index)) = handle_store::get_queue(queue.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    if let Err(err) = dev.data.drain_queue(index) {
        return err;
    }
    (dev.chain.swapchain().queue_present_khr)(queue, p_present_info)
}

/// An acquire leaves a temporary payload in `semaphore`.
pub unsafe extern "system" fn vkAcquireNextImageKHR(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    let Some(dev) = handle_store::get_device(device.as_raw()) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let result = (dev.chain.swapchain().acquire_next_image_khr)(
        device,
        swapchain,
        timeout,
        semaphore,
        fence,
        p_image_index,
    );
    if result == vk::Result::SUCCESS || result == vk::Result::SUBOPTIMAL_KHR {
        dev.data.mark_temporary(semaphore);
    }
    result
}
