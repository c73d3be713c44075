//! The next element of the dispatch chain, seen from the timeline engine.
//!
//! The engine only ever talks to the driver through [`Driver`], so the
//! scheduling logic can be driven by a scripted implementation in tests.
//! [`ChainDriver`] is the production implementation: it forwards to the
//! function table of the next layer (or ICD) below us.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use ash::prelude::VkResult;
use ash::vk;

/// Device-level operations the emulation issues on its own behalf.
///
/// Objects created through this trait are internal to the layer and never
/// leave it, so no allocation callbacks are involved.
pub trait Driver: Send + Sync {
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// `Ok(true)` once signaled, `Ok(false)` while `VK_NOT_READY`.
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    /// `Ok(false)` means the timeout expired.
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout_ns: u64)
        -> VkResult<bool>;

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;

    fn queue_bind_sparse(
        &self,
        queue: vk::Queue,
        binds: &[vk::BindSparseInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    fn device_wait_idle(&self) -> VkResult<()>;
}

/// Function tables of the next layer for one `VkDevice`.
pub struct ChainDriver {
    device: vk::Device,
    fp: ash::DeviceFnV1_0,
    swapchain: ash::khr::swapchain::DeviceFn,
    external_semaphore_fd: ash::khr::external_semaphore_fd::DeviceFn,
}

impl ChainDriver {
    /// Resolve every entry point the layer forwards through `get_device_proc_addr`.
    ///
    /// # Safety
    /// `get_device_proc_addr` must be the next layer's `vkGetDeviceProcAddr`
    /// and `device` a live device created through it.
    pub unsafe fn load(
        device: vk::Device,
        get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    ) -> Self {
        let mut load = |name: &std::ffi::CStr| -> *const c_void {
            unsafe { mem::transmute(get_device_proc_addr(device, name.as_ptr())) }
        };
        Self {
            device,
            fp: ash::DeviceFnV1_0::load(&mut load),
            swapchain: ash::khr::swapchain::DeviceFn::load(&mut load),
            external_semaphore_fd: ash::khr::external_semaphore_fd::DeviceFn::load(&mut load),
        }
    }

    pub fn fp(&self) -> &ash::DeviceFnV1_0 {
        &self.fp
    }

    pub fn swapchain(&self) -> &ash::khr::swapchain::DeviceFn {
        &self.swapchain
    }

    pub fn external_semaphore_fd(&self) -> &ash::khr::external_semaphore_fd::DeviceFn {
        &self.external_semaphore_fd
    }
}

impl Driver for ChainDriver {
    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        let mut semaphore = vk::Semaphore::null();
        unsafe { (self.fp.create_semaphore)(self.device, &info, ptr::null(), &mut semaphore) }
            .result_with_success(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { (self.fp.destroy_semaphore)(self.device, semaphore, ptr::null()) }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let info = vk::FenceCreateInfo::default();
        let mut fence = vk::Fence::null();
        unsafe { (self.fp.create_fence)(self.device, &info, ptr::null(), &mut fence) }
            .result_with_success(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { (self.fp.destroy_fence)(self.device, fence, ptr::null()) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { (self.fp.reset_fences)(self.device, 1, &fence) }.result()
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        match unsafe { (self.fp.get_fence_status)(self.device, fence) } {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::NOT_READY => Ok(false),
            err => Err(err),
        }
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult<bool> {
        let result = unsafe {
            (self.fp.wait_for_fences)(
                self.device,
                fences.len() as u32,
                fences.as_ptr(),
                wait_all.into(),
                timeout_ns,
            )
        };
        match result {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::TIMEOUT => Ok(false),
            err => Err(err),
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        unsafe { (self.fp.queue_submit)(queue, submits.len() as u32, submits.as_ptr(), fence) }
            .result()
    }

    fn queue_bind_sparse(
        &self,
        queue: vk::Queue,
        binds: &[vk::BindSparseInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        unsafe { (self.fp.queue_bind_sparse)(queue, binds.len() as u32, binds.as_ptr(), fence) }
            .result()
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { (self.fp.queue_wait_idle)(queue) }.result()
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { (self.fp.device_wait_idle)(self.device) }.result()
    }
}
