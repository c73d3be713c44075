//! Loader <-> layer interface structures (`vk_layer.h`), which ash does not ship.

use std::ffi::{c_char, c_void};

use ash::vk;

/// `VkLayerFunction` values. Kept as a plain integer so an unknown value
/// from a newer loader is not undefined behaviour.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerFunction(pub i32);

impl LayerFunction {
    pub const LINK_INFO: Self = Self(0);
    pub const LOADER_DATA_CALLBACK: Self = Self(1);
}

#[allow(non_camel_case_types)]
pub type PFN_GetPhysicalDeviceProcAddr =
    unsafe extern "system" fn(instance: vk::Instance, p_name: *const c_char) -> vk::PFN_vkVoidFunction;

#[allow(non_camel_case_types)]
pub type PFN_vkSetDeviceLoaderData =
    unsafe extern "system" fn(device: vk::Device, object: *mut c_void) -> vk::Result;

#[repr(C)]
pub struct LayerInstanceLink {
    pub p_next: *mut LayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_physical_device_proc_addr: Option<PFN_GetPhysicalDeviceProcAddr>,
}

#[repr(C)]
pub struct LayerDeviceLink {
    pub p_next: *mut LayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
pub union LayerInstanceCreateInfoUnion {
    pub p_layer_info: *mut LayerInstanceLink,
    pub pfn_set_instance_loader_data: *const c_void,
    _layer_device: [*const c_void; 2],
}

#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: LayerFunction,
    pub u: LayerInstanceCreateInfoUnion,
}

#[repr(C)]
pub union LayerDeviceCreateInfoUnion {
    pub p_layer_info: *mut LayerDeviceLink,
    pub pfn_set_device_loader_data: Option<PFN_vkSetDeviceLoaderData>,
}

#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: LayerFunction,
    pub u: LayerDeviceCreateInfoUnion,
}

/// `VkNegotiateLayerInterface`.
#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: u32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<PFN_GetPhysicalDeviceProcAddr>,
}

/// `LAYER_NEGOTIATE_INTERFACE_STRUCT`
pub const LAYER_NEGOTIATE_INTERFACE_STRUCT: u32 = 1;
pub const CURRENT_LOADER_LAYER_INTERFACE_VERSION: u32 = 2;

/// Shared prefix of both loader create-info structures.
#[repr(C)]
struct LoaderChainHeader {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: LayerFunction,
}

unsafe fn find_loader_info(
    p_next: *const c_void,
    s_type: vk::StructureType,
    function: LayerFunction,
) -> *mut c_void {
    let mut next = p_next as *const LoaderChainHeader;
    while let Some(header) = unsafe { next.as_ref() } {
        if header.s_type == s_type && header.function == function {
            return next as *mut c_void;
        }
        next = header.p_next as *const LoaderChainHeader;
    }
    std::ptr::null_mut()
}

/// The loader's link info in a `VkInstanceCreateInfo` chain.
///
/// # Safety
/// `create_info` must be the structure the loader passed to `vkCreateInstance`.
pub unsafe fn instance_link_info<'a>(
    create_info: &vk::InstanceCreateInfo<'_>,
) -> Option<&'a mut LayerInstanceCreateInfo> {
    unsafe {
        (find_loader_info(
            create_info.p_next,
            vk::StructureType::LOADER_INSTANCE_CREATE_INFO,
            LayerFunction::LINK_INFO,
        ) as *mut LayerInstanceCreateInfo)
            .as_mut()
    }
}

/// The loader's link info in a `VkDeviceCreateInfo` chain.
///
/// # Safety
/// `create_info` must be the structure the loader passed to `vkCreateDevice`.
pub unsafe fn device_link_info<'a>(
    create_info: &vk::DeviceCreateInfo<'_>,
) -> Option<&'a mut LayerDeviceCreateInfo> {
    unsafe {
        (find_loader_info(
            create_info.p_next,
            vk::StructureType::LOADER_DEVICE_CREATE_INFO,
            LayerFunction::LINK_INFO,
        ) as *mut LayerDeviceCreateInfo)
            .as_mut()
    }
}

/// The loader callback that stamps dispatch data into layer-created dispatchable objects.
///
/// # Safety
/// As for [`device_link_info`].
pub unsafe fn device_loader_data_callback(
    create_info: &vk::DeviceCreateInfo<'_>,
) -> Option<PFN_vkSetDeviceLoaderData> {
    unsafe {
        let info = (find_loader_info(
            create_info.p_next,
            vk::StructureType::LOADER_DEVICE_CREATE_INFO,
            LayerFunction::LOADER_DATA_CALLBACK,
        ) as *const LayerDeviceCreateInfo)
            .as_ref()?;
        info.u.pfn_set_device_loader_data
    }
}

/// Fill a `(pCount, pItems)` out-array the way every `vkEnumerate*` does.
///
/// # Safety
/// `p_count` must be valid; `p_items`, when non-null, must hold `*p_count` elements.
pub unsafe fn write_out_array<T: Copy>(items: &[T], p_count: *mut u32, p_items: *mut T) -> vk::Result {
    unsafe {
        if p_items.is_null() {
            *p_count = items.len() as u32;
            return vk::Result::SUCCESS;
        }
        let written = (*p_count as usize).min(items.len());
        std::ptr::copy_nonoverlapping(items.as_ptr(), p_items, written);
        *p_count = written as u32;
        if written < items.len() {
            vk::Result::INCOMPLETE
        } else {
            vk::Result::SUCCESS
        }
    }
}
