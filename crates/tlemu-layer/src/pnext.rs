//! Helpers for walking Vulkan `pNext` chains and application-owned arrays.

use std::ffi::c_void;
use std::slice;

use ash::vk;

/// View a `(pointer, count)` pair from an application structure as a slice.
///
/// # Safety
/// When `len > 0`, `ptr` must point to `len` valid elements that outlive `'a`.
pub unsafe fn array<'a, T>(ptr: *const T, len: u32) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(ptr, len as usize) }
    }
}

/// Every structure type in a read-only chain, in order.
///
/// # Safety
/// `p_next` must be null or the head of a valid structure chain.
pub unsafe fn structure_types(p_next: *const c_void) -> Vec<vk::StructureType> {
    let mut types = Vec::new();
    let mut next = p_next as *const vk::BaseInStructure<'_>;
    while let Some(base) = unsafe { next.as_ref() } {
        types.push(base.s_type);
        next = base.p_next;
    }
    types
}

/// First structure of type `s_type` in a read-only chain.
///
/// # Safety
/// `p_next` must be null or the head of a valid chain, and `T` must be the
/// structure that `s_type` identifies.
pub unsafe fn find<'a, T>(p_next: *const c_void, s_type: vk::StructureType) -> Option<&'a T> {
    let mut next = p_next as *const vk::BaseInStructure<'_>;
    while let Some(base) = unsafe { next.as_ref() } {
        if base.s_type == s_type {
            return unsafe { (next as *const T).as_ref() };
        }
        next = base.p_next;
    }
    None
}

/// First structure of type `s_type` in a writable chain.
///
/// # Safety
/// Same as [`find`], and the chain must be writable.
pub unsafe fn find_mut<'a, T>(p_next: *mut c_void, s_type: vk::StructureType) -> Option<&'a mut T> {
    let mut next = p_next as *mut vk::BaseOutStructure<'_>;
    while let Some(base) = unsafe { next.as_mut() } {
        if base.s_type == s_type {
            return unsafe { (next as *mut T).as_mut() };
        }
        next = base.p_next;
    }
    None
}
