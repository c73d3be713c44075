//! Process-wide registries from dispatchable Vulkan handles to layer state.
//!
//! These are the short-lived first lock tier: a lookup only touches a map
//! shard and never a device lock.

use std::sync::{Arc, OnceLock};

use tlemu_core::handle_map::ObjectMap;

use crate::device::LayerDevice;
use crate::instance::InstanceData;

macro_rules! handle_map {
    ($map_name:ident, $fn_map:ident, $value:ty, $fn_store:ident, $fn_get:ident, $fn_remove:ident) => {
        static $map_name: OnceLock<ObjectMap<$value>> = OnceLock::new();

        fn $fn_map() -> &'static ObjectMap<$value> {
            $map_name.get_or_init(ObjectMap::new)
        }

        pub fn $fn_store(handle: u64, value: $value) {
            $fn_map().insert(handle, value);
        }

        pub fn $fn_get(handle: u64) -> Option<$value> {
            $fn_map().find(handle)
        }

        pub fn $fn_remove(handle: u64) -> Option<$value> {
            $fn_map().remove(handle)
        }
    };
}

handle_map!(INSTANCE_MAP, instance_map, Arc<InstanceData>, store_instance, get_instance, remove_instance);
handle_map!(PHYS_DEV_MAP, phys_dev_map, Arc<InstanceData>, store_physical_device, get_physical_device, remove_physical_device);
handle_map!(DEVICE_MAP, device_map, Arc<LayerDevice>, store_device, get_device, remove_device);
handle_map!(QUEUE_MAP, queue_map, (Arc<LayerDevice>, usize), store_queue, get_queue, remove_queue);
