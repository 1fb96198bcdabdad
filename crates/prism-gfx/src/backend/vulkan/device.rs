use std::{ffi::CStr, mem::ManuallyDrop};

use ash::vk;
use itertools::Itertools;

use crate::{
    backend::types::RayTracingCaps,
    error::{GfxResult, GraphicsError},
};

/// 创建 Vulkan 设备时的选项
#[derive(Clone, Debug)]
pub struct VulkanDeviceConfig {
    pub app_name: String,
    /// 开启 `VK_LAYER_KHRONOS_validation` 以及 debug utils
    pub validation: bool,
}

impl Default for VulkanDeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "prism".to_string(),
            validation: cfg!(debug_assertions),
        }
    }
}

/// Vulkan 调用失败时转换为 [`GraphicsError`]
pub(super) fn vk_error(call: &'static str) -> impl Fn(vk::Result) -> GraphicsError {
    move |result| match result {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost(format!("{call}: {result:?}")),
        _ => GraphicsError::device_call(call, format!("{result:?}")),
    }
}

/// instance、device、唯一的 direct queue 以及 vma
///
/// # Destroy
///
/// 需要手动调用 `destroy`，并且在此之前销毁所有由它创建的对象。
pub(super) struct VulkanDevice {
    /// 需要保证 Entry 的生命周期覆盖 instance
    _entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family: u32,

    pub acceleration_structure: ash::khr::acceleration_structure::Device,
    pub ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,
    pub debug_utils: Option<ash::ext::debug_utils::Device>,

    /// vma 需要在 device 之前销毁
    pub allocator: ManuallyDrop<vk_mem::Allocator>,

    pub caps: RayTracingCaps,
    pub device_name: String,
}

impl VulkanDevice {
    pub fn new(config: &VulkanDeviceConfig) -> GfxResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GraphicsError::device_call("vkGetInstanceProcAddr", e.to_string()))?;
        let instance = Self::create_instance(&entry, config)?;

        let (physical_device, queue_family) = Self::pick_physical_device(&instance)?;
        let (caps, device_name) = Self::query_caps(&instance, physical_device);
        log::info!("vulkan device: {}, ray tracing caps: {:?}", device_name, caps);

        let device = Self::create_device(&instance, physical_device, queue_family)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let acceleration_structure = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let ray_tracing_pipeline = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);
        let debug_utils = config.validation.then(|| ash::ext::debug_utils::Device::new(&instance, &device));

        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(&instance, &device, physical_device);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        vma_ci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        let allocator = unsafe { vk_mem::Allocator::new(vma_ci) }.map_err(vk_error("vmaCreateAllocator"))?;

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family,
            acceleration_structure,
            ray_tracing_pipeline,
            debug_utils,
            allocator: ManuallyDrop::new(allocator),
            caps,
            device_name,
        })
    }

    pub fn destroy(&mut self) {
        log::info!("destroying vulkan device `{}`", self.device_name);
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// 创建过程的辅助函数
impl VulkanDevice {
    /// 光追所需的 device extensions
    fn required_device_exts() -> [&'static CStr; 3] {
        [
            ash::khr::acceleration_structure::NAME,
            ash::khr::ray_tracing_pipeline::NAME,
            // acceleration structure 依赖
            ash::khr::deferred_host_operations::NAME,
        ]
    }

    fn create_instance(entry: &ash::Entry, config: &VulkanDeviceConfig) -> GfxResult<ash::Instance> {
        let app_name = std::ffi::CString::new(config.app_name.as_str())
            .map_err(|e| GraphicsError::device_call("vkCreateInstance", e.to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .engine_name(c"prism")
            .api_version(vk::API_VERSION_1_3);

        let (layers, exts) = if config.validation {
            (vec![c"VK_LAYER_KHRONOS_validation".as_ptr()], vec![ash::ext::debug_utils::NAME.as_ptr()])
        } else {
            (vec![], vec![])
        };

        let instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&exts);
        unsafe { entry.create_instance(&instance_ci, None) }.map_err(vk_error("vkCreateInstance"))
    }

    /// 选择支持光追的设备，独显优先；queue family 需要同时支持 graphics 和 compute
    fn pick_physical_device(instance: &ash::Instance) -> GfxResult<(vk::PhysicalDevice, u32)> {
        let pdevices = unsafe { instance.enumerate_physical_devices() }.map_err(vk_error("vkEnumeratePhysicalDevices"))?;

        let candidates = pdevices
            .into_iter()
            .filter_map(|pdevice| {
                let exts = unsafe { instance.enumerate_device_extension_properties(pdevice) }.ok()?;
                let supported = Self::required_device_exts()
                    .iter()
                    .all(|required| exts.iter().any(|e| e.extension_name_as_c_str() == Ok(*required)));
                if !supported {
                    return None;
                }

                let families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
                let family = families
                    .iter()
                    .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))?;
                let props = unsafe { instance.get_physical_device_properties(pdevice) };
                Some((pdevice, family as u32, props.device_type))
            })
            .collect_vec();

        candidates
            .iter()
            .find(|(_, _, ty)| *ty == vk::PhysicalDeviceType::DISCRETE_GPU)
            .or_else(|| candidates.first())
            .map(|(pdevice, family, _)| (*pdevice, *family))
            .ok_or_else(|| {
                GraphicsError::device_call("vkEnumeratePhysicalDevices", "no device supports ray tracing pipelines")
            })
    }

    fn query_caps(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> (RayTracingCaps, String) {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let device_name = {
            let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_props);
            unsafe { instance.get_physical_device_properties2(pdevice, &mut props2) };
            props2
                .properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        let caps = RayTracingCaps {
            shader_identifier_size: rt_props.shader_group_handle_size,
            shader_record_alignment: rt_props.shader_group_handle_alignment,
            shader_table_alignment: rt_props.shader_group_base_alignment,
            max_recursion_depth: rt_props.max_ray_recursion_depth,
        };
        (caps, device_name)
    }

    fn create_device(
        instance: &ash::Instance,
        pdevice: vk::PhysicalDevice,
        queue_family: u32,
    ) -> GfxResult<ash::Device> {
        let exts = Self::required_device_exts().map(|e| e.as_ptr());
        log::info!("device exts: {:?}", Self::required_device_exts());

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            // 即使一些 descriptor 是 invalid
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true)
            .descriptor_binding_acceleration_structure_update_after_bind(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            // 用于 buffer device address
            .features(vk::PhysicalDeviceFeatures::default().shader_int64(true));

        let priorities = [1.0_f32];
        let queue_ci = [vk::DeviceQueueCreateInfo::default().queue_family_index(queue_family).queue_priorities(&priorities)];
        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_ci)
            .enabled_extension_names(&exts)
            .push_next(&mut features2)
            .push_next(&mut features12)
            .push_next(&mut features13)
            .push_next(&mut as_features)
            .push_next(&mut rt_features);

        unsafe { instance.create_device(pdevice, &device_ci, None) }.map_err(vk_error("vkCreateDevice"))
    }
}
