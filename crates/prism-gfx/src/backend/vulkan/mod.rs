//! 基于 ash + vk-mem 的后端
//!
//! - command allocator：一个 command pool，reset 时整体重置
//! - fence：timeline semaphore
//! - shader visible 的 CBV/SRV/UAV heap：一个 bindless descriptor set（storage image / storage buffer / 加速结构）
//! - global root signature：bindless set + 每个 descriptor table 一个 u32 push constant（slot 下标）
//! - local root signature：参数以 GPU descriptor handle 的形式写在 shader record 中

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    ffi::CString,
    io::Cursor,
    time::Duration,
};

use ash::vk;
use itertools::Itertools;
use vk_mem::Alloc;

use crate::{
    backend::{
        GfxBackend,
        descriptor_handle::{CPU_HANDLE_TAG, DESCRIPTOR_INCREMENT, GPU_HANDLE_TAG, capacity_fits, heap_start},
        types::{
            AllocatorId, AsInputs, AsPrebuildInfo, BufferDesc, CpuDescriptorHandle, DescriptorHeapDesc,
            DescriptorHeapId, DescriptorHeapInfo, DescriptorHeapType, FenceId, FenceWait, GpuDescriptorHandle,
            GpuVirtualAddress, HeapType, NativeResource, NativeResourceId, RayTracingCaps, RootSignatureId, ShaderIdentifier,
            StateObjectId, TextureDesc, ViewDesc,
        },
    },
    basic::align::align_up,
    commands::command_list::Command,
    error::{GfxResult, GraphicsError},
    pipelines::{
        root_signature::{RootSignatureDesc, RootSignatureKind},
        shader::ShaderBlob,
        state_object::{HitGroupType, ShaderStage, StateObjectDesc},
    },
    raytracing::instance::InstanceDesc,
};

mod convert;
mod device;
mod objects;
mod recorder;

pub use device::VulkanDeviceConfig;
use device::{VulkanDevice, vk_error};
use objects::{
    VkAccelerationStructure, VkAllocator, VkDescriptorHeap, VkFence, VkObjects, VkResource, VkResourceKind,
    VkRootSignature, VkStateObject,
};
use recorder::CommandRecorder;

/// bindless descriptor set 每个 binding 的容量，shader visible heap 的容量不能超过它
pub const BINDLESS_CAPACITY: u32 = 4096;

const BINDING_STORAGE_IMAGE: u32 = 0;
const BINDING_STORAGE_BUFFER: u32 = 1;
const BINDING_ACCELERATION_STRUCTURE: u32 = 2;

/// 加速结构的起始地址需要 256 字节对齐
const BUFFER_ALIGNMENT: u64 = 256;

pub struct VulkanBackend {
    device: VulkanDevice,
    bindless_layout: vk::DescriptorSetLayout,
    objects: RefCell<VkObjects>,
    next_id: Cell<u64>,
}

impl VulkanBackend {
    pub fn new(config: &VulkanDeviceConfig) -> GfxResult<Self> {
        let device = VulkanDevice::new(config)?;
        let bindless_layout = Self::create_bindless_layout(&device)?;
        Ok(Self {
            device,
            bindless_layout,
            objects: RefCell::new(VkObjects::default()),
            next_id: Cell::new(1),
        })
    }

    fn alloc_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn create_bindless_layout(device: &VulkanDevice) -> GfxResult<vk::DescriptorSetLayout> {
        let binding = |binding: u32, ty: vk::DescriptorType| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(BINDLESS_CAPACITY)
                .stage_flags(vk::ShaderStageFlags::ALL)
        };
        let bindings = [
            binding(BINDING_STORAGE_IMAGE, vk::DescriptorType::STORAGE_IMAGE),
            binding(BINDING_STORAGE_BUFFER, vk::DescriptorType::STORAGE_BUFFER),
            binding(BINDING_ACCELERATION_STRUCTURE, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
        ];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
            3];
        let mut flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut flags_ci);
        unsafe { device.device.create_descriptor_set_layout(&layout_ci, None) }
            .map_err(vk_error("vkCreateDescriptorSetLayout"))
    }

    /// 在 `address` 处创建（或者复用）加速结构对象，占用 buffer 从该地址开始的剩余部分
    fn ensure_acceleration_structure(
        &self,
        objects: &mut VkObjects,
        address: GpuVirtualAddress,
        top_level: bool,
    ) -> GfxResult<VkAccelerationStructure> {
        if let Some(existing) = objects.acceleration_structures.get(&address).copied() {
            if existing.top_level == top_level {
                return Ok(existing);
            }
            unsafe { self.device.acceleration_structure.destroy_acceleration_structure(existing.handle, None) };
            objects.acceleration_structures.remove(&address);
        }

        let (buffer_id, resource) = objects.buffer_at(address).ok_or_else(|| {
            GraphicsError::device_call("vkCreateAccelerationStructureKHR", format!("no buffer contains {address:#x}"))
        })?;
        let buffer = resource.buffer().ok_or_else(|| GraphicsError::invalid_state("buffer", "texture"))?;
        let offset = address - resource.gpu_address;
        let ty = if top_level {
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        } else {
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
        };
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .offset(offset)
            .size(resource.size - offset)
            .ty(ty);
        let handle = unsafe { self.device.acceleration_structure.create_acceleration_structure(&create_info, None) }
            .map_err(vk_error("vkCreateAccelerationStructureKHR"))?;
        let device_address = unsafe {
            self.device.acceleration_structure.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle),
            )
        };
        log::debug!("acceleration structure at {:#x} in `{}` (top level: {})", address, resource.name, top_level);

        let created = VkAccelerationStructure {
            handle,
            buffer: buffer_id,
            top_level,
            device_address,
        };
        objects.acceleration_structures.insert(address, created);
        Ok(created)
    }

    /// 提交之前：为所有构建目标创建加速结构对象，并把 instance desc 中的 BLAS buffer 地址替换为加速结构的设备地址
    fn prepare_acceleration_structures(&self, objects: &mut VkObjects, commands: &[Command]) -> GfxResult<()> {
        for command in commands {
            let Command::BuildAccelerationStructure(desc) = command else {
                continue;
            };
            self.ensure_acceleration_structure(objects, desc.dest, desc.inputs.is_top_level())?;
            if let AsInputs::TopLevel {
                instance_descs,
                instance_count,
                ..
            } = desc.inputs
            {
                Self::patch_instances(objects, instance_descs, instance_count)?;
            }
        }
        Ok(())
    }

    fn patch_instances(objects: &VkObjects, instance_descs: GpuVirtualAddress, count: u32) -> GfxResult<()> {
        let fail = |reason: String| GraphicsError::device_call("vkCmdBuildAccelerationStructuresKHR", reason);
        let (_, resource) = objects
            .buffer_at(instance_descs)
            .ok_or_else(|| fail(format!("no buffer contains instance descs at {instance_descs:#x}")))?;
        let Some(mapped) = resource.mapped else {
            return Err(fail(format!("instance buffer `{}` is not host visible", resource.name)));
        };
        let offset = (instance_descs - resource.gpu_address) as usize;
        let stride = size_of::<InstanceDesc>();
        if offset + stride * count as usize > resource.size as usize {
            return Err(fail(format!("{count} instances do not fit in `{}`", resource.name)));
        }

        let known_device_addresses = objects.acceleration_structures.values().map(|a| a.device_address).collect_vec();
        for i in 0..count as usize {
            // SAFETY: 上面检查了范围，映射的内存在资源销毁之前一直有效
            let bytes = unsafe { std::slice::from_raw_parts_mut(mapped.add(offset + i * stride), stride) };
            let mut instance: InstanceDesc = bytemuck::pod_read_unaligned(bytes);
            if known_device_addresses.contains(&instance.acceleration_structure) {
                continue;
            }
            let blas = objects
                .acceleration_structures
                .get(&instance.acceleration_structure)
                .filter(|a| !a.top_level)
                .ok_or_else(|| fail(format!("instance {i} references a BLAS that has not been built")))?;
            instance.acceleration_structure = blas.device_address;
            bytes.copy_from_slice(bytemuck::bytes_of(&instance));
        }
        Ok(())
    }

    fn destroy_resource_inner(&self, objects: &mut VkObjects, id: u64) {
        let Some(mut resource) = objects.resources.remove(&id) else {
            return;
        };
        let dependents = objects
            .acceleration_structures
            .iter()
            .filter(|(_, a)| a.buffer.0 == id)
            .map(|(address, _)| *address)
            .collect_vec();
        for address in dependents {
            if let Some(acceleration) = objects.acceleration_structures.remove(&address) {
                unsafe { self.device.acceleration_structure.destroy_acceleration_structure(acceleration.handle, None) };
            }
        }

        unsafe {
            if resource.mapped.is_some() {
                self.device.allocator.unmap_memory(&mut resource.allocation);
            }
            match resource.kind {
                VkResourceKind::Buffer { buffer } => self.device.allocator.destroy_buffer(buffer, &mut resource.allocation),
                VkResourceKind::Texture { image, view, .. } => {
                    self.device.device.destroy_image_view(view, None);
                    self.device.allocator.destroy_image(image, &mut resource.allocation);
                }
            }
        }
    }

    fn write_bindless(&self, set: vk::DescriptorSet, objects: &mut VkObjects, index: u32, view: &ViewDesc) -> GfxResult<()> {
        let fail = |reason: String| GraphicsError::device_call("vkUpdateDescriptorSets", reason);
        let write = vk::WriteDescriptorSet::default().dst_set(set).dst_array_element(index).descriptor_count(1);
        match view {
            ViewDesc::StructuredBuffer {
                resource,
                first_element,
                num_elements,
                stride,
            } => {
                let buffer = objects
                    .resource(*resource)
                    .and_then(VkResource::buffer)
                    .ok_or_else(|| fail(format!("resource {} is not a buffer", resource.raw())))?;
                let info = [vk::DescriptorBufferInfo {
                    buffer,
                    offset: first_element * *stride as u64,
                    range: *num_elements as u64 * *stride as u64,
                }];
                let write = write
                    .dst_binding(BINDING_STORAGE_BUFFER)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&info);
                unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
            }
            ViewDesc::AccelerationStructure { location } => {
                let acceleration = self.ensure_acceleration_structure(objects, *location, true)?;
                let handles = [acceleration.handle];
                let mut as_write = vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&handles);
                // push_next 不会设置 descriptor_count
                let write = write
                    .dst_binding(BINDING_ACCELERATION_STRUCTURE)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .push_next(&mut as_write);
                unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
            }
            ViewDesc::Texture2dUav { resource, .. } => {
                let view = match objects.resource(*resource).map(|r| &r.kind) {
                    Some(VkResourceKind::Texture { view, .. }) => *view,
                    _ => return Err(fail(format!("resource {} is not a texture", resource.raw()))),
                };
                let info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::GENERAL,
                }];
                let write = write
                    .dst_binding(BINDING_STORAGE_IMAGE)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&info);
                unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
            }
            ViewDesc::RenderTarget { .. } => {
                return Err(fail("render target views cannot be written into a shader visible heap".to_string()));
            }
        }
        Ok(())
    }

    fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
        match stage {
            ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
            ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
            ShaderStage::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
        }
    }
}

impl GfxBackend for VulkanBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn ray_tracing_caps(&self) -> RayTracingCaps {
        self.device.caps
    }

    // region command allocator & queue

    fn create_command_allocator(&self, name: &str) -> GfxResult<AllocatorId> {
        let pool_ci = vk::CommandPoolCreateInfo::default().queue_family_index(self.device.queue_family);
        let pool = unsafe { self.device.device.create_command_pool(&pool_ci, None) }
            .map_err(vk_error("vkCreateCommandPool"))?;
        let id = self.alloc_id();
        self.objects.borrow_mut().allocators.insert(
            id,
            VkAllocator {
                name: name.to_string(),
                pool,
                buffers: Vec::new(),
                used: 0,
            },
        );
        Ok(AllocatorId(id))
    }

    fn reset_command_allocator(&self, allocator: AllocatorId) -> GfxResult<()> {
        let mut objects = self.objects.borrow_mut();
        let allocator = objects
            .allocators
            .get_mut(&allocator.0)
            .ok_or_else(|| GraphicsError::device_call("vkResetCommandPool", "unknown allocator"))?;
        unsafe { self.device.device.reset_command_pool(allocator.pool, vk::CommandPoolResetFlags::empty()) }
            .map_err(vk_error("vkResetCommandPool"))?;
        allocator.used = 0;
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: AllocatorId) {
        if let Some(allocator) = self.objects.borrow_mut().allocators.remove(&allocator.0) {
            log::debug!("destroying command allocator `{}`", allocator.name);
            unsafe { self.device.device.destroy_command_pool(allocator.pool, None) };
        }
    }

    fn execute_command_list(&self, allocator: AllocatorId, commands: &[Command]) -> GfxResult<()> {
        let mut objects = self.objects.borrow_mut();
        self.prepare_acceleration_structures(&mut objects, commands)?;

        let cmd = {
            let allocator = objects
                .allocators
                .get_mut(&allocator.0)
                .ok_or_else(|| GraphicsError::device_call("vkAllocateCommandBuffers", "unknown allocator"))?;
            if allocator.used == allocator.buffers.len() {
                let alloc_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(allocator.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                let mut buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
                    .map_err(vk_error("vkAllocateCommandBuffers"))?;
                allocator.buffers.append(&mut buffers);
            }
            allocator.used += 1;
            allocator.buffers[allocator.used - 1]
        };

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.device.begin_command_buffer(cmd, &begin_info) }.map_err(vk_error("vkBeginCommandBuffer"))?;

        let image_inits = std::mem::take(&mut objects.pending_image_inits);
        let mut recorder = CommandRecorder::new(&self.device, &objects, cmd);
        recorder.init_images(&image_inits);
        let recorded = recorder.record(commands);
        unsafe { self.device.device.end_command_buffer(cmd) }.map_err(vk_error("vkEndCommandBuffer"))?;
        if let Err(e) = recorded {
            // 下一次提交仍然需要初始化这些 texture
            objects.pending_image_inits = image_inits;
            return Err(e);
        }

        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos);
        unsafe { self.device.device.queue_submit2(self.device.queue, &[submit], vk::Fence::null()) }
            .map_err(vk_error("vkQueueSubmit2"))
    }

    // endregion

    // region fence

    fn create_fence(&self, initial_value: u64, name: &str) -> GfxResult<FenceId> {
        let mut timeline_type_ci = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_type_ci);
        let semaphore = unsafe { self.device.device.create_semaphore(&semaphore_ci, None) }
            .map_err(vk_error("vkCreateSemaphore"))?;
        let id = self.alloc_id();
        self.objects.borrow_mut().fences.insert(
            id,
            VkFence {
                name: name.to_string(),
                semaphore,
            },
        );
        Ok(FenceId(id))
    }

    fn signal_fence(&self, fence: FenceId, value: u64) -> GfxResult<()> {
        let semaphore = self.fence_semaphore(fence)?;
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(&signal_infos);
        unsafe { self.device.device.queue_submit2(self.device.queue, &[submit], vk::Fence::null()) }
            .map_err(vk_error("vkQueueSubmit2"))
    }

    fn fence_completed_value(&self, fence: FenceId) -> GfxResult<u64> {
        let semaphore = self.fence_semaphore(fence)?;
        unsafe { self.device.device.get_semaphore_counter_value(semaphore) }
            .map_err(vk_error("vkGetSemaphoreCounterValue"))
    }

    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Duration) -> GfxResult<FenceWait> {
        let semaphores = [self.fence_semaphore(fence)?];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout.as_nanos() as u64) } {
            Ok(()) => Ok(FenceWait::Reached),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(vk_error("vkWaitSemaphores")(e)),
        }
    }

    fn destroy_fence(&self, fence: FenceId) {
        if let Some(fence) = self.objects.borrow_mut().fences.remove(&fence.0) {
            log::debug!("destroying fence `{}`", fence.name);
            unsafe { self.device.device.destroy_semaphore(fence.semaphore, None) };
        }
    }

    fn wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device.device_wait_idle() }.map_err(vk_error("vkDeviceWaitIdle"))
    }

    // endregion

    // region resource

    fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<NativeResource> {
        if desc.size == 0 {
            return Err(GraphicsError::device_call("vmaCreateBuffer", format!("`{}` has zero size", desc.name)));
        }
        let buffer_ci = vk::BufferCreateInfo::default().size(desc.size).usage(convert::buffer_usage());
        let alloc_ci = convert::allocation_info(desc.heap);
        let (buffer, mut allocation) =
            unsafe { self.device.allocator.create_buffer_with_alignment(&buffer_ci, &alloc_ci, BUFFER_ALIGNMENT) }
                .map_err(vk_error("vmaCreateBuffer"))?;

        let mapped = if desc.heap.is_host_visible() {
            Some(unsafe { self.device.allocator.map_memory(&mut allocation) }.map_err(vk_error("vmaMapMemory"))?)
        } else {
            None
        };
        let gpu_address = unsafe {
            self.device.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };

        let id = self.alloc_id();
        self.objects.borrow_mut().resources.insert(
            id,
            VkResource {
                name: desc.name.clone(),
                kind: VkResourceKind::Buffer { buffer },
                allocation,
                heap: desc.heap,
                size: desc.size,
                gpu_address,
                mapped,
            },
        );
        Ok(NativeResource {
            id: NativeResourceId(id),
            gpu_address,
            size: desc.size,
        })
    }

    fn create_texture_2d(&self, desc: &TextureDesc) -> GfxResult<NativeResource> {
        let format = convert::format(desc.format);
        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(desc.flags))
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = convert::allocation_info(HeapType::Default);
        let (image, mut allocation) = unsafe { self.device.allocator.create_image(&image_ci, &alloc_ci) }
            .map_err(vk_error("vmaCreateImage"))?;

        let view_ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match unsafe { self.device.device.create_image_view(&view_ci, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.allocator.destroy_image(image, &mut allocation) };
                return Err(vk_error("vkCreateImageView")(e));
            }
        };

        let id = self.alloc_id();
        let mut objects = self.objects.borrow_mut();
        objects.resources.insert(
            id,
            VkResource {
                name: desc.name.clone(),
                kind: VkResourceKind::Texture {
                    image,
                    view,
                    width: desc.width,
                    height: desc.height,
                },
                allocation,
                heap: HeapType::Default,
                size: desc.byte_size(),
                gpu_address: 0,
                mapped: None,
            },
        );
        objects.pending_image_inits.push((NativeResourceId(id), convert::state_scope(desc.initial_state).layout));
        Ok(NativeResource {
            id: NativeResourceId(id),
            gpu_address: 0,
            size: desc.byte_size(),
        })
    }

    fn write_host_visible(&self, resource: NativeResourceId, offset: u64, data: &[u8]) -> GfxResult<()> {
        let objects = self.objects.borrow();
        let (resource, mapped) = self.mapped_range(&objects, resource, offset, data.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
        }
        self.device
            .allocator
            .flush_allocation(&resource.allocation, offset, data.len() as u64)
            .map_err(vk_error("vmaFlushAllocation"))
    }

    fn read_host_visible(&self, resource: NativeResourceId, offset: u64, size: u64) -> GfxResult<Vec<u8>> {
        let objects = self.objects.borrow();
        let (resource, mapped) = self.mapped_range(&objects, resource, offset, size)?;
        self.device
            .allocator
            .invalidate_allocation(&resource.allocation, offset, size)
            .map_err(vk_error("vmaInvalidateAllocation"))?;
        let mut out = vec![0u8; size as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.add(offset as usize), out.as_mut_ptr(), size as usize);
        }
        Ok(out)
    }

    fn destroy_resource(&self, resource: NativeResourceId) {
        let mut objects = self.objects.borrow_mut();
        self.destroy_resource_inner(&mut objects, resource.0);
    }

    // endregion

    // region descriptor

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GfxResult<DescriptorHeapInfo> {
        let fail = |reason: String| GraphicsError::device_call("CreateDescriptorHeap", reason);
        if desc.capacity == 0 || !capacity_fits(desc.capacity) {
            return Err(fail(format!("invalid capacity {}", desc.capacity)));
        }
        if desc.shader_visible && !desc.ty.can_be_shader_visible() {
            return Err(fail(format!("{:?} heaps cannot be shader visible", desc.ty)));
        }

        let set = if desc.shader_visible && desc.ty == DescriptorHeapType::CbvSrvUav {
            if desc.capacity > BINDLESS_CAPACITY {
                return Err(fail(format!("capacity {} exceeds the bindless limit {}", desc.capacity, BINDLESS_CAPACITY)));
            }
            let pool_sizes = [
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            ]
            .map(|ty| vk::DescriptorPoolSize {
                ty,
                descriptor_count: BINDLESS_CAPACITY,
            });
            let pool_ci = vk::DescriptorPoolCreateInfo::default()
                .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
                .max_sets(1)
                .pool_sizes(&pool_sizes);
            let pool = unsafe { self.device.device.create_descriptor_pool(&pool_ci, None) }
                .map_err(vk_error("vkCreateDescriptorPool"))?;
            let layouts = [self.bindless_layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&layouts);
            let sets = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }.map_err(|e| {
                unsafe { self.device.device.destroy_descriptor_pool(pool, None) };
                vk_error("vkAllocateDescriptorSets")(e)
            })?;
            Some((pool, sets[0]))
        } else {
            None
        };

        let id = self.alloc_id();
        self.objects.borrow_mut().heaps.insert(
            id,
            VkDescriptorHeap {
                desc: desc.clone(),
                slots: vec![None; desc.capacity as usize],
                set,
            },
        );
        log::debug!("descriptor heap `{}`: {:?} x {}", desc.name, desc.ty, desc.capacity);
        Ok(DescriptorHeapInfo {
            id: DescriptorHeapId(id),
            cpu_start: CpuDescriptorHandle(heap_start(CPU_HANDLE_TAG, id)),
            gpu_start: desc.shader_visible.then(|| GpuDescriptorHandle(heap_start(GPU_HANDLE_TAG, id))),
            increment: DESCRIPTOR_INCREMENT,
        })
    }

    fn write_descriptor(&self, heap: DescriptorHeapId, index: u32, view: &ViewDesc) -> GfxResult<()> {
        let mut objects = self.objects.borrow_mut();
        let set = {
            let heap = objects
                .heaps
                .get(&heap.0)
                .ok_or_else(|| GraphicsError::device_call("CreateView", "unknown descriptor heap"))?;
            if index >= heap.desc.capacity {
                return Err(GraphicsError::device_call("CreateView", format!("slot {index} out of range")));
            }
            heap.set.map(|(_, set)| set)
        };
        if let Some(set) = set {
            self.write_bindless(set, &mut objects, index, view)?;
        }
        if let Some(heap) = objects.heaps.get_mut(&heap.0) {
            heap.slots[index as usize] = Some(view.clone());
        }
        Ok(())
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) {
        if let Some(heap) = self.objects.borrow_mut().heaps.remove(&heap.0) {
            if let Some((pool, _)) = heap.set {
                // set 随 pool 一起释放
                unsafe { self.device.device.destroy_descriptor_pool(pool, None) };
            }
        }
    }

    // endregion

    // region ray tracing

    fn acceleration_structure_prebuild_info(&self, inputs: &AsInputs) -> GfxResult<AsPrebuildInfo> {
        let geometries = convert::BuildGeometries::new(inputs);
        let build_info = geometries.geometry_info();
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.device.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                // 每一个 geometry 里面的最大 primitive 数量
                &geometries.primitive_counts,
                &mut size_info,
            )
        };
        Ok(AsPrebuildInfo {
            result_data_max_size: align_up(size_info.acceleration_structure_size, BUFFER_ALIGNMENT)?,
            scratch_data_size: align_up(size_info.build_scratch_size, BUFFER_ALIGNMENT)?,
            update_scratch_data_size: align_up(size_info.update_scratch_size, BUFFER_ALIGNMENT)?,
        })
    }

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> GfxResult<RootSignatureId> {
        let layout = match desc.kind {
            RootSignatureKind::Local => None,
            RootSignatureKind::Global => {
                let set_layouts = [self.bindless_layout];
                let push_constants = [vk::PushConstantRange {
                    stage_flags: vk::ShaderStageFlags::ALL,
                    offset: 0,
                    size: 4 * desc.parameters.len() as u32,
                }];
                let mut layout_ci = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
                if !desc.parameters.is_empty() {
                    layout_ci = layout_ci.push_constant_ranges(&push_constants);
                }
                Some(
                    unsafe { self.device.device.create_pipeline_layout(&layout_ci, None) }
                        .map_err(vk_error("vkCreatePipelineLayout"))?,
                )
            }
        };
        let id = self.alloc_id();
        self.objects.borrow_mut().root_signatures.insert(
            id,
            VkRootSignature {
                desc: desc.clone(),
                layout,
            },
        );
        Ok(RootSignatureId(id))
    }

    fn destroy_root_signature(&self, root_signature: RootSignatureId) {
        if let Some(root) = self.objects.borrow_mut().root_signatures.remove(&root_signature.0) {
            if let Some(layout) = root.layout {
                log::debug!("destroying root signature `{}`", root.desc.name);
                unsafe { self.device.device.destroy_pipeline_layout(layout, None) };
            }
        }
    }

    fn create_state_object(&self, desc: &StateObjectDesc, library: &ShaderBlob) -> GfxResult<StateObjectId> {
        let fail = |reason: String| GraphicsError::device_call("vkCreateRayTracingPipelinesKHR", reason);
        let objects = self.objects.borrow();
        let layout = objects
            .root_signatures
            .get(&desc.global_root_signature.0)
            .and_then(|r| r.layout)
            .ok_or_else(|| fail("global root signature is missing or not global".to_string()))?;
        for association in &desc.local_root_signatures {
            let kind = objects.root_signatures.get(&association.root_signature.0).map(|r| r.desc.kind);
            if kind != Some(RootSignatureKind::Local) {
                return Err(fail(format!("local root signature for {:?} is missing or not local", association.exports)));
            }
        }
        drop(objects);

        // library 为 DXC 输出的 SPIR-V
        let code = ash::util::read_spv(&mut Cursor::new(library.bytecode()))
            .map_err(|e| fail(format!("library is not SPIR-V: {e}")))?;
        let module_ci = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { self.device.device.create_shader_module(&module_ci, None) }
            .map_err(vk_error("vkCreateShaderModule"))?;

        let names = desc
            .library_exports
            .iter()
            .map(|e| CString::new(e.name.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| fail(e.to_string()))?;
        let stages = desc
            .library_exports
            .iter()
            .zip(&names)
            .map(|(export, name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(Self::shader_stage(export.stage))
                    .module(module)
                    .name(name)
            })
            .collect_vec();
        let stage_index = |name: &Option<String>| {
            name.as_ref()
                .and_then(|n| desc.library_exports.iter().position(|e| &e.name == n))
                .map_or(vk::SHADER_UNUSED_KHR, |i| i as u32)
        };

        // group 的顺序与 identifiable_exports 一致
        let general_groups = desc
            .library_exports
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e.stage, ShaderStage::RayGeneration | ShaderStage::Miss | ShaderStage::Callable))
            .map(|(i, _)| {
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(i as u32)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
            });
        let hit_groups = desc.hit_groups.iter().map(|hit_group| {
            let ty = match hit_group.ty {
                HitGroupType::Triangles => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                HitGroupType::ProceduralPrimitive => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
            };
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(ty)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(stage_index(&hit_group.closest_hit))
                .any_hit_shader(stage_index(&hit_group.any_hit))
                .intersection_shader(stage_index(&hit_group.intersection))
        });
        let groups = general_groups.chain(hit_groups).collect_vec();

        let pipeline_ci = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(layout);
        let pipeline = match unsafe {
            self.device.ray_tracing_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_ci),
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { self.device.device.destroy_shader_module(module, None) };
                return Err(vk_error("vkCreateRayTracingPipelinesKHR")(e));
            }
        };

        let handle_size = self.device.caps.shader_identifier_size as usize;
        let handles = unsafe {
            self.device.ray_tracing_pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                groups.len() as u32,
                groups.len() * handle_size,
            )
        }
        .map_err(vk_error("vkGetRayTracingShaderGroupHandlesKHR"))?;
        let identifiers: HashMap<String, ShaderIdentifier> = desc
            .identifiable_exports()
            .zip(handles.chunks_exact(handle_size))
            .map(|(export, bytes)| (export.to_string(), ShaderIdentifier::new(bytes.to_vec())))
            .collect();

        let id = self.alloc_id();
        log::info!(
            "ray tracing pipeline `{}`: {} stages, {} groups, payload {} bytes",
            desc.name,
            stages.len(),
            groups.len(),
            desc.payload_size
        );
        self.objects.borrow_mut().state_objects.insert(
            id,
            VkStateObject {
                name: desc.name.clone(),
                pipeline,
                module,
                identifiers,
            },
        );
        Ok(StateObjectId(id))
    }

    fn shader_identifier(&self, state_object: StateObjectId, export: &str) -> Option<ShaderIdentifier> {
        self.objects.borrow().state_objects.get(&state_object.0)?.identifiers.get(export).cloned()
    }

    fn destroy_state_object(&self, state_object: StateObjectId) {
        if let Some(state_object) = self.objects.borrow_mut().state_objects.remove(&state_object.0) {
            log::debug!("destroying state object `{}`", state_object.name);
            unsafe {
                self.device.device.destroy_pipeline(state_object.pipeline, None);
                self.device.device.destroy_shader_module(state_object.module, None);
            }
        }
    }

    // endregion
}

/// 辅助函数
impl VulkanBackend {
    fn fence_semaphore(&self, fence: FenceId) -> GfxResult<vk::Semaphore> {
        self.objects
            .borrow()
            .fences
            .get(&fence.0)
            .map(|f| f.semaphore)
            .ok_or_else(|| GraphicsError::device_call("vkGetSemaphoreCounterValue", "unknown fence"))
    }

    fn mapped_range<'o>(
        &self,
        objects: &'o VkObjects,
        resource: NativeResourceId,
        offset: u64,
        size: u64,
    ) -> GfxResult<(&'o VkResource, *mut u8)> {
        let fail = |reason: String| GraphicsError::device_call("vmaMapMemory", reason);
        let res = objects.resource(resource).ok_or_else(|| fail(format!("unknown resource {}", resource.raw())))?;
        let mapped = res.mapped.ok_or_else(|| fail(format!("`{}` on {:?} heap is not host visible", res.name, res.heap)))?;
        if offset + size > res.size {
            return Err(GraphicsError::CapacityExceeded {
                what: format!("mapped range of `{}`", res.name),
                requested: offset + size,
                capacity: res.size,
            });
        }
        Ok((res, mapped))
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("failed to wait for the device before destroying it: {e}");
        }

        let mut objects = std::mem::take(&mut *self.objects.borrow_mut());
        let resource_ids = objects.resources.keys().copied().collect_vec();
        for id in resource_ids {
            self.destroy_resource_inner(&mut objects, id);
        }
        unsafe {
            let device = &self.device.device;
            for allocator in objects.allocators.into_values() {
                device.destroy_command_pool(allocator.pool, None);
            }
            for fence in objects.fences.into_values() {
                device.destroy_semaphore(fence.semaphore, None);
            }
            for (pool, _) in objects.heaps.into_values().filter_map(|h| h.set) {
                device.destroy_descriptor_pool(pool, None);
            }
            for layout in objects.root_signatures.into_values().filter_map(|r| r.layout) {
                device.destroy_pipeline_layout(layout, None);
            }
            for state_object in objects.state_objects.into_values() {
                device.destroy_pipeline(state_object.pipeline, None);
                device.destroy_shader_module(state_object.module, None);
            }
            device.destroy_descriptor_set_layout(self.bindless_layout, None);
        }
        self.device.destroy();
    }
}
