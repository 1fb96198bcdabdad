//! 将记录好的 [`Command`] 翻译为 Vulkan 命令

use std::ffi::CString;

use ash::vk;
use itertools::Itertools;

use crate::{
    backend::{
        types::{AsBuildFlags, DescriptorHeapType, DispatchRaysDesc, NativeResourceId, ViewDesc},
        vulkan::{
            convert::{self, BuildGeometries, StateScope},
            device::VulkanDevice,
            objects::{VkObjects, VkResource, VkResourceKind},
        },
    },
    commands::{barrier::ResourceBarrier, command_list::Command},
    error::{GfxResult, GraphicsError},
};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

fn fail(index: usize, command: &Command, reason: impl std::fmt::Display) -> GraphicsError {
    GraphicsError::device_call("vkCmd*", format!("command #{index} {}: {reason}", command_name(command)))
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::BeginLabel(_) => "BeginLabel",
        Command::EndLabel => "EndLabel",
        Command::ResourceBarrier(_) => "ResourceBarrier",
        Command::CopyResource { .. } => "CopyResource",
        Command::CopyBufferRegion { .. } => "CopyBufferRegion",
        Command::ClearRenderTarget { .. } => "ClearRenderTarget",
        Command::BuildAccelerationStructure(_) => "BuildAccelerationStructure",
        Command::SetDescriptorHeaps(_) => "SetDescriptorHeaps",
        Command::SetComputeRootSignature(_) => "SetComputeRootSignature",
        Command::SetComputeRootDescriptorTable { .. } => "SetComputeRootDescriptorTable",
        Command::SetPipelineState(_) => "SetPipelineState",
        Command::DispatchRays(_) => "DispatchRays",
    }
}

/// 一次 `execute_command_list` 的录制状态
pub(super) struct CommandRecorder<'a> {
    device: &'a VulkanDevice,
    objects: &'a VkObjects,
    cmd: vk::CommandBuffer,
    bound_set: Option<vk::DescriptorSet>,
    root_layout: Option<vk::PipelineLayout>,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(device: &'a VulkanDevice, objects: &'a VkObjects, cmd: vk::CommandBuffer) -> Self {
        Self {
            device,
            objects,
            cmd,
            bound_set: None,
            root_layout: None,
        }
    }

    /// 新创建的 texture 从 UNDEFINED 转换到初始 layout
    pub fn init_images(&self, inits: &[(NativeResourceId, vk::ImageLayout)]) {
        let barriers = inits
            .iter()
            .filter_map(|(id, layout)| {
                let image = self.objects.resource(*id)?.image()?;
                Some(
                    vk::ImageMemoryBarrier2::default()
                        .image(image)
                        .subresource_range(COLOR_RANGE)
                        .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                        .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(*layout),
                )
            })
            .collect_vec();
        if !barriers.is_empty() {
            unsafe {
                self.device
                    .device
                    .cmd_pipeline_barrier2(self.cmd, &vk::DependencyInfo::default().image_memory_barriers(&barriers));
            }
        }
    }

    pub fn record(&mut self, commands: &[Command]) -> GfxResult<()> {
        for (index, command) in commands.iter().enumerate() {
            self.record_one(command).map_err(|reason| fail(index, command, reason))?;
        }
        Ok(())
    }

    fn record_one(&mut self, command: &Command) -> Result<(), String> {
        match command {
            Command::BeginLabel(label) => self.begin_label(label),
            Command::EndLabel => {
                if let Some(debug_utils) = &self.device.debug_utils {
                    unsafe { debug_utils.cmd_end_debug_utils_label(self.cmd) };
                }
                Ok(())
            }
            Command::ResourceBarrier(barriers) => self.resource_barrier(barriers),
            Command::CopyResource { dst, src } => self.copy_resource(*dst, *src),
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                let dst = self.buffer(*dst)?;
                let src = self.buffer(*src)?;
                let region = vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                };
                unsafe { self.device.device.cmd_copy_buffer(self.cmd, src, dst, &[region]) };
                Ok(())
            }
            Command::ClearRenderTarget { rtv, target, color } => {
                let (heap, index) = self.objects.decode_cpu_handle(rtv.0).ok_or("invalid RTV handle")?;
                if heap.desc.ty != DescriptorHeapType::Rtv {
                    return Err(format!("handle points into a {:?} heap", heap.desc.ty));
                }
                match heap.slots.get(index as usize).and_then(Option::as_ref) {
                    Some(ViewDesc::RenderTarget { resource, .. }) if resource == target => {}
                    _ => return Err("RTV slot does not describe the target".to_string()),
                }
                let image = self.resource(*target)?.image().ok_or("clear target is not a texture")?;
                let clear = vk::ClearColorValue { float32: *color };
                unsafe {
                    self.device.device.cmd_clear_color_image(
                        self.cmd,
                        image,
                        vk::ImageLayout::GENERAL,
                        &clear,
                        &[COLOR_RANGE],
                    )
                };
                Ok(())
            }
            Command::BuildAccelerationStructure(desc) => {
                let dest = self.acceleration_structure(desc.dest)?;
                let geometries = BuildGeometries::new(&desc.inputs);
                let mut info = geometries
                    .geometry_info()
                    .dst_acceleration_structure(dest)
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: desc.scratch,
                    });
                if let Some(source) = desc.source.filter(|_| desc.inputs.flags().contains(AsBuildFlags::PERFORM_UPDATE))
                {
                    info = info
                        .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                        .src_acceleration_structure(self.acceleration_structure(source)?);
                }
                let ranges = geometries.range_infos();
                unsafe {
                    self.device.acceleration_structure.cmd_build_acceleration_structures(
                        self.cmd,
                        std::slice::from_ref(&info),
                        &[ranges.as_slice()],
                    )
                };
                Ok(())
            }
            Command::SetDescriptorHeaps(heaps) => {
                self.bound_set = heaps
                    .iter()
                    .filter_map(|id| self.objects.heaps.get(&id.0))
                    .find_map(|heap| heap.set.map(|(_, set)| set));
                self.bind_descriptor_set();
                Ok(())
            }
            Command::SetComputeRootSignature(id) => {
                let root = self.objects.root_signatures.get(&id.0).ok_or("unknown root signature")?;
                self.root_layout = Some(root.layout.ok_or("root signature is not global")?);
                self.bind_descriptor_set();
                Ok(())
            }
            Command::SetComputeRootDescriptorTable { parameter, handle } => {
                let layout = self.root_layout.ok_or("no root signature set")?;
                let (_, index) = self.objects.decode_gpu_handle(handle.0).ok_or("invalid GPU descriptor handle")?;
                // root descriptor table 通过 push constant 传递 slot 下标
                unsafe {
                    self.device.device.cmd_push_constants(
                        self.cmd,
                        layout,
                        vk::ShaderStageFlags::ALL,
                        parameter * 4,
                        &index.to_le_bytes(),
                    )
                };
                Ok(())
            }
            Command::SetPipelineState(id) => {
                let state_object = self.objects.state_objects.get(&id.0).ok_or("unknown state object")?;
                unsafe {
                    self.device.device.cmd_bind_pipeline(
                        self.cmd,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        state_object.pipeline,
                    )
                };
                Ok(())
            }
            Command::DispatchRays(desc) => {
                self.dispatch_rays(desc);
                Ok(())
            }
        }
    }

    fn resource(&self, id: NativeResourceId) -> Result<&'a VkResource, String> {
        self.objects.resource(id).ok_or_else(|| format!("unknown resource {}", id.raw()))
    }

    fn buffer(&self, id: NativeResourceId) -> Result<vk::Buffer, String> {
        let resource = self.resource(id)?;
        resource.buffer().ok_or_else(|| format!("`{}` is not a buffer", resource.name))
    }

    fn acceleration_structure(&self, address: u64) -> Result<vk::AccelerationStructureKHR, String> {
        self.objects
            .acceleration_structures
            .get(&address)
            .map(|a| a.handle)
            .ok_or_else(|| format!("no acceleration structure at {address:#x}"))
    }

    fn begin_label(&self, label: &str) -> Result<(), String> {
        if let Some(debug_utils) = &self.device.debug_utils {
            let name = CString::new(label).map_err(|e| e.to_string())?;
            unsafe {
                debug_utils.cmd_begin_debug_utils_label(self.cmd, &vk::DebugUtilsLabelEXT::default().label_name(&name))
            };
        }
        Ok(())
    }

    fn bind_descriptor_set(&self) {
        let (Some(set), Some(layout)) = (self.bound_set, self.root_layout) else {
            return;
        };
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                layout,
                0,
                &[set],
                &[],
            )
        };
    }

    fn resource_barrier(&self, barriers: &[ResourceBarrier]) -> Result<(), String> {
        let mut buffer_barriers = Vec::new();
        let mut image_barriers = Vec::new();
        for barrier in barriers.iter().filter(|b| !b.is_noop()) {
            let (src, dst) = match *barrier {
                ResourceBarrier::Transition { before, after, .. } => {
                    (convert::state_scope(before), convert::state_scope(after))
                }
                ResourceBarrier::Uav { .. } => convert::uav_scope(),
            };
            let resource = self.resource(barrier.resource())?;
            if let Some(buffer) = resource.buffer() {
                buffer_barriers.push(buffer_barrier(buffer, &src, &dst));
            } else if let Some(image) = resource.image() {
                image_barriers.push(image_barrier(image, &src, &dst));
            }
        }

        let dependency = vk::DependencyInfo::default()
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe { self.device.device.cmd_pipeline_barrier2(self.cmd, &dependency) };
        Ok(())
    }

    fn copy_resource(&self, dst: NativeResourceId, src: NativeResourceId) -> Result<(), String> {
        let dst = self.resource(dst)?;
        let src = self.resource(src)?;
        if dst.size != src.size {
            return Err(format!("size mismatch: `{}` {} bytes, `{}` {} bytes", dst.name, dst.size, src.name, src.size));
        }
        match (dst.buffer(), src.buffer(), &dst.kind) {
            (Some(dst_buffer), Some(src_buffer), _) => {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: dst.size,
                };
                unsafe { self.device.device.cmd_copy_buffer(self.cmd, src_buffer, dst_buffer, &[region]) };
            }
            (None, None, VkResourceKind::Texture { width, height, .. }) => {
                let layers = vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                let region = vk::ImageCopy::default().src_subresource(layers).dst_subresource(layers).extent(
                    vk::Extent3D {
                        width: *width,
                        height: *height,
                        depth: 1,
                    },
                );
                let (Some(dst_image), Some(src_image)) = (dst.image(), src.image()) else {
                    return Err("texture without image".to_string());
                };
                unsafe {
                    self.device.device.cmd_copy_image(
                        self.cmd,
                        src_image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
            _ => return Err("cannot copy between a buffer and a texture".to_string()),
        }
        Ok(())
    }

    fn dispatch_rays(&self, desc: &DispatchRaysDesc) {
        let region = |start: u64, size: u64, stride: u64| {
            vk::StridedDeviceAddressRegionKHR::default().device_address(start).size(size).stride(stride)
        };
        // ray gen 区域的 size 必须等于 stride
        let raygen = region(desc.ray_generation.start, desc.ray_generation.size, desc.ray_generation.size);
        let miss = region(desc.miss.start, desc.miss.size, desc.miss.stride);
        let hit = region(desc.hit_group.start, desc.hit_group.size, desc.hit_group.stride);
        let callable = region(desc.callable.start, desc.callable.size, desc.callable.stride);
        unsafe {
            self.device.ray_tracing_pipeline.cmd_trace_rays(
                self.cmd,
                &raygen,
                &miss,
                &hit,
                &callable,
                desc.width,
                desc.height,
                desc.depth,
            )
        };
    }
}

fn buffer_barrier(buffer: vk::Buffer, src: &StateScope, dst: &StateScope) -> vk::BufferMemoryBarrier2<'static> {
    vk::BufferMemoryBarrier2::default()
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
}

fn image_barrier(image: vk::Image, src: &StateScope, dst: &StateScope) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .image(image)
        .subresource_range(COLOR_RANGE)
        .old_layout(src.layout)
        .new_layout(dst.layout)
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
}
