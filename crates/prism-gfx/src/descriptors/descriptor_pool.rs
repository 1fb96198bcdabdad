use std::rc::Rc;

use itertools::Itertools;

use crate::{
    backend::{
        GfxBackend,
        types::{
            CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapId, DescriptorHeapInfo, DescriptorHeapType,
            GpuDescriptorHandle, GpuVirtualAddress, ViewDesc,
        },
    },
    error::{GfxResult, GraphicsError},
    resources::{
        handles::{BufferHandle, TextureHandle},
        manager::GpuResourceManager,
    },
};

/// 每种 descriptor heap 的容量
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorHeapCapacities {
    pub cbv_srv_uav: u32,
    pub rtv: u32,
    pub dsv: u32,
    pub sampler: u32,
}

impl Default for DescriptorHeapCapacities {
    fn default() -> Self {
        Self {
            cbv_srv_uav: 128,
            rtv: 8,
            dsv: 1,
            sampler: 16,
        }
    }
}

impl DescriptorHeapCapacities {
    #[inline]
    pub fn of(&self, heap_type: DescriptorHeapType) -> u32 {
        match heap_type {
            DescriptorHeapType::CbvSrvUav => self.cbv_srv_uav,
            DescriptorHeapType::Rtv => self.rtv,
            DescriptorHeapType::Dsv => self.dsv,
            DescriptorHeapType::Sampler => self.sampler,
        }
    }
}

/// 从 [`DescriptorPool`] 中分配的一个 slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSlot {
    pub heap_type: DescriptorHeapType,
    pub index: u32,
    pub cpu: CpuDescriptorHandle,
    /// 非 shader visible 的 heap 为 NULL
    pub gpu: GpuDescriptorHandle,
}

struct HeapAllocator {
    info: DescriptorHeapInfo,
    capacity: u32,
    /// bump 指针，[0, next) 之间的 index 曾经被分配过
    next: u32,
    /// 已经回收的 index，后进先出
    free: Vec<u32>,
    allocated: Vec<bool>,
}

impl HeapAllocator {
    fn slot(&self, heap_type: DescriptorHeapType, index: u32) -> DescriptorSlot {
        let offset = index as u64 * self.info.increment as u64;
        DescriptorSlot {
            heap_type,
            index,
            cpu: CpuDescriptorHandle(self.info.cpu_start.0 + offset),
            gpu: self.info.gpu_start.map_or(GpuDescriptorHandle::NULL, |start| GpuDescriptorHandle(start.0 + offset)),
        }
    }
}

/// 按类型划分的 descriptor slot 池
///
/// 每种类型在引擎生命周期内只有一个 heap；分配时优先复用回收的 index，否则 bump。
///
/// # Destroy
///
/// 需要手动调用 `destroy` 方法来释放资源。
pub struct DescriptorPool {
    /// 按照 [`DescriptorHeapType::ALL`] 的顺序排列
    heaps: Vec<HeapAllocator>,
    backend: Rc<dyn GfxBackend>,
}

// 创建与销毁
impl DescriptorPool {
    pub fn new(backend: Rc<dyn GfxBackend>, capacities: DescriptorHeapCapacities) -> GfxResult<Self> {
        let mut heaps = Vec::with_capacity(DescriptorHeapType::ALL.len());
        for heap_type in DescriptorHeapType::ALL {
            let capacity = capacities.of(heap_type);
            let info = backend.create_descriptor_heap(&DescriptorHeapDesc {
                ty: heap_type,
                capacity,
                shader_visible: heap_type.can_be_shader_visible(),
                name: format!("{heap_type:?}-heap"),
            })?;
            heaps.push(HeapAllocator {
                info,
                capacity,
                next: 0,
                free: Vec::new(),
                allocated: vec![false; capacity as usize],
            });
        }
        log::info!(
            "descriptor pool created: {}",
            DescriptorHeapType::ALL.iter().zip(&heaps).map(|(ty, heap)| format!("{ty:?}={}", heap.capacity)).join(", ")
        );
        Ok(Self { heaps, backend })
    }

    pub fn destroy(self) {
        for heap in &self.heaps {
            self.backend.destroy_descriptor_heap(heap.info.id);
        }
    }
}

// getters
impl DescriptorPool {
    #[inline]
    fn heap(&self, heap_type: DescriptorHeapType) -> &HeapAllocator {
        &self.heaps[heap_type as usize]
    }

    #[inline]
    fn heap_mut(&mut self, heap_type: DescriptorHeapType) -> &mut HeapAllocator {
        &mut self.heaps[heap_type as usize]
    }

    #[inline]
    pub fn heap_id(&self, heap_type: DescriptorHeapType) -> DescriptorHeapId {
        self.heap(heap_type).info.id
    }

    #[inline]
    pub fn capacity(&self, heap_type: DescriptorHeapType) -> u32 {
        self.heap(heap_type).capacity
    }

    pub fn allocated_count(&self, heap_type: DescriptorHeapType) -> usize {
        self.heap(heap_type).allocated.iter().filter(|a| **a).count()
    }

    /// 每帧通过 `SetDescriptorHeaps` 绑定的 heap
    pub fn shader_visible_heaps(&self) -> Vec<DescriptorHeapId> {
        DescriptorHeapType::ALL
            .iter()
            .zip(&self.heaps)
            .filter(|(ty, _)| ty.can_be_shader_visible())
            .map(|(_, heap)| heap.info.id)
            .collect()
    }
}

// 分配与回收
impl DescriptorPool {
    pub fn allocate(&mut self, heap_type: DescriptorHeapType) -> GfxResult<DescriptorSlot> {
        let heap = self.heap_mut(heap_type);
        let index = match heap.free.pop() {
            Some(index) => index,
            None if heap.next < heap.capacity => {
                heap.next += 1;
                heap.next - 1
            }
            None => return Err(GraphicsError::descriptor_heap_full(heap_type, heap.capacity)),
        };
        heap.allocated[index as usize] = true;
        Ok(heap.slot(heap_type, index))
    }

    /// 回收 slot，重复回收或者不属于该池的 slot 返回 [`GraphicsError::InvalidHandle`]
    pub fn erase(&mut self, slot: DescriptorSlot) -> GfxResult<()> {
        let heap = self.heap_mut(slot.heap_type);
        let invalid = |detail: String| GraphicsError::InvalidHandle {
            kind: "descriptor slot",
            detail,
        };
        if slot.index >= heap.capacity {
            return Err(invalid(format!("index {} out of capacity {}", slot.index, heap.capacity)));
        }
        if heap.slot(slot.heap_type, slot.index) != slot {
            return Err(invalid(format!("slot {} of {:?} does not belong to this pool", slot.index, slot.heap_type)));
        }
        if !heap.allocated[slot.index as usize] {
            return Err(invalid(format!("slot {} of {:?} is not allocated", slot.index, slot.heap_type)));
        }
        heap.allocated[slot.index as usize] = false;
        heap.free.push(slot.index);
        Ok(())
    }
}

// view 的创建
impl DescriptorPool {
    /// 分配 slot 并写入 view，写入失败时 slot 会被回收
    pub fn create_view(&mut self, heap_type: DescriptorHeapType, view: &ViewDesc) -> GfxResult<DescriptorSlot> {
        let slot = self.allocate(heap_type)?;
        if let Err(err) = self.backend.write_descriptor(self.heap_id(heap_type), slot.index, view) {
            self.erase(slot)?;
            return Err(err);
        }
        Ok(slot)
    }

    /// structured buffer 的 SRV，元素数量由 buffer 大小与 stride 推导
    pub fn create_structured_srv(
        &mut self,
        resources: &GpuResourceManager,
        buffer: BufferHandle,
        stride: u32,
    ) -> GfxResult<DescriptorSlot> {
        let gpu_buffer = resources.buffer(buffer)?;
        let view = ViewDesc::StructuredBuffer {
            resource: gpu_buffer.native,
            first_element: 0,
            num_elements: structured_element_count(gpu_buffer.size, stride)?,
            stride,
        };
        self.create_view(DescriptorHeapType::CbvSrvUav, &view)
    }

    pub fn create_texture_uav(
        &mut self,
        resources: &GpuResourceManager,
        texture: TextureHandle,
    ) -> GfxResult<DescriptorSlot> {
        let gpu_texture = resources.texture(texture)?;
        let view = ViewDesc::Texture2dUav {
            resource: gpu_texture.native,
            format: gpu_texture.format,
        };
        self.create_view(DescriptorHeapType::CbvSrvUav, &view)
    }

    pub fn create_acceleration_structure_srv(&mut self, location: GpuVirtualAddress) -> GfxResult<DescriptorSlot> {
        self.create_view(DescriptorHeapType::CbvSrvUav, &ViewDesc::AccelerationStructure { location })
    }

    pub fn create_render_target_view(
        &mut self,
        resources: &GpuResourceManager,
        texture: TextureHandle,
    ) -> GfxResult<DescriptorSlot> {
        let gpu_texture = resources.texture(texture)?;
        let view = ViewDesc::RenderTarget {
            resource: gpu_texture.native,
            format: gpu_texture.format,
        };
        self.create_view(DescriptorHeapType::Rtv, &view)
    }
}

/// structured buffer 的元素数量，需要能用 u32 表示
fn structured_element_count(size: u64, stride: u32) -> GfxResult<u32> {
    if stride == 0 {
        return Err(GraphicsError::invalid_state("non-zero structured buffer stride", "stride 0"));
    }
    let count = size / stride as u64;
    u32::try_from(count).map_err(|_| GraphicsError::CapacityExceeded {
        what: format!("structured buffer elements (stride {stride})"),
        requested: count,
        capacity: u32::MAX as u64,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::backend::{
        headless::HeadlessBackend,
        types::{BufferDesc, HeapType, ResourceFlags, ResourceState},
    };

    fn pool(cbv_srv_uav: u32) -> (Rc<HeadlessBackend>, DescriptorPool) {
        let headless = Rc::new(HeadlessBackend::new());
        let pool = DescriptorPool::new(
            headless.clone(),
            DescriptorHeapCapacities {
                cbv_srv_uav,
                ..Default::default()
            },
        )
        .unwrap();
        (headless, pool)
    }

    #[test]
    fn test_allocations_are_unique_until_capacity() {
        let (_headless, mut pool) = pool(8);
        let slots: Vec<_> = (0..8).map(|_| pool.allocate(DescriptorHeapType::CbvSrvUav).unwrap()).collect();
        let indices: HashSet<_> = slots.iter().map(|s| s.index).collect();
        assert_eq!(indices.len(), 8);
        assert!(slots.iter().all(|s| s.index < 8 && !s.gpu.is_null()));

        assert_eq!(
            pool.allocate(DescriptorHeapType::CbvSrvUav),
            Err(GraphicsError::CapacityExceeded {
                what: "descriptor heap CbvSrvUav".to_string(),
                requested: 9,
                capacity: 8,
            })
        );
    }

    #[test]
    fn test_erase_reuses_index_lifo() {
        let (_headless, mut pool) = pool(8);
        let a = pool.allocate(DescriptorHeapType::CbvSrvUav).unwrap();
        let _b = pool.allocate(DescriptorHeapType::CbvSrvUav).unwrap();
        let c = pool.allocate(DescriptorHeapType::CbvSrvUav).unwrap();
        pool.erase(a).unwrap();
        pool.erase(c).unwrap();

        assert_eq!(pool.allocate(DescriptorHeapType::CbvSrvUav).unwrap().index, c.index);
        assert_eq!(pool.allocate(DescriptorHeapType::CbvSrvUav).unwrap().index, a.index);
        assert_eq!(pool.allocate(DescriptorHeapType::CbvSrvUav).unwrap().index, 3);
        assert_eq!(pool.allocated_count(DescriptorHeapType::CbvSrvUav), 4);
    }

    #[test]
    fn test_erase_rejects_invalid_slots() {
        let (headless, mut pool) = pool(8);
        let a = pool.allocate(DescriptorHeapType::CbvSrvUav).unwrap();
        pool.erase(a).unwrap();
        assert!(matches!(pool.erase(a), Err(GraphicsError::InvalidHandle { .. })));

        let out_of_range = DescriptorSlot { index: 99, ..a };
        assert!(matches!(pool.erase(out_of_range), Err(GraphicsError::InvalidHandle { .. })));

        let mut other = DescriptorPool::new(headless.clone(), DescriptorHeapCapacities::default()).unwrap();
        let foreign = other.allocate(DescriptorHeapType::CbvSrvUav).unwrap();
        let _ = pool.allocate(DescriptorHeapType::CbvSrvUav).unwrap();
        assert!(matches!(pool.erase(foreign), Err(GraphicsError::InvalidHandle { .. })));
    }

    #[test]
    fn test_rtv_heap_is_not_shader_visible() {
        let (_headless, mut pool) = pool(8);
        let rtv = pool.allocate(DescriptorHeapType::Rtv).unwrap();
        assert!(rtv.gpu.is_null());
        assert_eq!(pool.shader_visible_heaps().len(), 2);
    }

    #[test]
    fn test_failed_view_write_releases_slot() {
        let (headless, mut pool) = pool(8);
        let mut resources = GpuResourceManager::new(headless.clone());
        let buffer = resources
            .create_buffer(&BufferDesc {
                size: 64,
                heap: HeapType::Upload,
                flags: ResourceFlags::empty(),
                initial_state: ResourceState::GenericRead,
                name: "vb".to_string(),
            })
            .unwrap();
        let srv = pool.create_structured_srv(&resources, buffer, 16).unwrap();
        assert!(matches!(
            headless.descriptor_view(pool.heap_id(DescriptorHeapType::CbvSrvUav), srv.index),
            Some(ViewDesc::StructuredBuffer { num_elements: 4, stride: 16, .. })
        ));

        // buffer 不能作为 RTV
        let bad = ViewDesc::RenderTarget {
            resource: resources.buffer(buffer).unwrap().native,
            format: crate::backend::types::Format::Rgba8Unorm,
        };
        assert!(pool.create_view(DescriptorHeapType::Rtv, &bad).is_err());
        assert_eq!(pool.allocated_count(DescriptorHeapType::Rtv), 0);
    }

    #[test]
    fn test_structured_srv_checks_stride_and_element_count() {
        let (headless, mut pool) = pool(8);
        let mut resources = GpuResourceManager::new(headless.clone());
        let buffer = resources
            .create_buffer(&BufferDesc {
                size: 64,
                heap: HeapType::Upload,
                flags: ResourceFlags::empty(),
                initial_state: ResourceState::GenericRead,
                name: "ib".to_string(),
            })
            .unwrap();
        assert!(matches!(
            pool.create_structured_srv(&resources, buffer, 0),
            Err(GraphicsError::InvalidState { .. })
        ));
        assert_eq!(pool.allocated_count(DescriptorHeapType::CbvSrvUav), 0);

        assert_eq!(structured_element_count(64, 40).unwrap(), 1);
        assert_eq!(structured_element_count(u32::MAX as u64 * 4, 4).unwrap(), u32::MAX);
        let too_many = (u32::MAX as u64 + 1) * 4;
        assert_eq!(
            structured_element_count(too_many, 4),
            Err(GraphicsError::CapacityExceeded {
                what: "structured buffer elements (stride 4)".to_string(),
                requested: u32::MAX as u64 + 1,
                capacity: u32::MAX as u64,
            })
        );
    }
}
