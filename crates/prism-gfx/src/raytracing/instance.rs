use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::backend::types::GpuVirtualAddress;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NON_OPAQUE = 1 << 3;
    }
}

/// TLAS 中的一个 instance，内存布局与 `D3D12_RAYTRACING_INSTANCE_DESC` 一致（64 字节）
///
/// - `transform`：3x4 行主序的仿射变换
/// - InstanceID 与 mask 共用一个 u32：低 24 位为 ID，高 8 位为 mask
/// - hit group contribution 与 flags 共用一个 u32：低 24 位为 contribution，高 8 位为 flags
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    pub transform: [f32; 12],
    instance_id_and_mask: u32,
    contribution_and_flags: u32,
    pub acceleration_structure: GpuVirtualAddress,
}

const LOW_24_BITS: u32 = 0x00FF_FFFF;

impl InstanceDesc {
    pub const DEFAULT_MASK: u8 = 0xFF;

    pub fn new(transform: &Mat4, instance_id: u32, hit_group_contribution: u32, blas: GpuVirtualAddress) -> Self {
        Self {
            transform: Self::transform_rows(transform),
            instance_id_and_mask: (instance_id & LOW_24_BITS) | ((Self::DEFAULT_MASK as u32) << 24),
            contribution_and_flags: hit_group_contribution & LOW_24_BITS,
            acceleration_structure: blas,
        }
    }

    /// glam 为列主序，这里取出前三行
    pub fn transform_rows(transform: &Mat4) -> [f32; 12] {
        let rows = transform.transpose().to_cols_array();
        let mut out = [0.0; 12];
        out.copy_from_slice(&rows[..12]);
        out
    }

    #[inline]
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.instance_id_and_mask = (self.instance_id_and_mask & LOW_24_BITS) | ((mask as u32) << 24);
        self
    }

    #[inline]
    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.contribution_and_flags = (self.contribution_and_flags & LOW_24_BITS) | ((flags.bits() as u32) << 24);
        self
    }

    #[inline]
    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & LOW_24_BITS
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    #[inline]
    pub fn hit_group_contribution(&self) -> u32 {
        self.contribution_and_flags & LOW_24_BITS
    }

    #[inline]
    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.contribution_and_flags >> 24) as u8)
    }
}

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};

    use super::*;

    #[test]
    fn test_layout_is_64_bytes() {
        assert_eq!(size_of::<InstanceDesc>(), 64);
        assert_eq!(std::mem::offset_of!(InstanceDesc, acceleration_structure), 56);
    }

    #[test]
    fn test_bit_packing() {
        let desc = InstanceDesc::new(&Mat4::IDENTITY, 0x0123_4567, 1, 0x1000)
            .with_mask(0x0F)
            .with_flags(InstanceFlags::FORCE_OPAQUE);
        assert_eq!(desc.instance_id(), 0x23_4567);
        assert_eq!(desc.mask(), 0x0F);
        assert_eq!(desc.hit_group_contribution(), 1);
        assert_eq!(desc.flags(), InstanceFlags::FORCE_OPAQUE);
        assert_eq!(InstanceDesc::new(&Mat4::IDENTITY, 0, 0, 0).mask(), 0xFF);
    }

    #[test]
    fn test_transform_is_row_major() {
        let m = Mat4::from_scale_rotation_translation(Vec3::ONE, Quat::IDENTITY, Vec3::new(2.0, 0.0, 1.0));
        let rows = InstanceDesc::transform_rows(&m);
        assert_eq!(rows, [1.0, 0.0, 0.0, 2.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
    }
}
