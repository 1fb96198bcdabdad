use glam::{EulerRot, Mat4, Quat, Vec3};

/// 场景中一个 instance 的摆放方式
///
/// instance id 与 hit group 偏移都使用 instance 在 TLAS 中的序号，
/// 因此 shader 中 `InstanceID()` 与命中的 hit group record 是一致的。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Deployment {
    pub scale: Vec3,
    /// 弧度，先绕 x 再绕 y 最后绕 z
    pub rotation: Vec3,
    pub translation: Vec3,
    pub instance_id: u32,
    pub hit_group_contribution: u32,
}

impl Deployment {
    /// 地板，使用 plane 网格
    pub const FLOOR: Deployment = Deployment {
        scale: Vec3::ONE,
        rotation: Vec3::new(0.0, 1.0, 0.0),
        translation: Vec3::new(2.0, 0.0, 1.0),
        instance_id: 0,
        hit_group_contribution: 0,
    };

    /// 使用 cube 网格
    pub const CUBE: Deployment = Deployment {
        scale: Vec3::new(0.5, 0.5, 0.5),
        rotation: Vec3::new(0.5, 0.5, 0.0),
        translation: Vec3::new(0.0, 0.0, 0.5),
        instance_id: 1,
        hit_group_contribution: 1,
    };

    /// scale → rotate → translate
    pub fn transform(&self) -> Mat4 {
        let rotation = Quat::from_euler(EulerRot::ZYX, self.rotation.z, self.rotation.y, self.rotation.x);
        Mat4::from_scale_rotation_translation(self.scale, rotation, self.translation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform() {
        let floor = Deployment::FLOOR.transform();
        assert!(floor.w_axis.truncate().abs_diff_eq(Vec3::new(2.0, 0.0, 1.0), 1e-6));
        // 绕 y 轴旋转 1 弧度
        let x = floor.transform_vector3(Vec3::X);
        assert!(x.abs_diff_eq(Vec3::new(1f32.cos(), 0.0, -1f32.sin()), 1e-6));

        let cube = Deployment::CUBE.transform();
        assert!((cube.transform_vector3(Vec3::Y).length() - 0.5).abs() < 1e-6);
        assert!(cube.transform_point3(Vec3::ZERO).abs_diff_eq(Vec3::new(0.0, 0.0, 0.5), 1e-6));
    }
}
