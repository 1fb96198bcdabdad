use bytemuck::{Pod, Zeroable};

/// 光追 shader 中通过 structured buffer 读取的顶点，position 必须位于开头
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 4],
}

impl Vertex {
    pub const STRIDE: u32 = size_of::<Vertex>() as u32;

    #[inline]
    const fn new(position: [f32; 3], normal: [f32; 3], color: [f32; 4]) -> Self {
        Self {
            position,
            normal,
            color,
        }
    }
}

const WHITE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];
const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
const YELLOW: [f32; 4] = [1.0, 1.0, 0.0, 1.0];
const MAGENTA: [f32; 4] = [1.0, 0.0, 1.0, 1.0];
const CYAN: [f32; 4] = [0.0, 1.0, 1.0, 1.0];

/// 索引为 u32 的三角形列表
#[derive(Clone, Debug, PartialEq)]
pub struct Shape {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Shape {
    pub const INDEX_STRIDE: u32 = size_of::<u32>() as u32;

    /// z = 0 平面上的 [-1, 1] 正方形，法线 +z
    pub fn plane() -> Self {
        let light_cyan = [0.8, 1.0, 1.0, 1.0];
        let normal = [0.0, 0.0, 1.0];
        Self {
            vertices: vec![
                Vertex::new([-1.0, -1.0, 0.0], normal, light_cyan),
                Vertex::new([-1.0, 1.0, 0.0], normal, WHITE),
                Vertex::new([1.0, -1.0, 0.0], normal, light_cyan),
                Vertex::new([1.0, 1.0, 0.0], normal, WHITE),
            ],
            indices: vec![0, 1, 2, 2, 1, 3],
        }
    }

    /// 边长为 2 的立方体，每个面 4 个顶点，使用各自的法线
    pub fn cube() -> Self {
        let vertices = vec![
            // back
            Vertex::new([-1.0, -1.0, -1.0], [0.0, 0.0, -1.0], RED),
            Vertex::new([-1.0, 1.0, -1.0], [0.0, 0.0, -1.0], YELLOW),
            Vertex::new([1.0, 1.0, -1.0], [0.0, 0.0, -1.0], WHITE),
            Vertex::new([1.0, -1.0, -1.0], [0.0, 0.0, -1.0], MAGENTA),
            // right
            Vertex::new([1.0, -1.0, -1.0], [1.0, 0.0, 0.0], MAGENTA),
            Vertex::new([1.0, 1.0, -1.0], [1.0, 0.0, 0.0], WHITE),
            Vertex::new([1.0, 1.0, 1.0], [1.0, 0.0, 0.0], CYAN),
            Vertex::new([1.0, -1.0, 1.0], [1.0, 0.0, 0.0], BLUE),
            // left
            Vertex::new([-1.0, -1.0, 1.0], [-1.0, 0.0, 0.0], BLACK),
            Vertex::new([-1.0, 1.0, 1.0], [-1.0, 0.0, 0.0], GREEN),
            Vertex::new([-1.0, 1.0, -1.0], [-1.0, 0.0, 0.0], YELLOW),
            Vertex::new([-1.0, -1.0, -1.0], [-1.0, 0.0, 0.0], RED),
            // front
            Vertex::new([1.0, -1.0, 1.0], [0.0, 0.0, 1.0], BLUE),
            Vertex::new([1.0, 1.0, 1.0], [0.0, 0.0, 1.0], CYAN),
            Vertex::new([-1.0, 1.0, 1.0], [0.0, 0.0, 1.0], GREEN),
            Vertex::new([-1.0, -1.0, 1.0], [0.0, 0.0, 1.0], BLACK),
            // top
            Vertex::new([-1.0, 1.0, -1.0], [0.0, 1.0, 0.0], YELLOW),
            Vertex::new([-1.0, 1.0, 1.0], [0.0, 1.0, 0.0], GREEN),
            Vertex::new([1.0, 1.0, 1.0], [0.0, 1.0, 0.0], CYAN),
            Vertex::new([1.0, 1.0, -1.0], [0.0, 1.0, 0.0], WHITE),
            // bottom
            Vertex::new([-1.0, -1.0, 1.0], [0.0, -1.0, 0.0], BLACK),
            Vertex::new([-1.0, -1.0, -1.0], [0.0, -1.0, 0.0], RED),
            Vertex::new([1.0, -1.0, -1.0], [0.0, -1.0, 0.0], MAGENTA),
            Vertex::new([1.0, -1.0, 1.0], [0.0, -1.0, 0.0], BLUE),
        ];
        // 每个面两个三角形：(0, 1, 2), (2, 3, 0)
        let indices = (0..6u32).flat_map(|face| [0, 1, 2, 2, 3, 0].map(|i| face * 4 + i)).collect();
        Self { vertices, indices }
    }

    #[inline]
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    #[inline]
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(Vertex::STRIDE, 40);
        assert_eq!(std::mem::offset_of!(Vertex, position), 0);
        assert_eq!(std::mem::offset_of!(Vertex, color), 24);
    }

    #[test]
    fn test_cube_faces_are_consistent() {
        let cube = Shape::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert_eq!(&cube.indices[6..12], &[4, 5, 6, 6, 7, 4]);
        assert_eq!(cube.index_bytes().len(), 144);

        // 同一个面上的顶点都位于法线方向的平面上
        for face in cube.vertices.chunks(4) {
            let normal = Vec3::from(face[0].normal);
            for v in face {
                assert_eq!(Vec3::from(v.normal), normal);
                assert_eq!(Vec3::from(v.position).dot(normal), 1.0);
            }
        }
    }

    #[test]
    fn test_plane() {
        let plane = Shape::plane();
        assert_eq!(plane.vertices.len(), 4);
        assert_eq!(plane.indices, vec![0, 1, 2, 2, 1, 3]);
        assert_eq!(plane.vertex_bytes().len(), 160);
        assert!(plane.indices.iter().all(|i| (*i as usize) < plane.vertices.len()));
    }
}
