//! 三角网格与轴对齐包围盒

use serde::{Deserialize, Serialize};

/// 三角网格：顶点为扁平 xyz 数组，索引每 3 个一个三角形
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mesh {
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normals: Option<Vec<f32>>,
}

/// 轴对齐包围盒
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Mesh {
    pub fn new(vertices: Vec<f32>, indices: Vec<u32>) -> Self {
        Self {
            vertices,
            indices,
            normals: None,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// 估算占用字节数
    pub fn size_bytes(&self) -> usize {
        let normals = self.normals.as_ref().map_or(0, Vec::len);
        (self.vertices.len() + normals) * std::mem::size_of::<f32>()
            + self.indices.len() * std::mem::size_of::<u32>()
    }

    /// 顶点坐标的轴对齐包围盒；没有顶点时为 None
    pub fn bounds(&self) -> Option<Aabb> {
        let mut points = self.vertices.chunks_exact(3);
        let first = points.next()?;
        let mut min = [first[0], first[1], first[2]];
        let mut max = min;
        for p in points {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        Some(Aabb { min, max })
    }
}

impl Aabb {
    /// 8 顶点、12 三角形的盒子网格
    pub fn to_box_mesh(&self) -> Mesh {
        let [x0, y0, z0] = self.min;
        let [x1, y1, z1] = self.max;
        let vertices = vec![
            x0, y0, z0, // 0
            x1, y0, z0, // 1
            x1, y1, z0, // 2
            x0, y1, z0, // 3
            x0, y0, z1, // 4
            x1, y0, z1, // 5
            x1, y1, z1, // 6
            x0, y1, z1, // 7
        ];
        let indices = vec![
            0, 2, 1, 0, 3, 2, // -z
            4, 5, 6, 4, 6, 7, // +z
            0, 1, 5, 0, 5, 4, // -y
            3, 7, 6, 3, 6, 2, // +y
            0, 4, 7, 0, 7, 3, // -x
            1, 2, 6, 1, 6, 5, // +x
        ];
        Mesh::new(vertices, indices)
    }
}
