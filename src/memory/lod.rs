//! 网格多级细节（LOD）
//!
//! 入缓存时一次性生成：medium 约 50%、low 约 25%（固定步长抽取三角形并压缩顶点），
//! 以及一个 8 顶点 12 三角形的包围盒代理。取用时按内存压力选择级别。

use std::collections::HashMap;

use serde::Serialize;

use crate::memory::{MemoryPressure, SizeEstimate};
use crate::substrate::Mesh;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LodLevel {
    Bounds,
    Low,
    Medium,
    High,
}

impl LodLevel {
    /// high = 3 … bounds = 0
    pub fn rank(self) -> u8 {
        match self {
            LodLevel::Bounds => 0,
            LodLevel::Low => 1,
            LodLevel::Medium => 2,
            LodLevel::High => 3,
        }
    }

    /// 各压力等级下的候选顺序
    pub fn preference(pressure: MemoryPressure) -> &'static [LodLevel] {
        match pressure {
            MemoryPressure::Low => &[LodLevel::High, LodLevel::Medium, LodLevel::Low, LodLevel::Bounds],
            MemoryPressure::Medium => {
                &[LodLevel::Medium, LodLevel::High, LodLevel::Low, LodLevel::Bounds]
            }
            MemoryPressure::High => &[LodLevel::Low, LodLevel::Medium, LodLevel::Bounds],
            MemoryPressure::Critical => &[LodLevel::Bounds],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshLod {
    pub high: Option<Mesh>,
    pub medium: Option<Mesh>,
    pub low: Option<Mesh>,
    pub bounds: Mesh,
}

impl MeshLod {
    /// `levels` 为保留的细节级别数（含 high），三角形数不超过 `triangle_threshold` 时不降采样
    pub fn build(mesh: Mesh, levels: usize, triangle_threshold: usize) -> Self {
        let bounds = mesh
            .bounds()
            .map(|aabb| aabb.to_box_mesh())
            .unwrap_or_default();

        let decimate_allowed = mesh.triangle_count() > triangle_threshold;
        let medium = (decimate_allowed && levels >= 2).then(|| decimate(&mesh, 2));
        let low = (decimate_allowed && levels >= 3).then(|| decimate(&mesh, 4));

        Self {
            high: Some(mesh),
            medium,
            low,
            bounds,
        }
    }

    pub fn level(&self, level: LodLevel) -> Option<&Mesh> {
        match level {
            LodLevel::High => self.high.as_ref(),
            LodLevel::Medium => self.medium.as_ref(),
            LodLevel::Low => self.low.as_ref(),
            LodLevel::Bounds => Some(&self.bounds),
        }
    }

    pub fn available_levels(&self) -> Vec<LodLevel> {
        [LodLevel::High, LodLevel::Medium, LodLevel::Low, LodLevel::Bounds]
            .into_iter()
            .filter(|l| self.level(*l).is_some())
            .collect()
    }

    /// 在不高于 requested 的级别中按压力偏好取第一个存在的；都没有时退到包围盒
    pub fn select(&self, requested: LodLevel, pressure: MemoryPressure) -> (LodLevel, &Mesh) {
        LodLevel::preference(pressure)
            .iter()
            .copied()
            .filter(|candidate| *candidate <= requested)
            .find_map(|candidate| self.level(candidate).map(|mesh| (candidate, mesh)))
            .unwrap_or((LodLevel::Bounds, &self.bounds))
    }

    /// 原地降级：已有 medium 时丢弃 high；返回是否发生变化
    pub fn degrade(&mut self) -> bool {
        if self.high.is_some() && self.medium.is_some() {
            self.high = None;
            true
        } else {
            false
        }
    }
}

impl SizeEstimate for MeshLod {
    fn size_bytes(&self) -> usize {
        [&self.high, &self.medium, &self.low]
            .into_iter()
            .flatten()
            .map(Mesh::size_bytes)
            .sum::<usize>()
            + self.bounds.size_bytes()
    }
}

/// 每 stride 个三角形保留一个，并压缩掉不再被引用的顶点
pub fn decimate(mesh: &Mesh, stride: usize) -> Mesh {
    let stride = stride.max(1);
    let mut remap: HashMap<u32, u32> = HashMap::new();
    let mut vertices = Vec::new();
    let mut normals = mesh.normals.as_ref().map(|_| Vec::new());
    let mut indices = Vec::with_capacity(mesh.indices.len() / stride + 3);

    for triangle in mesh.indices.chunks_exact(3).step_by(stride) {
        for &old in triangle {
            let new = *remap.entry(old).or_insert_with(|| {
                let base = old as usize * 3;
                let next = (vertices.len() / 3) as u32;
                vertices.extend_from_slice(mesh.vertices.get(base..base + 3).unwrap_or(&[0.0; 3]));
                if let (Some(out), Some(src)) = (normals.as_mut(), mesh.normals.as_ref()) {
                    out.extend_from_slice(src.get(base..base + 3).unwrap_or(&[0.0; 3]));
                }
                next
            });
            indices.push(new);
        }
    }

    Mesh {
        vertices,
        indices,
        normals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::sample_mesh;

    #[test]
    fn test_build_with_decimation() {
        let lod = MeshLod::build(sample_mesh(2000), 3, 1000);
        assert_eq!(lod.high.as_ref().unwrap().triangle_count(), 2000);
        assert_eq!(lod.medium.as_ref().unwrap().triangle_count(), 1000);
        assert_eq!(lod.low.as_ref().unwrap().triangle_count(), 500);
        assert_eq!(lod.bounds.vertex_count(), 8);
        assert_eq!(lod.bounds.triangle_count(), 12);
    }

    #[test]
    fn test_small_mesh_keeps_only_high() {
        let lod = MeshLod::build(sample_mesh(10), 3, 1000);
        assert!(lod.medium.is_none());
        assert!(lod.low.is_none());
        assert_eq!(lod.available_levels(), vec![LodLevel::High, LodLevel::Bounds]);
    }

    #[test]
    fn test_lod_levels_limits_decimation() {
        let lod = MeshLod::build(sample_mesh(2000), 2, 1000);
        assert!(lod.medium.is_some());
        assert!(lod.low.is_none());
    }

    #[test]
    fn test_decimate_compacts_vertices() {
        let mesh = sample_mesh(100);
        let half = decimate(&mesh, 2);
        assert_eq!(half.triangle_count(), 50);
        assert!(half.vertex_count() <= 150);
        assert!(half.indices.iter().all(|&i| (i as usize) < half.vertex_count()));
    }

    #[test]
    fn test_select_by_pressure() {
        let lod = MeshLod::build(sample_mesh(2000), 3, 1000);
        assert_eq!(lod.select(LodLevel::High, MemoryPressure::Low).0, LodLevel::High);
        assert_eq!(lod.select(LodLevel::Medium, MemoryPressure::Low).0, LodLevel::Medium);
        assert_eq!(lod.select(LodLevel::High, MemoryPressure::Medium).0, LodLevel::Medium);
        assert_eq!(lod.select(LodLevel::High, MemoryPressure::High).0, LodLevel::Low);
        assert_eq!(lod.select(LodLevel::High, MemoryPressure::Critical).0, LodLevel::Bounds);
    }

    #[test]
    fn test_select_falls_back_to_coarser_level() {
        let lod = MeshLod::build(sample_mesh(10), 3, 1000);
        // 只有 high 与 bounds
        assert_eq!(lod.select(LodLevel::High, MemoryPressure::High).0, LodLevel::Bounds);
        assert_eq!(lod.select(LodLevel::High, MemoryPressure::Medium).0, LodLevel::High);
    }

    #[test]
    fn test_degrade_drops_high_only_when_medium_exists() {
        let mut lod = MeshLod::build(sample_mesh(2000), 3, 1000);
        let before = lod.size_bytes();
        assert!(lod.degrade());
        assert!(lod.high.is_none());
        assert!(lod.size_bytes() < before);
        assert!(!lod.degrade());

        let mut small = MeshLod::build(sample_mesh(10), 3, 1000);
        assert!(!small.degrade());
        assert!(small.high.is_some());
    }
}
