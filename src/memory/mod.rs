//! 内存层：三级有界缓存、网格 LOD、内存压力与维护

pub mod cache;
pub mod lod;
pub mod manager;
pub mod pressure;

pub use cache::{BoundedCache, CacheEntry, CacheStats, InsertOutcome, SizeEstimate, PIN_PRIORITY};
pub use lod::{decimate, LodLevel, MeshLod};
pub use manager::{MaintenanceReport, MemoryManager, MemoryStats};
pub use pressure::MemoryPressure;
