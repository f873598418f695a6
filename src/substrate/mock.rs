//! Mock 计算底座（用于测试与演示，无需真实几何内核）
//!
//! 可配置延迟、按次注入失败、网格规模与上报内存；记录调用次数与峰值并发。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::substrate::{ComputeSubstrate, Mesh, SubstrateError};

#[derive(Default)]
struct FailureScript {
    /// 依次消费的失败消息
    queued: VecDeque<String>,
    /// 设置后每次调用都失败
    always: Option<String>,
}

pub struct MockSubstrate {
    delay: Mutex<Duration>,
    failures: Mutex<FailureScript>,
    mesh_triangles: AtomicUsize,
    memory_mb: AtomicU64,
    available: AtomicBool,
    invoke_calls: AtomicUsize,
    tessellate_calls: AtomicUsize,
    reset_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MockSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSubstrate {
    pub fn new() -> Self {
        Self {
            delay: Mutex::new(Duration::ZERO),
            failures: Mutex::new(FailureScript::default()),
            mesh_triangles: AtomicUsize::new(12),
            memory_mb: AtomicU64::new(0),
            available: AtomicBool::new(true),
            invoke_calls: AtomicUsize::new(0),
            tessellate_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn with_mesh_triangles(self, triangles: usize) -> Self {
        self.mesh_triangles.store(triangles, Ordering::SeqCst);
        self
    }

    pub fn with_memory_mb(self, memory_mb: u64) -> Self {
        self.set_memory_mb(memory_mb);
        self
    }

    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_memory_mb(&self, memory_mb: u64) {
        self.memory_mb.store(memory_mb, Ordering::SeqCst);
    }

    /// 接下来的 count 次调用失败
    pub fn fail_next(&self, count: usize, message: &str) {
        let mut script = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..count {
            script.queued.push_back(message.to_string());
        }
    }

    pub fn fail_always(&self, message: &str) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).always = Some(message.to_string());
    }

    /// 清除所有失败注入
    pub fn succeed(&self) {
        let mut script = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        script.queued.clear();
        script.always = None;
    }

    pub fn invoke_calls(&self) -> usize {
        self.invoke_calls.load(Ordering::SeqCst)
    }

    pub fn tessellate_calls(&self) -> usize {
        self.tessellate_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.invoke_calls() + self.tessellate_calls()
    }

    pub fn reset_calls(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Option<String> {
        let mut script = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        script.queued.pop_front().or_else(|| script.always.clone())
    }

    async fn simulate_work(&self) -> Result<(), SubstrateError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.next_failure() {
            Some(message) => Err(SubstrateError::new(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ComputeSubstrate for MockSubstrate {
    async fn invoke(&self, operation: &str, params: &Value) -> Result<Value, SubstrateError> {
        let n = self.invoke_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.simulate_work().await?;
        Ok(json!({
            "id": format!("{}_{}", operation.to_ascii_lowercase(), n),
            "operation": operation,
            "params": params.clone(),
        }))
    }

    async fn tessellate(&self, _shape_id: &str, _tolerance: f64) -> Result<Mesh, SubstrateError> {
        self.tessellate_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_work().await?;
        Ok(sample_mesh(self.mesh_triangles.load(Ordering::SeqCst)))
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn reset(&self) -> Result<(), SubstrateError> {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn memory_usage_mb(&self) -> Option<u64> {
        Some(self.memory_mb.load(Ordering::SeqCst))
    }
}

/// 生成指定三角形数的测试网格（条带排列，每个三角形独立 3 个顶点）
pub fn sample_mesh(triangles: usize) -> Mesh {
    let mut vertices = Vec::with_capacity(triangles * 9);
    let mut indices = Vec::with_capacity(triangles * 3);
    for i in 0..triangles {
        let x = i as f32;
        vertices.extend_from_slice(&[x, 0.0, 0.0, x + 1.0, 0.0, 0.0, x, 1.0, (i % 7) as f32]);
        let base = (i * 3) as u32;
        indices.extend_from_slice(&[base, base + 1, base + 2]);
    }
    Mesh::new(vertices, indices)
}
