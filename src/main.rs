//! Geoexec 演示入口
//!
//! 初始化日志与配置，在 Mock 底座上跑几次建模与网格化调用，打印统计后优雅关闭。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use geoexec::config::load_config;
use geoexec::core::ShutdownManager;
use geoexec::observability;
use geoexec::substrate::MockSubstrate;
use geoexec::OrchestratorBuilder;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let substrate = Arc::new(MockSubstrate::new().with_mesh_triangles(4096));
    let orchestrator = OrchestratorBuilder::new(config)
        .with_substrate(substrate.clone())
        .with_shutdown_manager(shutdown)
        .build()
        .context("Failed to build orchestrator")?;
    orchestrator
        .initialize()
        .await
        .context("Failed to initialize orchestrator")?;

    let made = orchestrator
        .invoke("MAKE_BOX", json!({"width": 10.0, "height": 20.0, "depth": 30.0}))
        .await;
    println!("{}", serde_json::to_string_pretty(&made)?);

    // 负尺寸会被自动修正
    let fixed = orchestrator.invoke("MAKE_SPHERE", json!({"radius": -5.0})).await;
    println!("{}", serde_json::to_string_pretty(&fixed)?);

    // 一次瞬时故障，由恢复策略重试
    substrate.fail_next(1, "network connection reset");
    let retried = orchestrator
        .invoke("MAKE_CYLINDER", json!({"radius": 2.0, "height": 8.0}))
        .await;
    println!(
        "cylinder: success={} fallback_used={} retry_count={}",
        retried.success, retried.fallback_used, retried.retry_count
    );

    if let Some(shape_id) = made
        .data
        .as_ref()
        .and_then(|d| d.get("id"))
        .and_then(|v| v.as_str())
    {
        for _ in 0..2 {
            let mesh = orchestrator.tessellate(shape_id, 0.1).await;
            if let Some(output) = &mesh.data {
                println!(
                    "tessellate {}: lod={:?} triangles={} cache_hit={}",
                    shape_id,
                    output.lod,
                    output.mesh.triangle_count(),
                    mesh.performance.cache_hit
                );
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&orchestrator.stats())?);
    orchestrator.shutdown().await;
    Ok(())
}
