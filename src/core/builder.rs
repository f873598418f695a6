//! 编排器构建器：统一装配底座、worker 工厂、能力探测与恢复系统
//!
//! 未显式提供的组件按配置生成默认实现：SubstrateWorkerFactory、绑定底座的 CapabilityProbe、默认策略链。

use std::sync::Arc;

use crate::capability::CapabilityProbe;
use crate::config::AppConfig;
use crate::core::{ExecError, Orchestrator, ShutdownManager};
use crate::recovery::{ErrorRecoverySystem, RecoveryStrategy, Validator};
use crate::substrate::{ComputeSubstrate, SubstrateWorkerFactory, WorkerFactory};

pub struct OrchestratorBuilder {
    config: AppConfig,
    substrate: Option<Arc<dyn ComputeSubstrate>>,
    factory: Option<Arc<dyn WorkerFactory>>,
    probe: Option<CapabilityProbe>,
    shutdown: Option<Arc<ShutdownManager>>,
    validator: Option<Validator>,
    strategies: Vec<Box<dyn RecoveryStrategy>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            substrate: None,
            factory: None,
            probe: None,
            shutdown: None,
            validator: None,
            strategies: Vec::new(),
        }
    }

    /// 计算底座（必需）
    pub fn with_substrate(mut self, substrate: Arc<dyn ComputeSubstrate>) -> Self {
        self.substrate = Some(substrate);
        self
    }

    /// 自定义 worker 工厂；默认每个 worker 共享同一个底座
    pub fn with_worker_factory(mut self, factory: Arc<dyn WorkerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_probe(mut self, probe: CapabilityProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// 共享的关闭管理器（例如已安装信号处理器的那个）
    pub fn with_shutdown_manager(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// 追加恢复策略（排在默认策略之后）
    pub fn with_strategy(mut self, strategy: Box<dyn RecoveryStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn build(self) -> Result<Arc<Orchestrator>, ExecError> {
        let substrate = self.substrate.ok_or_else(|| {
            ExecError::Initialization("no compute substrate configured".to_string())
        })?;
        let factory: Arc<dyn WorkerFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(SubstrateWorkerFactory::new(Arc::clone(&substrate))),
        };
        let probe = self.probe.unwrap_or_else(|| {
            CapabilityProbe::new(self.config.capability.clone()).with_substrate(Arc::clone(&substrate))
        });
        let shutdown = self.shutdown.unwrap_or_default();

        let mut recovery = ErrorRecoverySystem::new(self.config.recovery.clone());
        if let Some(validator) = self.validator {
            recovery = recovery.with_validator(validator);
        }
        for strategy in self.strategies {
            recovery = recovery.with_strategy(strategy);
        }

        Ok(Arc::new(Orchestrator::new(
            self.config,
            substrate,
            factory,
            probe,
            recovery,
            shutdown,
        )))
    }
}
