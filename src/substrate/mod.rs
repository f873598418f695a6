//! 计算底座层：协作方接口、操作词表、网格、Worker 抽象与传输信封、Mock 实现

pub mod mesh;
pub mod mock;
pub mod operation;
pub mod traits;
pub mod transport;
pub mod worker;

pub use mesh::{Aabb, Mesh};
pub use mock::{sample_mesh, MockSubstrate};
pub use operation::{Operation, OperationKind};
pub use traits::{ComputeSubstrate, SubstrateError};
pub use transport::{ErrorPayload, WorkerResponse};
pub use worker::{
    SubstrateWorker, SubstrateWorkerFactory, WorkerError, WorkerFactory, WorkerHandle,
    WorkerHealth,
};
