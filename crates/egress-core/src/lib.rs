//! Control plane of an egress node: admission, job lifecycle, update
//! fan-out, pipeline dispatch and the request bus.

pub mod admission;
mod config;
pub mod error;
pub mod executor;
mod job;
pub mod rpc;
pub mod sampler;
pub mod service;
#[cfg(test)]
mod test_support;
pub mod transport;
pub mod updates;
pub mod util;

pub use admission::{check_cpu_config, AdmissionController, CpuAdvisory};
pub use config::{
    config_schema_json, load_config, load_from_env, parse_config, write_schema_file,
    AdmissionConfig, BusBackend, BusConfig, Config, CpuCostConfig, PipelineConfig, ServiceConfig,
};
pub use error::{ConfigError, PipelineFailure, ServiceError};
pub use executor::{CommandExecutor, PipelineContext, PipelineExecutor};
pub use job::new_egress_id;
pub use rpc::{RpcClient, RpcError, RpcServer, UpdateStream};
pub use sampler::{host_cpus, spawn_sampler, CpuSampler, SysinfoSampler};
pub use service::{EgressService, ServiceOptions};
pub use transport::{Inbox, LocalTransport, Message, Transport};
pub use updates::{UpdatePublisher, UpdateSubscription};
