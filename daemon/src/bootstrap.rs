// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Assembles one daemon: registries, the four pipelines, the fabric
//! and the main kernel. Nothing here is process-global, so tests boot
//! several daemons inside one process.

use crate::control::register_control_types;
use crate::main_kernel::{Main, MainConfig};
use args::Properties;
use discovery::register_types as register_discovery_types;
use kernel::{
    Fabric, FabricParts, IdGenerator, InstanceRegistry, KernelPtr, LinkEnv, Pipeline,
    ShutdownGate, TypeRegistry, MAIN_KERNEL_ID,
};
use parking_lot::Mutex;
use pipeline::LocalPipeline;
use process::{ForeignBridge, ProcessConfig, ProcessPipeline, ProcessPipelineHandle};
use remote::{SocketConfig, SocketPipeline, SocketPipelineHandle};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A running daemon and its handles.
pub struct Daemon {
    pub fabric: Arc<Fabric>,
    pub local: Arc<LocalPipeline>,
    pub remote: Arc<SocketPipelineHandle>,
    pub process: Arc<ProcessPipelineHandle>,
    pub control: Arc<SocketPipelineHandle>,
    pub gate: Arc<ShutdownGate>,
}

impl Daemon {
    /// Stop every pipeline and join their threads.
    pub fn shutdown(&self) {
        info!("daemon shutting down");
        self.control.stop();
        self.remote.stop();
        self.process.stop();
        self.local.stop();
    }
}

/// Build and start a daemon from its effective configuration.
pub fn bootstrap(props: Properties) -> Result<Daemon, DaemonError> {
    let types = Arc::new(TypeRegistry::new());
    register_discovery_types(&types);
    register_control_types(&types);
    let instances = Arc::new(InstanceRegistry::new());
    let ids = Arc::new(IdGenerator::unbounded());
    let gate = ShutdownGate::new();

    let local = LocalPipeline::new("lat-local", props.threads);

    let (remote_pipe, remote) = SocketPipeline::create(SocketConfig {
        name: "lat-remote",
        port: props.port,
        use_localhost: props.use_localhost,
        unix_path: None,
        ..SocketConfig::default()
    })?;
    let (control_pipe, control) = SocketPipeline::create(SocketConfig {
        name: "lat-control",
        port: props.port,
        use_localhost: false,
        unix_path: Some(props.control_socket.clone()),
        ..SocketConfig::default()
    })?;
    let (process_pipe, process) = ProcessPipeline::create(ProcessConfig::default())?;

    let fabric = Fabric::new(FabricParts {
        local: local.clone(),
        remote: remote.clone(),
        process: process.clone(),
        control: control.clone(),
        types: types.clone(),
        instances: instances.clone(),
        ids: ids.clone(),
        this_application: 0,
        gate: gate.clone(),
    });

    // peer links hand foreign kernels to the workers; worker links hand
    // them back to the peers
    let to_process: Arc<dyn Pipeline> = ForeignBridge::into_pipeline(process.clone());
    let to_remote: Arc<dyn Pipeline> = ForeignBridge::into_pipeline(remote.clone());
    let remote_env = LinkEnv {
        native: local.clone(),
        remote: remote.clone(),
        foreign: to_process.clone(),
        types: types.clone(),
        instances: instances.clone(),
        ids: ids.clone(),
    };
    let control_env = LinkEnv {
        native: local.clone(),
        remote: control.clone(),
        foreign: to_process,
        types: types.clone(),
        instances: instances.clone(),
        ids: ids.clone(),
    };
    let process_env = LinkEnv {
        native: local.clone(),
        remote: remote.clone(),
        foreign: to_remote,
        types,
        instances: instances.clone(),
        ids,
    };

    local.start(fabric.clone());
    remote_pipe.start(remote_env);
    control_pipe.start(control_env);
    process_pipe.start(process_env);

    let main = Main::new(MainConfig {
        props,
        remote: remote.clone(),
        process: process.clone(),
        control: control.clone(),
    });
    let inst = Arc::new(Mutex::new(Box::new(main) as KernelPtr));
    instances.insert(MAIN_KERNEL_ID, inst.clone());
    local.activate(inst);

    info!("daemon started");
    Ok(Daemon {
        fabric,
        local,
        remote,
        process,
        control,
        gate,
    })
}
