// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Control kernels served on the daemon's UNIX socket: status queries,
//! job submission and cluster-wide termination. The front-end speaks
//! the ordinary kernel wire protocol; these types are registered like
//! any other kernel.

use discovery::Hierarchy;
use kernel::{
    BufferedKernel, ConnectionSnapshot, Decoder, Encoder, Fabric, Kernel, KernelCore, KernelPtr,
    PipelineSnapshot, TypeRegistry, WireError,
};
use process::Application;
use tracing::info;

pub const STATUS_WIRE_TYPE: u16 = 3;
pub const JOB_STATUS_WIRE_TYPE: u16 = 4;
pub const PIPELINE_STATUS_WIRE_TYPE: u16 = 5;
pub const SUBMIT_WIRE_TYPE: u16 = 6;
pub const TERMINATE_WIRE_TYPE: u16 = 7;

/// Register the control kernels with a node's type registry.
pub fn register_control_types(types: &TypeRegistry) {
    let _ = types.register(STATUS_WIRE_TYPE, decode_status);
    let _ = types.register(JOB_STATUS_WIRE_TYPE, decode_job_status);
    let _ = types.register(PIPELINE_STATUS_WIRE_TYPE, decode_pipeline_status);
    let _ = types.register(SUBMIT_WIRE_TYPE, decode_submit);
    let _ = types.register(TERMINATE_WIRE_TYPE, decode_terminate);
}

/// `status`: one hierarchy snapshot per managed interface.
#[derive(Debug, Default)]
pub struct StatusRequest {
    core: KernelCore,
    hierarchies: Vec<Hierarchy>,
}

impl StatusRequest {
    #[must_use]
    pub fn hierarchies(&self) -> &[Hierarchy] {
        &self.hierarchies
    }

    pub fn set_hierarchies(&mut self, hierarchies: Vec<Hierarchy>) {
        self.hierarchies = hierarchies;
    }
}

impl Kernel for StatusRequest {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        STATUS_WIRE_TYPE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u32(self.hierarchies.len() as u32);
        for h in &self.hierarchies {
            h.encode(enc);
        }
    }
}

fn decode_status(dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
    let count = dec.get_u32()? as usize;
    let mut hierarchies = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        hierarchies.push(Hierarchy::decode(dec)?);
    }
    Ok(Box::new(StatusRequest {
        core: KernelCore::default(),
        hierarchies,
    }))
}

/// `job-status`: lists running applications; IDs in the request are
/// removed and broadcast-terminated first.
#[derive(Debug, Default)]
pub struct JobStatusRequest {
    core: KernelCore,
    job_ids: Vec<u64>,
    jobs: Vec<Application>,
}

impl JobStatusRequest {
    #[must_use]
    pub fn new(job_ids: Vec<u64>) -> Self {
        Self {
            core: KernelCore::default(),
            job_ids,
            jobs: Vec::new(),
        }
    }

    #[must_use]
    pub fn job_ids(&self) -> &[u64] {
        &self.job_ids
    }

    #[must_use]
    pub fn jobs(&self) -> &[Application] {
        &self.jobs
    }

    pub fn set_jobs(&mut self, jobs: Vec<Application>) {
        self.jobs = jobs;
    }
}

impl Kernel for JobStatusRequest {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        JOB_STATUS_WIRE_TYPE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u32(self.job_ids.len() as u32);
        for id in &self.job_ids {
            enc.put_u64(*id);
        }
        enc.put_u32(self.jobs.len() as u32);
        for job in &self.jobs {
            job.encode(enc);
        }
    }
}

fn decode_job_status(dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
    let count = dec.get_u32()? as usize;
    let mut job_ids = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        job_ids.push(dec.get_u64()?);
    }
    let count = dec.get_u32()? as usize;
    let mut jobs = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        jobs.push(Application::decode(dec)?);
    }
    Ok(Box::new(JobStatusRequest {
        core: KernelCore::default(),
        job_ids,
        jobs,
    }))
}

/// `pipeline-status`: per-connection kernel buffers of every pipeline.
#[derive(Debug, Default)]
pub struct PipelineStatusRequest {
    core: KernelCore,
    pipelines: Vec<PipelineSnapshot>,
}

impl PipelineStatusRequest {
    #[must_use]
    pub fn pipelines(&self) -> &[PipelineSnapshot] {
        &self.pipelines
    }

    pub fn set_pipelines(&mut self, pipelines: Vec<PipelineSnapshot>) {
        self.pipelines = pipelines;
    }
}

fn encode_buffered(enc: &mut Encoder<'_>, entry: &BufferedKernel) {
    enc.put_u64(entry.id);
    enc.put_u16(entry.wire_type);
    enc.put_u64(entry.source_application);
    enc.put_u64(entry.target_application);
    enc.put_address(entry.source.as_ref());
    enc.put_address(entry.destination.as_ref());
}

fn decode_buffered(dec: &mut Decoder<'_>) -> Result<BufferedKernel, WireError> {
    Ok(BufferedKernel {
        id: dec.get_u64()?,
        wire_type: dec.get_u16()?,
        source_application: dec.get_u64()?,
        target_application: dec.get_u64()?,
        source: dec.get_address()?,
        destination: dec.get_address()?,
    })
}

fn state_name(raw: &str) -> &'static str {
    match raw {
        "starting" => "starting",
        "started" => "started",
        "stopping" => "stopping",
        "stopped" => "stopped",
        _ => "unknown",
    }
}

impl Kernel for PipelineStatusRequest {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        PIPELINE_STATUS_WIRE_TYPE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u32(self.pipelines.len() as u32);
        for p in &self.pipelines {
            enc.put_str(&p.name);
            enc.put_u32(p.connections.len() as u32);
            for c in &p.connections {
                enc.put_address(Some(&c.address));
                enc.put_str(c.state);
                enc.put_u64(c.weight);
                enc.put_u32(c.upstream.len() as u32);
                for entry in &c.upstream {
                    encode_buffered(enc, entry);
                }
                enc.put_u32(c.downstream.len() as u32);
                for entry in &c.downstream {
                    encode_buffered(enc, entry);
                }
            }
        }
    }
}

fn decode_pipeline_status(dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
    let count = dec.get_u32()? as usize;
    let mut pipelines = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        let name = dec.get_str()?;
        let conn_count = dec.get_u32()? as usize;
        let mut connections = Vec::with_capacity(conn_count.min(256));
        for _ in 0..conn_count {
            let Some(address) = dec.get_address()? else {
                continue;
            };
            let state = state_name(&dec.get_str()?);
            let weight = dec.get_u64()?;
            let up_count = dec.get_u32()? as usize;
            let mut upstream = Vec::with_capacity(up_count.min(1024));
            for _ in 0..up_count {
                upstream.push(decode_buffered(dec)?);
            }
            let down_count = dec.get_u32()? as usize;
            let mut downstream = Vec::with_capacity(down_count.min(1024));
            for _ in 0..down_count {
                downstream.push(decode_buffered(dec)?);
            }
            connections.push(ConnectionSnapshot {
                address,
                state,
                weight,
                upstream,
                downstream,
            });
        }
        pipelines.push(PipelineSnapshot { name, connections });
    }
    Ok(Box::new(PipelineStatusRequest {
        core: KernelCore::default(),
        pipelines,
    }))
}

/// `submit <app-spec>`: add an application to the child-process
/// pipeline.
#[derive(Debug, Default)]
pub struct SubmitRequest {
    core: KernelCore,
    application: Option<Application>,
    assigned_id: u64,
    message: String,
}

impl SubmitRequest {
    #[must_use]
    pub fn new(application: Application) -> Self {
        Self {
            core: KernelCore::default(),
            application: Some(application),
            assigned_id: 0,
            message: String::new(),
        }
    }

    pub fn take_application(&mut self) -> Option<Application> {
        self.application.take()
    }

    #[must_use]
    pub fn assigned_id(&self) -> u64 {
        self.assigned_id
    }

    pub fn set_assigned_id(&mut self, id: u64) {
        self.assigned_id = id;
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn set_message(&mut self, message: String) {
        self.message = message;
    }
}

impl Kernel for SubmitRequest {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        SUBMIT_WIRE_TYPE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        match &self.application {
            Some(app) => {
                enc.put_bool(true);
                app.encode(enc);
            }
            None => enc.put_bool(false),
        }
        enc.put_u64(self.assigned_id);
        enc.put_str(&self.message);
    }
}

fn decode_submit(dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
    let application = if dec.get_bool()? {
        Some(Application::decode(dec)?)
    } else {
        None
    };
    Ok(Box::new(SubmitRequest {
        core: KernelCore::default(),
        application,
        assigned_id: dec.get_u64()?,
        message: dec.get_str()?,
    }))
}

/// `terminate <id…>`: broadcast to the cluster; every daemon drops
/// queued kernels of the listed applications and kills local workers.
#[derive(Debug, Default)]
pub struct TerminateRequest {
    core: KernelCore,
    job_ids: Vec<u64>,
}

impl TerminateRequest {
    #[must_use]
    pub fn new(job_ids: Vec<u64>) -> Self {
        Self {
            core: KernelCore::default(),
            job_ids,
        }
    }

    #[must_use]
    pub fn job_ids(&self) -> &[u64] {
        &self.job_ids
    }
}

impl Kernel for TerminateRequest {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut KernelCore {
        &mut self.core
    }

    fn wire_type(&self) -> u16 {
        TERMINATE_WIRE_TYPE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u32(self.job_ids.len() as u32);
        for id in &self.job_ids {
            enc.put_u64(*id);
        }
    }

    /// Runs on every daemon the broadcast reaches.
    fn act(&mut self, fabric: &Fabric) {
        info!(jobs = ?self.job_ids, "terminating applications");
        fabric.remote().drop_application(&self.job_ids);
        fabric.process().drop_application(&self.job_ids);
    }
}

fn decode_terminate(dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
    let count = dec.get_u32()? as usize;
    let mut job_ids = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        job_ids.push(dec.get_u64()?);
    }
    Ok(Box::new(TerminateRequest {
        core: KernelCore::default(),
        job_ids,
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use kernel::codec::{Decoded, decode_kernel, encode_kernel};

    fn round_trip(k: &dyn Kernel) -> KernelPtr {
        let types = TypeRegistry::new();
        register_control_types(&types);
        let mut out = BytesMut::new();
        encode_kernel(k, &mut out, false);
        match decode_kernel(&types, 0, None, None, &out.freeze()).unwrap() {
            Decoded::Native(k) => k,
            Decoded::Foreign(_) => panic!("expected a native kernel"),
        }
    }

    #[test]
    fn status_reply_round_trip() {
        let mut status = StatusRequest::default();
        let mut h = Hierarchy::new("10.0.0.2/24".parse().unwrap(), 33333);
        h.add_subordinate(kernel::SocketAddress::Ipv4("10.0.0.4:33333".parse().unwrap()));
        status.set_hierarchies(vec![h.clone()]);
        let got = round_trip(&status);
        let got = got.downcast_ref::<StatusRequest>().unwrap();
        assert_eq!(got.hierarchies(), &[h]);
    }

    #[test]
    fn submit_round_trip() {
        let submit = SubmitRequest::new(Application::new(
            7,
            vec!["/bin/wave".into(), "--order".into(), "3".into()],
        ));
        let got = round_trip(&submit);
        let mut got = got.downcast::<SubmitRequest>().unwrap();
        let app = got.take_application().unwrap();
        assert_eq!(app.id, 7);
        assert_eq!(app.argv.len(), 3);
    }

    #[test]
    fn terminate_round_trip() {
        let t = TerminateRequest::new(vec![42, 43]);
        let got = round_trip(&t);
        assert_eq!(
            got.downcast_ref::<TerminateRequest>().unwrap().job_ids(),
            &[42, 43]
        );
    }
}
