// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! `lattice-ctl`: the control front-end. Speaks the kernel wire
//! protocol over the daemon's UNIX control socket.

use args::DEFAULT_CONTROL_SOCKET;
use bytes::BytesMut;
use clap::{Parser, Subcommand};
use daemon::control::{
    JobStatusRequest, PipelineStatusRequest, StatusRequest, SubmitRequest, TerminateRequest,
    register_control_types,
};
use kernel::codec::{Decoded, decode_kernel, encode_kernel};
use kernel::frame::{begin_packet, end_packet, read_packet};
use kernel::{Kernel, KernelPtr, MAIN_KERNEL_ID, Phase, Principal, ReturnCode, TypeRegistry};
use process::Application;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lattice-ctl")]
#[command(about = "Control a running lattice daemon", long_about = None)]
struct Cli {
    /// Path of the daemon's control socket.
    #[arg(long, default_value = DEFAULT_CONTROL_SOCKET)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the hierarchy of every managed interface.
    Status,
    /// Show running applications.
    JobStatus {
        /// Applications to terminate before listing.
        ids: Vec<u64>,
    },
    /// Show per-connection kernel buffers.
    PipelineStatus,
    /// Submit an application to the cluster.
    Submit {
        /// Run as this uid (root only).
        #[arg(long, default_value_t = 0)]
        uid: u32,
        /// Run as this gid (root only).
        #[arg(long, default_value_t = 0)]
        gid: u32,
        /// Program and its arguments.
        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,
    },
    /// Broadcast a terminate kernel for the listed applications.
    Terminate {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CtlError {
    #[error("cannot reach the daemon: {0}")]
    Connect(std::io::Error),
    #[error("i/o error talking to the daemon: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad reply from the daemon: {0}")]
    Wire(#[from] kernel::WireError),
    #[error("the daemon closed the connection")]
    Closed,
    #[error("request failed: {0}")]
    Failed(ReturnCode),
}

/// Send one request kernel and wait for its downstream reply.
fn round_trip(socket: &PathBuf, request: &dyn Kernel) -> Result<KernelPtr, CtlError> {
    let mut stream = UnixStream::connect(socket).map_err(CtlError::Connect)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;

    let mut out = BytesMut::new();
    let at = begin_packet(&mut out);
    encode_kernel(request, &mut out, false);
    end_packet(&mut out, at);
    stream.write_all(&out)?;

    let types = TypeRegistry::new();
    register_control_types(&types);
    let mut input = BytesMut::new();
    let mut chunk = [0u8; 16 * 1024];
    let packet = loop {
        if let Some(packet) = read_packet(&mut input)? {
            break packet;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(CtlError::Closed);
        }
        input.extend_from_slice(&chunk[..n]);
    };
    match decode_kernel(&types, 0, None, None, &packet)? {
        Decoded::Native(reply) => {
            if reply.core().return_code() != ReturnCode::Success {
                return Err(CtlError::Failed(reply.core().return_code()));
            }
            Ok(reply)
        }
        Decoded::Foreign(_) => Err(CtlError::Closed),
    }
}

fn prepare(k: &mut dyn Kernel) {
    k.core_mut().set_id(1);
    k.core_mut().set_phase(Phase::PointToPoint);
    k.core_mut().set_principal(Principal::Id(MAIN_KERNEL_ID));
}

fn run(cli: Cli) -> Result<(), CtlError> {
    match cli.command {
        Command::Status => {
            let mut request = StatusRequest::default();
            prepare(&mut request);
            let reply = round_trip(&cli.socket, &request)?;
            let status = reply.downcast_ref::<StatusRequest>().ok_or(CtlError::Closed)?;
            if status.hierarchies().is_empty() {
                println!("no managed interfaces");
            }
            for hierarchy in status.hierarchies() {
                println!("{hierarchy}");
                for (address, node) in hierarchy.subordinates() {
                    println!("  subordinate {address} ({})", node.resources());
                }
            }
        }
        Command::JobStatus { ids } => {
            let mut request = JobStatusRequest::new(ids);
            prepare(&mut request);
            let reply = round_trip(&cli.socket, &request)?;
            let jobs = reply
                .downcast_ref::<JobStatusRequest>()
                .ok_or(CtlError::Closed)?;
            if jobs.jobs().is_empty() {
                println!("no running applications");
            }
            for job in jobs.jobs() {
                println!("{}\t{}", job.id, job.argv.join(" "));
            }
        }
        Command::PipelineStatus => {
            let mut request = PipelineStatusRequest::default();
            prepare(&mut request);
            let reply = round_trip(&cli.socket, &request)?;
            let status = reply
                .downcast_ref::<PipelineStatusRequest>()
                .ok_or(CtlError::Closed)?;
            for pipeline in status.pipelines() {
                println!("{}:", pipeline.name);
                for conn in &pipeline.connections {
                    println!(
                        "  {} {} weight={} upstream={} downstream={}",
                        conn.address,
                        conn.state,
                        conn.weight,
                        conn.upstream.len(),
                        conn.downstream.len()
                    );
                    for entry in &conn.upstream {
                        println!(
                            "    ^ kernel {} type {} app {}",
                            entry.id, entry.wire_type, entry.target_application
                        );
                    }
                    for entry in &conn.downstream {
                        println!(
                            "    v kernel {} type {} app {}",
                            entry.id, entry.wire_type, entry.target_application
                        );
                    }
                }
            }
        }
        Command::Submit { uid, gid, argv } => {
            let mut app = Application::new(0, argv);
            app.uid = uid;
            app.gid = gid;
            let mut request = SubmitRequest::new(app);
            prepare(&mut request);
            let reply = round_trip(&cli.socket, &request)?;
            let submit = reply.downcast_ref::<SubmitRequest>().ok_or(CtlError::Closed)?;
            println!("submitted as application {}", submit.assigned_id());
        }
        Command::Terminate { ids } => {
            let mut request = TerminateRequest::new(ids);
            prepare(&mut request);
            round_trip(&cli.socket, &request)?;
            println!("terminate broadcast sent");
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("lattice-ctl: {err}");
        std::process::exit(1);
    }
}
