// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-process cluster tests: two daemons on loopback aliases discover
//! each other, exchange weights, and answer control queries.

use args::Properties;
use bytes::BytesMut;
use daemon::control::{StatusRequest, register_control_types};
use daemon::{Daemon, bootstrap};
use discovery::{Discoverer, Hierarchy};
use kernel::codec::{Decoded, decode_kernel, encode_kernel};
use kernel::frame::{begin_packet, end_packet, read_packet};
use kernel::{Kernel, MAIN_KERNEL_ID, Phase, Principal, SocketAddress, TypeRegistry};
use serial_test::serial;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

fn props(last: u8, port: u16, tmp: &Path) -> Properties {
    Properties {
        port,
        fanout: 2,
        scan_interval: Duration::from_millis(300),
        max_attempts: 2,
        cache_dir: tmp.join(format!("cache-{last}")),
        control_socket: tmp.join(format!("control-{last}.sock")),
        allowed: vec!["127.0.0.0/8".parse().unwrap()],
        interfaces: vec![format!("127.0.0.{last}/29").parse().unwrap()],
        threads: 2,
        interface_update_interval: Duration::from_secs(1),
        use_localhost: true,
    }
}

fn hierarchies(daemon: &Daemon) -> Vec<Hierarchy> {
    daemon
        .fabric
        .instances()
        .snapshot()
        .iter()
        .filter_map(|(_, inst)| {
            let guard = inst.lock();
            guard
                .downcast_ref::<Discoverer>()
                .map(|d| d.hierarchy().clone())
        })
        .collect()
}

fn endpoint(last: u8, port: u16) -> SocketAddress {
    SocketAddress::Ipv4(format!("127.0.0.{last}:{port}").parse().unwrap())
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

#[test]
#[serial]
fn two_nodes_form_a_hierarchy() {
    let tmp = tempfile::tempdir().unwrap();
    let port = 35701;
    let a = bootstrap(props(1, port, tmp.path())).unwrap();
    let b = bootstrap(props(2, port, tmp.path())).unwrap();

    // within one scan interval .2 selects .1 as its superior and .1
    // learns about its new subordinate
    let converged = wait_until(Duration::from_secs(20), || {
        let ha = hierarchies(&a);
        let hb = hierarchies(&b);
        let a_ok = ha
            .first()
            .is_some_and(|h| h.has_subordinate(&endpoint(2, port)));
        let b_ok = hb.first().is_some_and(|h| h.superior_is(&endpoint(1, port)));
        a_ok && b_ok
    });
    assert!(converged, "discovery did not converge");

    // both nodes see a cluster of two
    let ha = hierarchies(&a);
    let hb = hierarchies(&b);
    assert_eq!(ha[0].total_weight().nodes(), 2);
    assert_eq!(hb[0].total_resources().nodes(), 2);

    // both caches were written
    assert!(tmp.path().join("cache-1/127.0.0.1-29-35701").exists());
    assert!(tmp.path().join("cache-2/127.0.0.2-29-35701").exists());

    b.shutdown();
    a.shutdown();
}

#[test]
#[serial]
fn status_query_over_the_control_socket() {
    let tmp = tempfile::tempdir().unwrap();
    let port = 35702;
    let daemon = bootstrap(props(1, port, tmp.path())).unwrap();
    let socket_path = tmp.path().join("control-1.sock");
    assert!(
        wait_until(Duration::from_secs(10), || socket_path.exists()),
        "control socket never appeared"
    );

    // speak the kernel wire protocol directly, as the front-end does
    let mut stream = UnixStream::connect(&socket_path).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut request = StatusRequest::default();
    request.core_mut().set_id(77);
    request.core_mut().set_phase(Phase::PointToPoint);
    request
        .core_mut()
        .set_principal(Principal::Id(MAIN_KERNEL_ID));
    let mut out = BytesMut::new();
    let at = begin_packet(&mut out);
    encode_kernel(&request, &mut out, false);
    end_packet(&mut out, at);
    stream.write_all(&out).unwrap();

    let types = TypeRegistry::new();
    register_control_types(&types);
    let mut input = BytesMut::new();
    let mut chunk = [0u8; 4096];
    let reply = loop {
        if let Some(packet) = read_packet(&mut input).unwrap() {
            break packet;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "daemon closed the control connection");
        input.extend_from_slice(&chunk[..n]);
    };
    let Decoded::Native(reply) = decode_kernel(&types, 0, None, None, &reply).unwrap() else {
        panic!("expected a native kernel");
    };
    assert_eq!(reply.core().id(), 77);
    assert_eq!(reply.core().phase(), Phase::Downstream);
    let status = reply.downcast_ref::<StatusRequest>().unwrap();
    assert_eq!(status.hierarchies().len(), 1);
    assert_eq!(
        status.hierarchies()[0].socket_address(),
        endpoint(1, port)
    );

    daemon.shutdown();
}
