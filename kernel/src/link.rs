// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The per-peer link protocol shared by TCP connections and
//! child-process pipes: framing, the upstream/downstream kernel buffers,
//! parent plugging for returning kernels, and recovery when the peer
//! goes away.

use crate::codec::{Decoded, ForeignKernel, decode_kernel, encode_kernel};
use crate::fabric::Pipeline;
use crate::frame::{begin_packet, end_packet, read_packet};
use crate::ids::IdGenerator;
use crate::kernel::{Kernel, KernelPtr, ParentLink, Principal, ReturnCode};
use crate::registry::{InstanceRegistry, TypeRegistry};
use crate::wire::WireError;
use crate::SocketAddress;
use bitflags::bitflags;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

bitflags! {
    /// Buffering behaviour of one link.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct LinkFlags: u8 {
        /// Keep sent upstream/point-to-point kernels until their
        /// downstream counterpart returns.
        const SAVE_UPSTREAM = 0x1;
        /// Keep sent downstream kernels that carry their parent until
        /// the peer acknowledges by closing cleanly.
        const SAVE_DOWNSTREAM = 0x2;
        /// Write source and destination into every header.
        const PREPEND_SOURCE_AND_DESTINATION = 0x4;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("downstream kernel without an id")]
    MissingId,
    #[error("kernel {0} is already plugged to its parent")]
    AlreadyPlugged(u64),
    #[error("no parent found for kernel {0}")]
    ParentNotFound(u64),
}

/// Collaborators a link routes into.
#[derive(Clone)]
pub struct LinkEnv {
    /// The local worker pipeline of this process.
    pub native: Arc<dyn Pipeline>,
    /// The pipeline towards peer daemons (recovery re-schedules here).
    pub remote: Arc<dyn Pipeline>,
    /// Where foreign kernels go (the process pipeline on a daemon's TCP
    /// links, the socket pipeline on its child-process links).
    pub foreign: Arc<dyn Pipeline>,
    pub types: Arc<TypeRegistry>,
    pub instances: Arc<InstanceRegistry>,
    pub ids: Arc<IdGenerator>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SaveClass {
    Upstream,
    Downstream,
    Discard,
}

/// Buffer entry description for pipeline-status snapshots.
#[derive(Debug, Clone)]
pub struct BufferedKernel {
    pub id: u64,
    pub wire_type: u16,
    pub source_application: u64,
    pub target_application: u64,
    pub source: Option<SocketAddress>,
    pub destination: Option<SocketAddress>,
}

/// State dump of one connection for `pipeline-status`.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub address: SocketAddress,
    pub state: &'static str,
    pub weight: u64,
    pub upstream: Vec<BufferedKernel>,
    pub downstream: Vec<BufferedKernel>,
}

/// State dump of one pipeline's connection set.
#[derive(Debug, Clone, Default)]
pub struct PipelineSnapshot {
    pub name: String,
    pub connections: Vec<ConnectionSnapshot>,
}

/// Framing and buffering state of one peer link.
pub struct Link {
    peer: Option<SocketAddress>,
    this_application: u64,
    from_application: Option<u64>,
    flags: LinkFlags,
    upstream: VecDeque<KernelPtr>,
    downstream: VecDeque<KernelPtr>,
    env: LinkEnv,
}

impl Link {
    #[must_use]
    pub fn new(env: LinkEnv, this_application: u64, flags: LinkFlags) -> Self {
        Self {
            peer: None,
            this_application,
            from_application: None,
            flags,
            upstream: VecDeque::new(),
            downstream: VecDeque::new(),
            env,
        }
    }

    pub fn set_peer(&mut self, peer: Option<SocketAddress>) {
        self.peer = peer;
    }

    #[must_use]
    pub fn peer(&self) -> Option<&SocketAddress> {
        self.peer.as_ref()
    }

    /// On child-process links, the application the peer runs as;
    /// received headers are stamped with it.
    pub fn set_from_application(&mut self, app: Option<u64>) {
        self.from_application = app;
    }

    #[must_use]
    pub fn upstream_len(&self) -> usize {
        self.upstream.len()
    }

    #[must_use]
    pub fn downstream_len(&self) -> usize {
        self.downstream.len()
    }

    /// Serialise a kernel onto this link, buffering it according to its
    /// phase so the reply can be correlated or the loss recovered.
    pub fn send(&mut self, mut k: KernelPtr, out: &mut BytesMut) {
        // a downstream kernel with no destination belongs to this node
        if k.core().moves_downstream() && k.core().destination().is_none() {
            if k.core().carries_parent() {
                // stale wire copy; the live parent sits in our buffer
                let _ = k.core_mut().take_parent();
            }
            if k.core().parent().is_none() {
                if let Err(err) = self.plug_parent(&mut k) {
                    warn!(id = k.core().id(), %err, "local return could not be plugged");
                }
            }
            self.env.native.send(k);
            return;
        }
        let class = self.save_class(k.as_ref());
        if class == SaveClass::Upstream && !k.core().is_foreign() {
            let core = k.core_mut();
            core.ensure_id(&self.env.ids);
            if let ParentLink::Owned(parent) = core.parent_mut() {
                parent.core_mut().ensure_id(&self.env.ids);
            }
        }
        self.write_kernel(k.as_ref(), out);
        match class {
            SaveClass::Upstream => self.upstream.push_back(k),
            SaveClass::Downstream => self.downstream.push_back(k),
            SaveClass::Discard => {}
        }
    }

    /// Serialise a foreign kernel, preserving its header and payload
    /// bytes.
    pub fn forward(&mut self, fk: Box<ForeignKernel>, out: &mut BytesMut) {
        let class = self.save_class(fk.as_ref());
        self.write_kernel(fk.as_ref(), out);
        match class {
            SaveClass::Upstream => self.upstream.push_back(fk),
            SaveClass::Downstream => self.downstream.push_back(fk),
            SaveClass::Discard => {}
        }
    }

    /// Drain complete packets from `input`, dispatching each kernel.
    /// Replies produced while receiving (bounces) are written to `out`.
    /// Framing errors are fatal for the link; per-packet decode errors
    /// are logged and skipped.
    pub fn receive(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<usize, WireError> {
        let mut received = 0;
        while let Some(packet) = read_packet(input)? {
            received += 1;
            match decode_kernel(
                &self.env.types,
                self.this_application,
                self.peer.as_ref(),
                self.from_application,
                &packet,
            ) {
                Ok(decoded) => self.receive_one(decoded, out),
                Err(err) => warn!(%err, "discarding undecodable packet"),
            }
        }
        Ok(received)
    }

    fn receive_one(&mut self, decoded: Decoded, out: &mut BytesMut) {
        match decoded {
            Decoded::Foreign(fk) => {
                debug!(
                    id = fk.core().id(),
                    application = fk.header().application,
                    "forwarding foreign kernel"
                );
                self.env.foreign.forward_foreign(fk);
            }
            Decoded::Native(mut k) => {
                if k.core().moves_downstream() {
                    match self.plug_parent(&mut k) {
                        Ok(()) => self.env.native.send(k),
                        Err(err) => {
                            warn!(id = k.core().id(), %err, "dropping downstream kernel");
                        }
                    }
                } else if let Principal::Id(pid) = k.core().principal() {
                    let pid = *pid;
                    match self.env.instances.get(pid) {
                        Some(inst) => {
                            k.core_mut().set_principal(Principal::Instance(inst));
                            self.env.native.send(k);
                        }
                        None => {
                            debug!(id = k.core().id(), principal = pid, "no principal found");
                            self.bounce(k, out);
                        }
                    }
                } else {
                    self.env.native.send(k);
                }
            }
        }
    }

    /// Return a kernel to its sender with `no-principal-found`.
    fn bounce(&mut self, mut k: KernelPtr, out: &mut BytesMut) {
        let source = k.core().source().cloned();
        let core = k.core_mut();
        core.set_destination(source);
        core.set_source(None);
        core.set_principal(Principal::None);
        core.return_to_parent(ReturnCode::NoPrincipalFound);
        self.write_kernel(k.as_ref(), out);
    }

    /// Transplant the parent of the matching upstream entry onto a
    /// returning kernel. Exactly once per kernel: a second application
    /// is an error, which guards against duplicate delivery.
    pub fn plug_parent(&mut self, k: &mut KernelPtr) -> Result<(), LinkError> {
        if !k.core().has_id() {
            return Err(LinkError::MissingId);
        }
        let id = k.core().id();
        if matches!(k.core().parent(), ParentLink::Id(_)) {
            return Err(LinkError::AlreadyPlugged(id));
        }
        if let Some(pos) = self.find(&self.upstream, id) {
            let mut saved = self
                .upstream
                .remove(pos)
                .unwrap_or_else(|| unreachable!("index from position()"));
            let parent = saved.core_mut().take_parent();
            k.core_mut().set_parent(parent);
            Ok(())
        } else if k.core().carries_parent() {
            // the parent travelled with the kernel; drop our stale
            // downstream copy so it is not recovered twice
            if let Some(pos) = self.find(&self.downstream, id) {
                self.downstream.remove(pos);
            }
            Ok(())
        } else {
            Err(LinkError::ParentNotFound(id))
        }
    }

    /// Re-route every buffered kernel after the peer went away. The
    /// downstream buffer is recovered only on error close: an orderly
    /// close means the peer acknowledged everything in flight.
    pub fn recover(&mut self, downstream_too: bool) {
        debug!(
            upstream = self.upstream.len(),
            downstream = self.downstream.len(),
            downstream_too,
            "recovering buffered kernels"
        );
        let mut drained: Vec<KernelPtr> = self.upstream.drain(..).collect();
        if downstream_too {
            drained.extend(self.downstream.drain(..));
        }
        for k in drained {
            self.recover_kernel(k);
        }
    }

    fn recover_kernel(&mut self, mut k: KernelPtr) {
        let foreign = k.core().is_foreign();
        if k.core().moves_upstream() && k.core().destination().is_none() {
            // no fixed destination: reschedule on another peer
            if foreign {
                self.forward_or_warn(k, |env| env.remote.clone());
            } else {
                self.env.remote.send(k);
            }
        } else if k.core().moves_somewhere()
            || (k.core().moves_upstream() && k.core().destination().is_some())
        {
            // the endpoint is gone; let the parent observe the failure
            let dest = k.core().destination().cloned();
            let core = k.core_mut();
            core.set_source(dest);
            core.return_to_parent(ReturnCode::EndpointNotConnected);
            core.set_destination(None);
            if foreign {
                self.forward_or_warn(k, |env| env.foreign.clone());
            } else {
                self.env.native.send(k);
            }
        } else if k.core().moves_downstream() && k.core().carries_parent() {
            // re-activate the orphaned parent locally
            if foreign {
                self.forward_or_warn(k, |env| env.foreign.clone());
            } else {
                self.env.native.send(k);
            }
        } else {
            debug!(id = k.core().id(), "dropping unrecoverable kernel");
        }
    }

    fn forward_or_warn(&self, k: KernelPtr, pick: impl Fn(&LinkEnv) -> Arc<dyn Pipeline>) {
        match k.downcast::<ForeignKernel>() {
            Ok(fk) => pick(&self.env).forward_foreign(fk),
            Err(k) => warn!(id = k.core().id(), "foreign-marked kernel of native type"),
        }
    }

    /// Discard buffered kernels belonging to the listed applications.
    pub fn purge_applications(&mut self, ids: &[u64]) {
        self.upstream
            .retain(|k| !ids.contains(&k.core().target_application()));
        self.downstream
            .retain(|k| !ids.contains(&k.core().target_application()));
    }

    #[must_use]
    pub fn upstream_entries(&self) -> Vec<BufferedKernel> {
        self.upstream.iter().map(|k| Self::describe(k.as_ref())).collect()
    }

    #[must_use]
    pub fn downstream_entries(&self) -> Vec<BufferedKernel> {
        self.downstream.iter().map(|k| Self::describe(k.as_ref())).collect()
    }

    fn describe(k: &dyn Kernel) -> BufferedKernel {
        BufferedKernel {
            id: k.core().id(),
            wire_type: k.wire_type(),
            source_application: k.core().source_application(),
            target_application: k.core().target_application(),
            source: k.core().source().cloned(),
            destination: k.core().destination().cloned(),
        }
    }

    fn find(&self, queue: &VecDeque<KernelPtr>, id: u64) -> Option<usize> {
        queue.iter().position(|k| k.core().id() == id)
    }

    fn save_class(&self, k: &dyn Kernel) -> SaveClass {
        let core = k.core();
        if self.flags.contains(LinkFlags::SAVE_UPSTREAM)
            && (core.moves_upstream() || core.moves_somewhere())
        {
            SaveClass::Upstream
        } else if self.flags.contains(LinkFlags::SAVE_DOWNSTREAM)
            && core.moves_downstream()
            && (core.carries_parent()
                || (core.is_foreign()
                    && core.flags().contains(crate::KernelFlags::CARRIES_PARENT)))
        {
            SaveClass::Downstream
        } else {
            // broadcast kernels are never saved; everything else has
            // already been serialised and is simply dropped
            SaveClass::Discard
        }
    }

    fn write_kernel(&self, k: &dyn Kernel, out: &mut BytesMut) {
        let at = begin_packet(out);
        encode_kernel(
            k,
            out,
            self.flags
                .contains(LinkFlags::PREPEND_SOURCE_AND_DESTINATION),
        );
        end_packet(out, at);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::{KernelCore, Phase};
    use crate::wire::{Decoder, Encoder};
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Ping {
        core: KernelCore,
        payload: u64,
    }

    impl Kernel for Ping {
        fn core(&self) -> &KernelCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut KernelCore {
            &mut self.core
        }

        fn wire_type(&self) -> u16 {
            21
        }

        fn encode(&self, enc: &mut Encoder<'_>) {
            enc.put_u64(self.payload);
        }
    }

    fn decode_ping(dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
        Ok(Box::new(Ping {
            core: KernelCore::default(),
            payload: dec.get_u64()?,
        }))
    }

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<KernelPtr>>,
        foreign: Mutex<Vec<Box<ForeignKernel>>>,
    }

    impl Pipeline for Capture {
        fn send(&self, k: KernelPtr) {
            self.sent.lock().push(k);
        }

        fn forward_foreign(&self, fk: Box<ForeignKernel>) {
            self.foreign.lock().push(fk);
        }
    }

    struct Rig {
        native: Arc<Capture>,
        remote: Arc<Capture>,
        env: LinkEnv,
    }

    fn rig() -> Rig {
        let native = Arc::new(Capture::default());
        let remote = Arc::new(Capture::default());
        let types = Arc::new(TypeRegistry::new());
        types.register(21, decode_ping).unwrap();
        let env = LinkEnv {
            native: native.clone(),
            remote: remote.clone(),
            foreign: Arc::new(Capture::default()),
            types,
            instances: Arc::new(InstanceRegistry::new()),
            ids: Arc::new(IdGenerator::unbounded()),
        };
        Rig {
            native,
            remote,
            env,
        }
    }

    fn link(env: &LinkEnv) -> Link {
        Link::new(
            env.clone(),
            0,
            LinkFlags::SAVE_UPSTREAM | LinkFlags::SAVE_DOWNSTREAM,
        )
    }

    fn upstream_ping(payload: u64) -> KernelPtr {
        let mut k = Box::new(Ping {
            core: KernelCore::default(),
            payload,
        });
        k.core_mut().set_phase(Phase::Upstream);
        k
    }

    #[test]
    fn sent_upstream_kernels_are_buffered_with_ids() {
        let rig = rig();
        let mut link = link(&rig.env);
        let mut out = BytesMut::new();
        link.send(upstream_ping(7), &mut out);
        assert_eq!(link.upstream_len(), 1);
        assert!(!out.is_empty());
        let entry = &link.upstream_entries()[0];
        assert_ne!(entry.id, 0);
    }

    #[test]
    fn reply_plugs_parent_and_reaches_native_pipeline() {
        let rig = rig();
        // sender side: a child adopted by a suspended parent
        let mut sender = link(&rig.env);
        sender.set_peer(Some(SocketAddress::Ipv4("10.0.0.2:33333".parse().unwrap())));
        let mut parent_core = KernelCore::default();
        let mut child = upstream_ping(3);
        parent_core.adopt(&rig.env.ids, child.core_mut());
        let parent_id = parent_core.id();
        let mut a_to_b = BytesMut::new();
        sender.send(child, &mut a_to_b);

        // receiver side executes the kernel and turns it around
        let mut receiver = link(&rig.env);
        receiver.set_peer(Some(SocketAddress::Ipv4("10.0.0.1:33333".parse().unwrap())));
        let mut b_out = BytesMut::new();
        receiver.receive(&mut a_to_b, &mut b_out).unwrap();
        let mut k = rig.native.sent.lock().pop().unwrap();
        k.core_mut().return_to_parent(ReturnCode::Success);
        let dest = k.core().source().cloned();
        k.core_mut().set_destination(dest);
        k.core_mut().set_source(None);
        let mut b_to_a = BytesMut::new();
        receiver.send(k, &mut b_to_a);

        // back on the sender, the reply is plugged to its parent
        let mut a_out = BytesMut::new();
        sender.receive(&mut b_to_a, &mut a_out).unwrap();
        assert_eq!(sender.upstream_len(), 0);
        let reply = rig.native.sent.lock().pop().unwrap();
        assert_eq!(reply.core().return_code(), ReturnCode::Success);
        match reply.core().parent() {
            ParentLink::Id(id) => assert_eq!(*id, parent_id),
            other => panic!("expected plugged parent id, got {other:?}"),
        }
    }

    #[test]
    fn plugging_twice_is_an_error() {
        let rig = rig();
        let mut link = link(&rig.env);
        let mut out = BytesMut::new();
        let mut parent_core = KernelCore::default();
        let mut child = upstream_ping(1);
        parent_core.adopt(&rig.env.ids, child.core_mut());
        link.send(child, &mut out);
        let id = link.upstream_entries()[0].id;

        let mut reply: KernelPtr = upstream_ping(1);
        reply.core_mut().set_id(id);
        reply.core_mut().set_phase(Phase::Downstream);
        link.plug_parent(&mut reply).unwrap();
        assert!(matches!(
            link.plug_parent(&mut reply),
            Err(LinkError::AlreadyPlugged(_))
        ));
    }

    #[test]
    fn unmatched_reply_without_parent_is_rejected() {
        let rig = rig();
        let mut link = link(&rig.env);
        let mut reply: KernelPtr = upstream_ping(1);
        reply.core_mut().set_id(1234);
        reply.core_mut().set_phase(Phase::Downstream);
        assert!(matches!(
            link.plug_parent(&mut reply),
            Err(LinkError::ParentNotFound(1234))
        ));
    }

    #[test]
    fn no_kernel_sits_in_both_buffers() {
        let rig = rig();
        let mut link = link(&rig.env);
        let mut out = BytesMut::new();
        link.send(upstream_ping(1), &mut out);

        let mut down: KernelPtr = upstream_ping(2);
        down.core_mut().set_phase(Phase::Downstream);
        down.core_mut()
            .set_destination(Some(SocketAddress::Ipv4("10.0.0.9:33333".parse().unwrap())));
        let parent: KernelPtr = upstream_ping(9);
        KernelCore::give_parent(down.core_mut(), parent);
        link.send(down, &mut out);

        let up: Vec<u64> = link.upstream_entries().iter().map(|e| e.id).collect();
        let dn: Vec<u64> = link.downstream_entries().iter().map(|e| e.id).collect();
        assert!(up.iter().all(|id| !dn.contains(id)));
        assert_eq!(link.upstream_len(), 1);
        assert_eq!(link.downstream_len(), 1);
    }

    #[test]
    fn recovery_reroutes_by_destination() {
        let rig = rig();
        let mut link = link(&rig.env);
        let mut out = BytesMut::new();

        // upstream, no destination: reschedules on the remote pipeline
        link.send(upstream_ping(1), &mut out);

        // point-to-point with a destination: parent observes the failure
        let mut p2p = upstream_ping(2);
        p2p.core_mut().set_phase(Phase::PointToPoint);
        p2p.core_mut()
            .set_destination(Some(SocketAddress::Ipv4("10.0.0.3:33333".parse().unwrap())));
        link.send(p2p, &mut out);

        link.recover(true);
        assert_eq!(rig.remote.sent.lock().len(), 1);
        let failed = rig.native.sent.lock().pop().unwrap();
        assert_eq!(failed.core().return_code(), ReturnCode::EndpointNotConnected);
        assert_eq!(
            failed.core().source().unwrap().to_string(),
            "10.0.0.3:33333"
        );
    }

    #[test]
    fn purge_drops_application_kernels() {
        let rig = rig();
        let mut link = link(&rig.env);
        let mut out = BytesMut::new();
        let mut k = upstream_ping(1);
        k.core_mut().set_target_application(42);
        link.send(k, &mut out);
        link.send(upstream_ping(2), &mut out);
        assert_eq!(link.upstream_len(), 2);
        link.purge_applications(&[42]);
        assert_eq!(link.upstream_len(), 1);
    }
}
