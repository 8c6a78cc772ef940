// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The per-interface hierarchy record: the optional superior, the
//! subordinate table, and the resource totals flooded through the
//! tree. The record serialises to a small cache file so a restarted
//! daemon reconnects to its last superior immediately.

use ipnet::Ipv4Net;
use kernel::{Decoder, Encoder, ResourceVector, SocketAddress, WireError};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};

/// A remote node as this node sees it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HierarchyNode {
    resources: ResourceVector,
}

impl HierarchyNode {
    #[must_use]
    pub fn new(resources: ResourceVector) -> Self {
        Self { resources }
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceVector {
        &self.resources
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    net: Ipv4Net,
    port: u16,
    resources: ResourceVector,
    superior: Option<(SocketAddress, HierarchyNode)>,
    subordinates: BTreeMap<SocketAddress, HierarchyNode>,
}

impl Hierarchy {
    #[must_use]
    pub fn new(net: Ipv4Net, port: u16) -> Self {
        Self {
            net,
            port,
            resources: ResourceVector::for_node(1),
            superior: None,
            subordinates: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn net(&self) -> Ipv4Net {
        self.net
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// This node's own endpoint.
    #[must_use]
    pub fn socket_address(&self) -> SocketAddress {
        SocketAddress::Ipv4(SocketAddrV4::new(self.net.addr(), self.port))
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceVector {
        &self.resources
    }

    /// Replace this node's own resource vector; true when it changed.
    pub fn set_resources(&mut self, resources: ResourceVector) -> bool {
        if self.resources == resources {
            return false;
        }
        self.resources = resources;
        true
    }

    #[must_use]
    pub fn has_superior(&self) -> bool {
        self.superior.is_some()
    }

    #[must_use]
    pub fn superior_socket_address(&self) -> Option<&SocketAddress> {
        self.superior.as_ref().map(|(a, _)| a)
    }

    #[must_use]
    pub fn superior(&self) -> Option<&(SocketAddress, HierarchyNode)> {
        self.superior.as_ref()
    }

    #[must_use]
    pub fn superior_is(&self, address: &SocketAddress) -> bool {
        self.superior_socket_address() == Some(address)
    }

    /// Adopt a superior; true when the stored entry changed.
    pub fn add_superior(&mut self, address: SocketAddress, node: HierarchyNode) -> bool {
        if self.superior.as_ref() == Some(&(address.clone(), node.clone())) {
            return false;
        }
        self.subordinates.remove(&address);
        self.superior = Some((address, node));
        true
    }

    pub fn remove_superior(&mut self) -> bool {
        self.superior.take().is_some()
    }

    pub fn set_superior_resources(&mut self, resources: ResourceVector) -> bool {
        match &mut self.superior {
            Some((_, node)) if node.resources != resources => {
                node.resources = resources;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn subordinates(&self) -> &BTreeMap<SocketAddress, HierarchyNode> {
        &self.subordinates
    }

    #[must_use]
    pub fn has_subordinate(&self, address: &SocketAddress) -> bool {
        self.subordinates.contains_key(address)
    }

    /// Add a subordinate with a fresh single-node weight; true when it
    /// was not present yet.
    pub fn add_subordinate(&mut self, address: SocketAddress) -> bool {
        if self.subordinates.contains_key(&address) {
            return false;
        }
        self.subordinates
            .insert(address, HierarchyNode::new(ResourceVector::for_node(1)));
        true
    }

    pub fn remove_subordinate(&mut self, address: &SocketAddress) -> bool {
        self.subordinates.remove(address).is_some()
    }

    pub fn set_subordinate_resources(
        &mut self,
        address: &SocketAddress,
        resources: ResourceVector,
    ) -> bool {
        match self.subordinates.get_mut(address) {
            Some(node) if node.resources != resources => {
                node.resources = resources;
                true
            }
            _ => false,
        }
    }

    /// Own weight plus every subordinate's: the size of this subtree.
    #[must_use]
    pub fn total_weight(&self) -> ResourceVector {
        self.subordinates
            .values()
            .fold(self.resources, |acc, n| acc.saturating_add(&n.resources))
    }

    /// Everything this node can see: subtree plus the superior side.
    /// Broadcasts send `total_resources − neighbour` to each neighbour.
    #[must_use]
    pub fn total_resources(&self) -> ResourceVector {
        let mut total = self.total_weight();
        if let Some((_, node)) = &self.superior {
            total = total.saturating_add(&node.resources);
        }
        total
    }

    pub fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_net(self.net);
        enc.put_u16(self.port);
        enc.put_resources(&self.resources);
        match &self.superior {
            Some((address, node)) => {
                enc.put_address(Some(address));
                enc.put_resources(&node.resources);
            }
            None => enc.put_address(None),
        }
        enc.put_u32(self.subordinates.len() as u32);
        for (address, node) in &self.subordinates {
            enc.put_address(Some(address));
            enc.put_resources(&node.resources);
        }
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, WireError> {
        let net = dec.get_net()?;
        let port = dec.get_u16()?;
        let resources = dec.get_resources()?;
        let superior = match dec.get_address()? {
            Some(address) => Some((address, HierarchyNode::new(dec.get_resources()?))),
            None => None,
        };
        let count = dec.get_u32()? as usize;
        let mut subordinates = BTreeMap::new();
        for _ in 0..count {
            let Some(address) = dec.get_address()? else {
                continue;
            };
            subordinates.insert(address, HierarchyNode::new(dec.get_resources()?));
        }
        Ok(Self {
            net,
            port,
            resources,
            superior,
            subordinates,
        })
    }

    /// Cache file name: `<addr>-<prefix>-<port>`.
    #[must_use]
    pub fn cache_filename(&self) -> String {
        format!("{}-{}-{}", self.net.addr(), self.net.prefix_len(), self.port)
    }

    /// Persist the record under `dir` with mode 0600.
    pub fn write_cache(&self, dir: &Path) -> std::io::Result<PathBuf> {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.cache_filename());
        let mut buf = bytes::BytesMut::new();
        self.encode(&mut Encoder::new(&mut buf));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(&buf)?;
        Ok(path)
    }

    /// Load the cached record for this interface, if any.
    pub fn read_cache(net: Ipv4Net, port: u16, dir: &Path) -> std::io::Result<Option<Self>> {
        let path = dir.join(Self::new(net, port).cache_filename());
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        Hierarchy::decode(&mut Decoder::new(&raw))
            .map(Some)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ", self.net, self.port)?;
        match &self.superior {
            Some((address, node)) => write!(f, "superior {address} ({})", node.resources)?,
            None => write!(f, "no superior")?,
        }
        write!(f, ", {} subordinate(s)", self.subordinates.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel::Resource;
    use pretty_assertions::assert_eq;

    fn addr(last: u8) -> SocketAddress {
        SocketAddress::Ipv4(SocketAddrV4::new([10, 0, 0, last].into(), 33333))
    }

    fn hierarchy() -> Hierarchy {
        Hierarchy::new("10.0.0.2/24".parse().unwrap(), 33333)
    }

    #[test]
    fn total_weight_is_self_plus_subordinates() {
        let mut h = hierarchy();
        h.set_resources(ResourceVector::for_node(4));
        assert!(h.add_subordinate(addr(4)));
        assert!(h.add_subordinate(addr(5)));
        let mut sub = ResourceVector::for_node(2);
        sub[Resource::Nodes] = 2;
        assert!(h.set_subordinate_resources(&addr(4), sub));

        let total = h.total_weight();
        assert_eq!(total.nodes(), 1 + 2 + 1);
        // the invariant: subordinate weights + own weight == total
        let sum = h
            .subordinates()
            .values()
            .fold(*h.resources(), |acc, n| acc.saturating_add(n.resources()));
        assert_eq!(sum, total);
    }

    #[test]
    fn superior_counts_only_in_total_resources() {
        let mut h = hierarchy();
        assert!(h.add_superior(addr(1), HierarchyNode::new(ResourceVector::for_node(8))));
        assert_eq!(h.total_weight().nodes(), 1);
        assert_eq!(h.total_resources().nodes(), 2);
    }

    #[test]
    fn duplicate_updates_do_not_report_change() {
        let mut h = hierarchy();
        assert!(h.add_subordinate(addr(4)));
        assert!(!h.add_subordinate(addr(4)));
        assert!(!h.set_subordinate_resources(&addr(4), ResourceVector::for_node(1)));
        assert!(h.add_superior(addr(1), HierarchyNode::default()));
        assert!(!h.add_superior(addr(1), HierarchyNode::default()));
    }

    #[test]
    fn cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = hierarchy();
        h.add_superior(addr(1), HierarchyNode::new(ResourceVector::for_node(3)));
        h.add_subordinate(addr(4));
        let path = h.write_cache(dir.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "10.0.0.2-24-33333"
        );
        let meta = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let got = Hierarchy::read_cache(h.net(), h.port(), dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(got, h);
        assert!(
            Hierarchy::read_cache("10.0.9.9/24".parse().unwrap(), 1, dir.path())
                .unwrap()
                .is_none()
        );
    }
}
