// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Weighted round-robin over the connected peers. The cursor walks the
//! ordered client map; each peer gets as many consecutive sends as its
//! weight (nodes behind it in the hierarchy) before the cursor moves
//! on. `None` is the end position: with `use_localhost` it is the local
//! node's turn in the rotation.

use kernel::SocketAddress;
use std::collections::BTreeMap;
use std::ops::Bound;

/// What the scheduler needs to know about one candidate peer.
pub(crate) struct Candidate {
    pub(crate) weight: u64,
    pub(crate) started: bool,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    cursor: Option<SocketAddress>,
    count: u64,
}

impl Scheduler {
    pub(crate) fn end_reached(&self) -> bool {
        self.cursor.is_none()
    }

    pub(crate) fn current(&self) -> Option<&SocketAddress> {
        self.cursor.as_ref()
    }

    pub(crate) fn reset<T>(&mut self, clients: &BTreeMap<SocketAddress, T>) {
        self.cursor = clients.keys().next().cloned();
        self.count = 0;
    }

    /// The peer under the cursor vanished; move off it.
    pub(crate) fn on_remove<T>(
        &mut self,
        gone: &SocketAddress,
        clients: &BTreeMap<SocketAddress, T>,
        lookup: impl Fn(&SocketAddress) -> Option<Candidate>,
        use_localhost: bool,
    ) {
        if self.cursor.as_ref() == Some(gone) {
            self.advance(clients, lookup, use_localhost);
            if self.cursor.as_ref() == Some(gone) {
                self.cursor = None;
                self.count = 0;
            }
        }
    }

    /// Step the rotation after a send. Stopped and still-starting peers
    /// are skipped.
    pub(crate) fn advance<T>(
        &mut self,
        clients: &BTreeMap<SocketAddress, T>,
        lookup: impl Fn(&SocketAddress) -> Option<Candidate>,
        use_localhost: bool,
    ) {
        if clients.is_empty() {
            self.cursor = None;
            self.count = 0;
            return;
        }
        let origin = self.cursor.clone();
        loop {
            match self.cursor.clone() {
                None => {
                    self.cursor = clients.keys().next().cloned();
                    self.count = 0;
                }
                Some(cur) => {
                    let weight = lookup(&cur).map_or(0, |c| c.weight).max(1);
                    if self.count + 1 < weight {
                        self.count += 1;
                    } else {
                        self.cursor = clients
                            .range((Bound::Excluded(cur), Bound::Unbounded))
                            .next()
                            .map(|(k, _)| k.clone());
                        self.count = 0;
                    }
                }
            }
            if use_localhost && self.cursor.is_none() {
                break;
            }
            if let Some(cur) = &self.cursor {
                if lookup(cur).is_some_and(|c| c.started) {
                    break;
                }
            }
            if self.cursor == origin {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddrV4;

    fn addr(last: u8) -> SocketAddress {
        SocketAddress::Ipv4(SocketAddrV4::new([10, 0, 0, last].into(), 33333))
    }

    fn run_rotation(weights: &[(u8, u64)], sends: usize) -> HashMap<SocketAddress, usize> {
        let clients: BTreeMap<SocketAddress, ()> =
            weights.iter().map(|(a, _)| (addr(*a), ())).collect();
        let table: HashMap<SocketAddress, u64> =
            weights.iter().map(|(a, w)| (addr(*a), *w)).collect();
        let lookup = |a: &SocketAddress| {
            table.get(a).map(|w| Candidate {
                weight: *w,
                started: true,
            })
        };
        let mut sched = Scheduler::default();
        sched.reset(&clients);
        let mut counts: HashMap<SocketAddress, usize> = HashMap::new();
        for _ in 0..sends {
            let target = sched.current().cloned().expect("a live candidate");
            *counts.entry(target).or_default() += 1;
            sched.advance(&clients, lookup, false);
        }
        counts
    }

    #[test]
    fn dispatch_ratio_follows_weights() {
        // peers with weight 3 and 1: expected 3:1 across 100 sends, ±1
        let counts = run_rotation(&[(1, 3), (3, 1)], 100);
        let heavy = counts[&addr(1)] as i64;
        let light = counts[&addr(3)] as i64;
        assert!((heavy - 75).abs() <= 1, "heavy got {heavy}");
        assert!((light - 25).abs() <= 1, "light got {light}");
    }

    #[test]
    fn equal_weights_alternate() {
        let counts = run_rotation(&[(1, 1), (2, 1)], 10);
        assert_eq!(counts[&addr(1)], 5);
        assert_eq!(counts[&addr(2)], 5);
    }

    #[test]
    fn stopped_peers_are_skipped() {
        let clients: BTreeMap<SocketAddress, ()> =
            [(addr(1), ()), (addr(2), ())].into_iter().collect();
        let lookup = |a: &SocketAddress| {
            Some(Candidate {
                weight: 1,
                started: *a == addr(2),
            })
        };
        let mut sched = Scheduler::default();
        sched.reset(&clients);
        if sched.current() == Some(&addr(1)) {
            sched.advance(&clients, lookup, false);
        }
        for _ in 0..5 {
            assert_eq!(sched.current(), Some(&addr(2)));
            sched.advance(&clients, lookup, false);
        }
    }
}
