// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Positions in the overlay tree.
//!
//! Nodes are numbered in breadth-first order: the root is linear
//! position 0, layer `l` starts at `(F^l - 1)/(F - 1)` and holds `F^l`
//! positions. Fanout 1 degenerates to a chain. The arithmetic uses the
//! recurrence `start(l+1) = start(l)·F + 1` so no powers are
//! materialised.

/// A `(layer, offset)` pair for a fixed fanout.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PositionInTree {
    layer: u32,
    offset: u64,
    fanout: u64,
}

impl PositionInTree {
    #[must_use]
    pub fn new(layer: u32, offset: u64, fanout: u64) -> Self {
        let fanout = fanout.max(1);
        Self {
            layer,
            offset,
            fanout,
        }
    }

    /// Position of linear index `linear` in a tree of the given fanout.
    #[must_use]
    pub fn from_linear(linear: u64, fanout: u64) -> Self {
        let fanout = fanout.max(1);
        if fanout == 1 {
            // a chain: one node per layer
            return Self {
                layer: u32::try_from(linear).unwrap_or(u32::MAX),
                offset: 0,
                fanout,
            };
        }
        let mut layer = 0u32;
        let mut start = 0u64; // first linear index of `layer`
        let mut size = 1u64; // F^layer
        loop {
            let next_start = start.saturating_mul(fanout).saturating_add(1);
            if linear < next_start {
                return Self {
                    layer,
                    offset: linear - start,
                    fanout,
                };
            }
            layer += 1;
            start = next_start;
            size = size.saturating_mul(fanout);
            if size == u64::MAX {
                return Self {
                    layer,
                    offset: linear.saturating_sub(start),
                    fanout,
                };
            }
        }
    }

    /// Linear index of this position.
    #[must_use]
    pub fn to_linear(self) -> u64 {
        if self.fanout == 1 {
            return u64::from(self.layer);
        }
        let mut start = 0u64;
        for _ in 0..self.layer {
            start = start.saturating_mul(self.fanout).saturating_add(1);
        }
        start.saturating_add(self.offset)
    }

    #[must_use]
    pub fn layer(&self) -> u32 {
        self.layer
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.layer == 0
    }

    /// Number of positions in this layer.
    #[must_use]
    pub fn layer_size(&self) -> u64 {
        if self.fanout == 1 {
            return 1;
        }
        let mut size = 1u64;
        for _ in 0..self.layer {
            size = size.saturating_mul(self.fanout);
        }
        size
    }

    #[must_use]
    pub fn parent(&self) -> Option<PositionInTree> {
        if self.layer == 0 {
            return None;
        }
        Some(PositionInTree {
            layer: self.layer - 1,
            offset: self.offset / self.fanout,
            fanout: self.fanout,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn breadth_first_numbering_fanout2() {
        // layers: [0], [1,2], [3..6], [7..14]
        let expect = [
            (0, 0, 0),
            (1, 1, 0),
            (2, 1, 1),
            (3, 2, 0),
            (6, 2, 3),
            (7, 3, 0),
        ];
        for (linear, layer, offset) in expect {
            let p = PositionInTree::from_linear(linear, 2);
            assert_eq!((p.layer(), p.offset()), (layer, offset), "linear {linear}");
            assert_eq!(p.to_linear(), linear);
        }
    }

    #[test]
    fn parent_divides_offset_by_fanout() {
        let p = PositionInTree::from_linear(11, 3); // layer 2, offset 7
        assert_eq!((p.layer(), p.offset()), (2, 7));
        let parent = p.parent().unwrap();
        assert_eq!((parent.layer(), parent.offset()), (1, 2));
        assert!(parent.parent().unwrap().is_root());
    }

    #[test]
    fn fanout_one_is_a_chain() {
        let p = PositionInTree::from_linear(5, 1);
        assert_eq!((p.layer(), p.offset()), (5, 0));
        assert_eq!(p.parent().unwrap().layer(), 4);
        assert_eq!(p.layer_size(), 1);
    }
}
