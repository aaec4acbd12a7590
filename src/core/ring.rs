//! Weighted consistent hash ring
//!
//! Every server contributes `weight * points_per_weight` points on a 32-bit
//! continuum. A key belongs to the first point at or after its hash,
//! wrapping to the start of the ring.
use super::{ServerId, ServerSpec};
use fnv::FnvHashSet;

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Sorted by point, then server id
    points: Vec<(u32, ServerId)>,
}

/// Reduce an MD5 digest to a ring position
pub fn hash(data: &[u8]) -> u32 {
    let digest = md5::compute(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl HashRing {
    pub fn build<'a, I>(servers: I, points_per_weight: u32) -> Self
    where
        I: IntoIterator<Item = (ServerId, &'a ServerSpec)>,
    {
        let mut points = Vec::new();
        for (id, spec) in servers {
            let count = spec.weight.saturating_mul(points_per_weight);
            points.reserve(count as usize);
            for i in 0..count {
                let label = format!("{}:{}-{}", spec.host, spec.port, i);
                points.push((hash(label.as_bytes()), id));
            }
        }
        points.sort_unstable();

        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Owner of `key`, regardless of server state
    pub fn lookup(&self, key: &[u8]) -> Option<ServerId> {
        let idx = self.position(hash(key))?;
        Some(self.points[idx].1)
    }

    /// First server clockwise from `key` accepted by `accept`
    pub fn lookup_with<F>(&self, key: &[u8], mut accept: F) -> Option<ServerId>
    where
        F: FnMut(ServerId) -> bool,
    {
        let start = self.position(hash(key))?;
        let mut rejected = FnvHashSet::default();
        for offset in 0..self.points.len() {
            let id = self.points[(start + offset) % self.points.len()].1;
            if rejected.contains(&id) {
                continue;
            }
            if accept(id) {
                return Some(id);
            }
            rejected.insert(id);
        }
        None
    }

    /// Number of points owned by `server`
    pub fn points_for(&self, server: ServerId) -> usize {
        self.points.iter().filter(|(_, id)| *id == server).count()
    }

    fn position(&self, hash: u32) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        Some(if idx == self.points.len() { 0 } else { idx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(count: u16) -> Vec<ServerSpec> {
        (0..count)
            .map(|i| ServerSpec::new("10.0.0.1", 11211 + i))
            .collect()
    }

    fn ring_of(specs: &[ServerSpec]) -> HashRing {
        HashRing::build(
            specs.iter().enumerate().map(|(i, s)| (i as ServerId, s)),
            160,
        )
    }

    fn keys() -> Vec<String> {
        (0..10_000).map(|i| format!("key:{}", i)).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::default();
        assert!(ring.is_empty());
        assert_eq!(ring.lookup(b"anything"), None);
        assert_eq!(ring.lookup_with(b"anything", |_| true), None);
    }

    #[test]
    fn test_points_follow_weight() {
        let servers = vec![
            ServerSpec::new("a", 1),
            ServerSpec::new("b", 1).with_weight(3),
        ];
        let ring = ring_of(&servers);
        assert_eq!(ring.len(), 4 * 160);
        assert_eq!(ring.points_for(0), 160);
        assert_eq!(ring.points_for(1), 480);
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let servers = specs(5);
        let first = ring_of(&servers);
        let second = ring_of(&servers);
        for key in keys() {
            assert_eq!(first.lookup(key.as_bytes()), second.lookup(key.as_bytes()));
        }
    }

    #[test]
    fn test_adding_server_remaps_bounded_share() {
        let before = ring_of(&specs(4));
        let after = ring_of(&specs(5));

        let mut moved = 0;
        for key in keys() {
            let old = before.lookup(key.as_bytes()).unwrap();
            let new = after.lookup(key.as_bytes()).unwrap();
            if old != new {
                assert_eq!(new, 4, "moved keys must land on the new server");
                moved += 1;
            }
        }
        assert!(moved > 0);
        // ideal share is 1/5 of the keys
        assert!(moved < 3_000, "moved {} keys", moved);
    }

    #[test]
    fn test_removing_server_only_remaps_its_keys() {
        let servers = specs(4);
        let before = ring_of(&servers);
        let after = HashRing::build(
            servers
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != 2)
                .map(|(i, s)| (i as ServerId, s)),
            160,
        );

        for key in keys() {
            let old = before.lookup(key.as_bytes()).unwrap();
            let new = after.lookup(key.as_bytes()).unwrap();
            if old != 2 {
                assert_eq!(old, new);
            } else {
                assert_ne!(new, 2);
            }
        }
    }

    #[test]
    fn test_lookup_with_skips_rejected_servers() {
        let ring = ring_of(&specs(3));
        for key in keys().iter().take(500) {
            let owner = ring.lookup(key.as_bytes()).unwrap();
            let fallback = ring.lookup_with(key.as_bytes(), |id| id != owner).unwrap();
            assert_ne!(fallback, owner);
            assert_eq!(ring.lookup_with(key.as_bytes(), |_| true), Some(owner));
        }
        assert_eq!(ring.lookup_with(b"k", |_| false), None);
    }
}
