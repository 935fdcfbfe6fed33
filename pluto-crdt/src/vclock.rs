use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::CrdtError;

/// Per-replica monotonic counters: `V[p]` counts the messages originated by
/// replica `p`. One entry per peer in the subnet plus self.
///
/// The clock is owned by the receiver task of its link; everybody else
/// requests increments or merges over a channel (see pluto-sync).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<String, u32>,
}

impl VectorClock {
    /// A zeroed clock with one entry per replica name.
    pub fn new<I, S>(replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            counters: replicas.into_iter().map(|n| (n.into(), 0)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> u32 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Increment our own coordinate, returning the new count.
    pub fn inc(&mut self, name: &str) -> u32 {
        let c = self.counters.entry(name.to_string()).or_insert(0);
        *c += 1;
        *c
    }

    /// Coordinate-wise maximum: `V[k] = max(V[k], W[k])`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (name, count) in &other.counters {
            let c = self.counters.entry(name.clone()).or_insert(0);
            *c = (*c).max(*count);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, u32)> {
        self.counters.iter().map(|(n, c)| (n, *c))
    }

    /// Persistence format: `name:num;name:num;…` in name order.
    pub fn encode(&self) -> String {
        self.counters
            .iter()
            .map(|(name, count)| format!("{}:{}", name, count))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn decode(raw: &str) -> Result<Self, CrdtError> {
        let raw = raw.trim();
        let mut counters = BTreeMap::new();
        if raw.is_empty() {
            return Ok(Self { counters });
        }
        for field in raw.split(';') {
            let (name, count) = field
                .split_once(':')
                .ok_or_else(|| CrdtError::BadSnapshot(format!("bad clock entry: {}", field)))?;
            let count: u32 = count
                .parse()
                .map_err(|_| CrdtError::BadSnapshot(format!("bad clock count: {}", field)))?;
            counters.insert(name.to_string(), count);
        }
        Ok(Self { counters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_and_get() {
        let mut v = VectorClock::new(["worker-1", "storage"]);
        assert_eq!(v.get("worker-1"), 0);
        assert_eq!(v.inc("worker-1"), 1);
        assert_eq!(v.inc("worker-1"), 2);
        assert_eq!(v.get("storage"), 0);
        assert_eq!(v.get("unknown"), 0);
    }

    #[test]
    fn merge_is_coordinate_wise_max() {
        let mut a = VectorClock::new(["w", "s"]);
        a.inc("w");
        a.inc("w");

        let mut b = VectorClock::new(["w", "s"]);
        b.inc("s");
        b.inc("w");

        a.merge(&b);
        assert_eq!(a.get("w"), 2);
        assert_eq!(a.get("s"), 1);

        // Merge never decreases any coordinate
        let before = a.clone();
        a.merge(&VectorClock::default());
        assert_eq!(a, before);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut v = VectorClock::new(["worker-1", "storage"]);
        v.inc("worker-1");
        v.inc("worker-1");
        v.inc("storage");

        let encoded = v.encode();
        assert_eq!(encoded, "storage:1;worker-1:2");
        assert_eq!(VectorClock::decode(&encoded).unwrap(), v);
        assert_eq!(VectorClock::decode("").unwrap(), VectorClock::default());
    }
}
