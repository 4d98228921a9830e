//! Nanosecond-precision ID minting
//!
//! Entity IDs are `{prefix}_{nanos}_{rand}` where the nanos component is
//! strictly increasing within the process and the random suffix carries at
//! least 32 bits of entropy for cross-process uniqueness. Trace and span IDs
//! follow the OTEL wire shape (32 and 16 lowercase hex chars).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::{AgentId, WorkId};

/// Central minting authority for entity, trace and span IDs.
///
/// One instance per process; all components mint through it so the monotonic
/// clock guarantee holds across concurrent callers.
#[derive(Debug, Default)]
pub struct IdMinter {
    last_nanos: AtomicU64,
}

impl IdMinter {
    pub fn new() -> Self {
        Self {
            last_nanos: AtomicU64::new(0),
        }
    }

    /// Current wall clock in nanoseconds since the epoch.
    pub fn wall_nanos() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Strictly increasing nanosecond value. When the wall clock stalls or
    /// steps backwards, bumps to `prev + 1` to preserve ordering.
    fn next_nanos(&self) -> u64 {
        loop {
            let now = Self::wall_nanos();
            let prev = self.last_nanos.load(Ordering::Acquire);
            let candidate = now.max(prev + 1);
            if self
                .last_nanos
                .compare_exchange(prev, candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Mint `{prefix}_{nanos}_{rand}` with an 8-hex-char random suffix.
    pub fn mint(&self, prefix: &str) -> String {
        let nanos = self.next_nanos();
        let rand = Uuid::new_v4().simple().to_string();
        format!("{}_{}_{}", prefix, nanos, &rand[..8])
    }

    pub fn mint_agent_id(&self) -> AgentId {
        AgentId(self.mint("agent"))
    }

    pub fn mint_work_id(&self) -> WorkId {
        WorkId(self.mint("work"))
    }

    /// 32 lowercase hex chars, cryptographically random.
    pub fn trace_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// 16 lowercase hex chars, cryptographically random.
    pub fn span_id(&self) -> String {
        Uuid::new_v4().simple().to_string()[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn minted_nanos_are_strictly_increasing() {
        let minter = IdMinter::new();
        let mut prev = 0u64;
        for _ in 0..10_000 {
            let id = minter.mint("work");
            let nanos: u64 = id.split('_').nth(1).unwrap().parse().unwrap();
            assert!(nanos > prev, "nanos must strictly increase");
            prev = nanos;
        }
    }

    #[test]
    fn concurrent_mints_are_pairwise_distinct() {
        // 10 000 concurrent mints across 16 threads, all unique.
        let minter = Arc::new(IdMinter::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let minter = minter.clone();
            handles.push(std::thread::spawn(move || {
                (0..625).map(|_| minter.mint("work")).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate minted ID");
            }
        }
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn trace_and_span_ids_have_otel_shape() {
        let minter = IdMinter::new();
        let trace = minter.trace_id();
        let span = minter.span_id();
        assert_eq!(trace.len(), 32);
        assert_eq!(span.len(), 16);
        assert!(trace.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(span.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn entity_id_prefixes() {
        let minter = IdMinter::new();
        assert!(minter.mint_agent_id().0.starts_with("agent_"));
        assert!(minter.mint_work_id().0.starts_with("work_"));
    }

    proptest::proptest! {
        #[test]
        fn minted_ids_keep_their_shape(prefix in "[a-z]{1,12}") {
            let minter = IdMinter::new();
            let id = minter.mint(&prefix);
            let mut parts = id.splitn(3, '_');
            proptest::prop_assert_eq!(parts.next().unwrap(), prefix.as_str());
            let nanos: u64 = parts.next().unwrap().parse().unwrap();
            proptest::prop_assert!(nanos > 0);
            let suffix = parts.next().unwrap();
            proptest::prop_assert_eq!(suffix.len(), 8);
            proptest::prop_assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
