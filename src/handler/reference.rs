use std::sync::atomic::{AtomicU32, Ordering};

/// Allocator for the 16 bit PDU reference carried in every S7 header.
///
/// References are handed out monotonically in `(0, 0xFFFF]` and wrap back to
/// 1. Zero is reserved for unsolicited alarm indications and is never
/// returned.
#[derive(Debug)]
pub(crate) struct ReferenceId {
    counter: AtomicU32,
}

impl ReferenceId {
    pub(crate) const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    #[cfg(test)]
    fn starting_at(value: u32) -> Self {
        Self {
            counter: AtomicU32::new(value),
        }
    }

    /// Next reference id. The wrap back to 1 is serialised through the
    /// compare-and-swap so no two pending requests can observe the same id.
    pub(crate) fn next(&self) -> u16 {
        let mut current = self.counter.load(Ordering::Relaxed);
        loop {
            let next = if current >= u32::from(u16::MAX) {
                1
            } else {
                current + 1
            };
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next as u16,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotone_and_never_zero() {
        let ids = ReferenceId::new();
        let mut previous = 0;
        for _ in 0..1000 {
            let id = ids.next();
            assert_ne!(id, 0);
            assert!(id > previous);
            previous = id;
        }
    }

    #[test]
    fn wraps_to_one() {
        let ids = ReferenceId::starting_at(u32::from(u16::MAX) - 1);
        assert_eq!(ids.next(), u16::MAX);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn concurrent_allocation_yields_distinct_ids() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let ids = Arc::new(ReferenceId::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ids = Arc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| ids.next()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("worker should not panic") {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
    }
}
