//! Wrapping port counter.

use std::collections::HashSet;

/// Hands out ports in `[base, 65535]`, wrapping back to `base`.
///
/// Owned by the queue consumer; never shared.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base: u16,
    next: u16,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self { base, next: base }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Next port not in `live`, or `None` when the whole range is live.
    pub fn allocate(&mut self, live: &HashSet<u16>) -> Option<u16> {
        let span = u32::from(u16::MAX - self.base) + 1;
        for _ in 0..span {
            let candidate = self.next;
            self.next = if candidate == u16::MAX {
                self.base
            } else {
                candidate + 1
            };
            if !live.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
