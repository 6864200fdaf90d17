use std::num::NonZeroU8;
use std::ops::BitOr;

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const PRIORITY: u8 = 0b0100;

/// The set of readiness conditions a handle is registered to be notified
/// about. Always non-empty: there is no "interested in nothing" value,
/// matching the registration contract in every backend (registering with no
/// interest at all is a caller error, not a no-op).
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Interest(NonZeroU8);

impl Interest {
    pub const READABLE: Interest = Interest(match NonZeroU8::new(READABLE) {
        Some(n) => n,
        None => unreachable!(),
    });
    pub const WRITABLE: Interest = Interest(match NonZeroU8::new(WRITABLE) {
        Some(n) => n,
        None => unreachable!(),
    });
    pub const PRIORITY: Interest = Interest(match NonZeroU8::new(PRIORITY) {
        Some(n) => n,
        None => unreachable!(),
    });

    pub const fn is_readable(self) -> bool {
        self.0.get() & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0.get() & WRITABLE != 0
    }

    pub const fn is_priority(self) -> bool {
        self.0.get() & PRIORITY != 0
    }

    pub const fn add(self, other: Interest) -> Interest {
        self.union(other)
    }

    const fn union(self, other: Interest) -> Interest {
        match NonZeroU8::new(self.0.get() | other.0.get()) {
            Some(n) => Interest(n),
            None => unreachable!(),
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.union(rhs)
    }
}

impl std::fmt::Debug for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.is_readable() {
            parts.push("READABLE");
        }
        if self.is_writable() {
            parts.push("WRITABLE");
        }
        if self.is_priority() {
            parts.push("PRIORITY");
        }
        f.write_str(&parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_combines_flags() {
        let rw = Interest::READABLE | Interest::WRITABLE;
        assert!(rw.is_readable());
        assert!(rw.is_writable());
        assert!(!rw.is_priority());
    }
}
