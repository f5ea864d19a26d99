// SPDX-License-Identifier: BSD-3-Clause
//! Lattice of error flags attached to CFG edges
//!
//! The low nibble holds the error-return flags, the high nibble of the low
//! byte the error-handling flags, and bit 8 the completion marker. Merging is
//! bitwise OR followed by normalisation: a `MAY_*` bit is dropped whenever the
//! corresponding `MUST_*` bit is present, so a flag set only ever grows in
//! the lattice order.

use ascent::Lattice;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Serialize)]
pub struct ErrFlags(u16);

impl ErrFlags {
    pub const NONE: ErrFlags = ErrFlags(0);
    pub const MUST_RETURN_ERR: ErrFlags = ErrFlags(1);
    pub const MAY_RETURN_ERR: ErrFlags = ErrFlags(2);
    pub const MUST_HANDLE_ERR: ErrFlags = ErrFlags(16);
    pub const MAY_HANDLE_ERR: ErrFlags = ErrFlags(32);
    pub const COMPLETED: ErrFlags = ErrFlags(256);

    const RETURN_MASK: u16 = 0x000F;
    const HANDLE_MASK: u16 = 0x00F0;

    #[inline]
    pub fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: ErrFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.effective().0 == 0
    }

    #[inline]
    pub fn is_completed(self) -> bool {
        self.contains(Self::COMPLETED)
    }

    #[inline]
    pub fn returns_err(self) -> bool {
        self.0 & Self::RETURN_MASK != 0
    }

    #[inline]
    pub fn handles_err(self) -> bool {
        self.0 & Self::HANDLE_MASK != 0
    }

    fn normalized(bits: u16) -> Self {
        let mut bits = bits;
        if bits & Self::MUST_RETURN_ERR.0 != 0 {
            bits &= !Self::MAY_RETURN_ERR.0;
        }
        if bits & Self::MUST_HANDLE_ERR.0 != 0 {
            bits &= !Self::MAY_HANDLE_ERR.0;
        }
        ErrFlags(bits)
    }

    /// The flags without the completion marker.
    #[inline]
    pub fn effective(self) -> Self {
        ErrFlags(self.0 & !Self::COMPLETED.0)
    }

    /// `MUST_*` becomes `MAY_*`; used when a flag travels to a predecessor
    /// edge.
    pub fn weakened(self) -> Self {
        let mut bits = 0;
        if self.returns_err() {
            bits |= Self::MAY_RETURN_ERR.0;
        }
        if self.handles_err() {
            bits |= Self::MAY_HANDLE_ERR.0;
        }
        ErrFlags::NONE.union(ErrFlags(bits))
    }

    /// Monotone merge. Returns `true` when the flag set grew.
    pub fn merge(&mut self, other: ErrFlags) -> bool {
        let mut merged = Self::normalized(self.0 | other.0);
        // Both classes present: nothing weaker than this can reach an edge
        // through propagation any more.
        if merged.returns_err() && merged.handles_err() {
            merged.0 |= Self::COMPLETED.0;
        }
        let changed = merged.0 != self.0;
        *self = merged;
        changed
    }

    pub fn union(self, other: ErrFlags) -> ErrFlags {
        let mut out = self;
        out.merge(other);
        out
    }
}

impl std::ops::BitOr for ErrFlags {
    type Output = ErrFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// Inclusion order, with `MUST_*` above `MAY_*`. The completion marker
/// counts, so only equal flag sets compare `Equal`.
impl PartialOrd for ErrFlags {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        let le = |a: ErrFlags, b: ErrFlags| a.union(b) == b;
        match (le(*self, *other), le(*other, *self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl std::fmt::Display for ErrFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        for (flag, name) in [
            (Self::MUST_RETURN_ERR, "must-return"),
            (Self::MAY_RETURN_ERR, "may-return"),
            (Self::MUST_HANDLE_ERR, "must-handle"),
            (Self::MAY_HANDLE_ERR, "may-handle"),
            (Self::COMPLETED, "completed"),
        ] {
            if self.contains(flag) {
                parts.push(name);
            }
        }
        if parts.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

impl Lattice for ErrFlags {
    fn meet(self, other: Self) -> Self {
        let a = self.effective();
        let b = other.effective();
        let mut bits = 0;
        for (must, may) in [
            (Self::MUST_RETURN_ERR, Self::MAY_RETURN_ERR),
            (Self::MUST_HANDLE_ERR, Self::MAY_HANDLE_ERR),
        ] {
            if a.contains(must) && b.contains(must) {
                bits |= must.0;
            } else if (a.contains(must) || a.contains(may)) && (b.contains(must) || b.contains(may))
            {
                bits |= may.0;
            }
        }
        ErrFlags::NONE.union(ErrFlags(bits))
    }

    fn join(self, other: Self) -> Self {
        self.union(other)
    }
}

#[cfg(test)]
mod tests {
    use ascent::Lattice;

    use super::ErrFlags;

    #[test]
    fn merge_is_monotone() {
        let mut f = ErrFlags::NONE;
        assert!(f.merge(ErrFlags::MAY_RETURN_ERR));
        assert!(!f.merge(ErrFlags::MAY_RETURN_ERR));
        assert!(f.merge(ErrFlags::MUST_RETURN_ERR));
        assert!(f.contains(ErrFlags::MUST_RETURN_ERR));
        assert!(!f.contains(ErrFlags::MAY_RETURN_ERR));
        // A weaker flag never shrinks a stronger one
        assert!(!f.merge(ErrFlags::MAY_RETURN_ERR));
        assert!(f.contains(ErrFlags::MUST_RETURN_ERR));
    }

    #[test]
    fn completion() {
        let mut f = ErrFlags::MUST_RETURN_ERR;
        assert!(!f.is_completed());
        f.merge(ErrFlags::MAY_HANDLE_ERR);
        assert!(f.is_completed());
        assert!(!f.merge(ErrFlags::MAY_RETURN_ERR));
        assert_eq!(f.weakened(), ErrFlags::MAY_RETURN_ERR | ErrFlags::MAY_HANDLE_ERR);
    }

    #[test]
    fn weaken() {
        assert_eq!(ErrFlags::MUST_RETURN_ERR.weakened(), ErrFlags::MAY_RETURN_ERR);
        assert_eq!(ErrFlags::MUST_HANDLE_ERR.weakened(), ErrFlags::MAY_HANDLE_ERR);
        assert_eq!(ErrFlags::NONE.weakened(), ErrFlags::NONE);
    }

    #[test]
    fn order_agrees_with_equality() {
        use std::cmp::Ordering;

        let plain = ErrFlags::MUST_RETURN_ERR.union(ErrFlags::MAY_HANDLE_ERR);
        let raw = ErrFlags(ErrFlags::MUST_RETURN_ERR.0 | ErrFlags::MAY_HANDLE_ERR.0);
        assert_ne!(plain, raw);
        assert_ne!(plain.partial_cmp(&raw), Some(Ordering::Equal));
        assert!(raw < plain);
        assert_eq!(plain.partial_cmp(&plain), Some(Ordering::Equal));
        assert_eq!(
            ErrFlags::MAY_RETURN_ERR.partial_cmp(&ErrFlags::MAY_HANDLE_ERR),
            None
        );
    }

    #[test]
    fn lattice_laws() {
        let all = [
            ErrFlags::NONE,
            ErrFlags::MAY_RETURN_ERR,
            ErrFlags::MUST_RETURN_ERR,
            ErrFlags::MAY_HANDLE_ERR,
            ErrFlags::MUST_HANDLE_ERR,
            ErrFlags::MUST_RETURN_ERR | ErrFlags::MAY_HANDLE_ERR,
        ];
        for a in all {
            assert_eq!(a.join(a), a.union(ErrFlags::NONE));
            for b in all {
                assert_eq!(a.join(b), b.join(a));
                assert!(a <= a.join(b));
                assert!(a.meet(b) <= a);
            }
        }
    }
}
