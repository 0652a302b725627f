//! Readiness and interest sets.

use std::fmt;
use std::ops;

const ACCEPT: usize = 0b001;
const READ: usize = 0b010;
const WRITE: usize = 0b100;

/// A set of readiness event kinds.
///
/// `Ready` doubles as a channel's *interest set* (the kinds it wants the
/// selector to watch for) and as the *readiness* reported for it (the kinds
/// that are currently serviceable). It is a tiny bit set over accept, read
/// and write, with the usual set operations.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ready(usize);

impl Ready {
    /// Returns the empty set.
    pub fn empty() -> Ready {
        Ready(0)
    }

    /// Returns a set containing accept readiness.
    ///
    /// Only listening channels ever report this kind.
    pub fn accept() -> Ready {
        Ready(ACCEPT)
    }

    /// Returns a set containing read readiness.
    pub fn readable() -> Ready {
        Ready(READ)
    }

    /// Returns a set containing write readiness.
    pub fn writable() -> Ready {
        Ready(WRITE)
    }

    /// Returns a set containing every event kind.
    pub fn all() -> Ready {
        Ready(ACCEPT | READ | WRITE)
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the set includes accept readiness.
    pub fn is_accept(&self) -> bool {
        self.contains(Ready::accept())
    }

    /// Returns true if the set includes read readiness.
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    /// Returns true if the set includes write readiness.
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    /// Returns true if `self` is a superset of `other`.
    pub fn contains(&self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Adds all kinds in `other` to `self`.
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    /// Removes all kinds in `other` from `self`.
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0
    }

    pub(crate) fn from_usize(val: usize) -> Ready {
        Ready(val & (ACCEPT | READ | WRITE))
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::accept(), "Accept"),
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true;
            }
        }

        if !one {
            write!(fmt, "(empty)")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Ready;

    #[test]
    fn set_algebra() {
        let rw = Ready::readable() | Ready::writable();
        assert!(rw.is_readable());
        assert!(rw.is_writable());
        assert!(!rw.is_accept());
        assert!(rw.contains(Ready::readable()));
        assert!(!rw.contains(Ready::all()));

        assert_eq!(rw - Ready::writable(), Ready::readable());
        assert_eq!(rw & Ready::writable(), Ready::writable());
        assert!((rw - rw).is_empty());
    }

    #[test]
    fn insert_and_remove() {
        let mut ready = Ready::empty();
        ready.insert(Ready::accept());
        assert!(ready.is_accept());
        ready.remove(Ready::accept());
        assert!(ready.is_empty());
    }

    #[test]
    fn usize_round_trip() {
        for set in [Ready::empty(), Ready::accept(), Ready::all()] {
            assert_eq!(Ready::from_usize(set.as_usize()), set);
        }
        // Out-of-range bits are dropped.
        assert_eq!(Ready::from_usize(usize::MAX), Ready::all());
    }
}
