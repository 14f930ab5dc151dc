/*!
 * Descriptor Sets
 * Fixed-size bitsets with the platform `fd_set` layout
 */

use std::fmt;

use crate::core::limits::FD_SETSIZE;
use crate::core::types::VirtualFd;

type Word = libc::c_ulong;

const WORD_BITS: usize = Word::BITS as usize;
const WORDS: usize = FD_SETSIZE / WORD_BITS;

/// Bitset over descriptor values `0..FD_SETSIZE`
///
/// Laid out exactly like the platform `fd_set` (an array of `unsigned long`
/// words, bit `n % W` of word `n / W`), so the direct path can hand it to
/// `select(2)` as-is. Values outside the range are ignored on insert and never
/// reported as members.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FdSet {
    bits: [Word; WORDS],
}

const _: () = assert!(std::mem::size_of::<FdSet>() == std::mem::size_of::<libc::fd_set>());

impl FdSet {
    /// Empty set (`FD_ZERO`)
    #[inline]
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    #[inline]
    fn locate(fd: usize) -> Option<(usize, Word)> {
        (fd < FD_SETSIZE).then(|| (fd / WORD_BITS, 1 << (fd % WORD_BITS)))
    }

    /// Add `fd` (`FD_SET`); returns false if out of range
    #[inline]
    pub fn insert(&mut self, fd: usize) -> bool {
        match Self::locate(fd) {
            Some((word, mask)) => {
                self.bits[word] |= mask;
                true
            }
            None => false,
        }
    }

    /// Remove `fd` (`FD_CLR`)
    #[inline]
    pub fn remove(&mut self, fd: usize) {
        if let Some((word, mask)) = Self::locate(fd) {
            self.bits[word] &= !mask;
        }
    }

    /// Membership test (`FD_ISSET`)
    #[inline]
    pub fn contains(&self, fd: usize) -> bool {
        Self::locate(fd).is_some_and(|(word, mask)| self.bits[word] & mask != 0)
    }

    #[inline]
    pub fn clear(&mut self) {
        self.bits = [0; WORDS];
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of members
    #[inline]
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Members in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().flat_map(|(i, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| i * WORD_BITS + bit)
        })
    }

    /// Members below `nfds`
    pub fn iter_below(&self, nfds: usize) -> impl Iterator<Item = usize> + '_ {
        self.iter().take_while(move |fd| *fd < nfds)
    }

    /// Pointer for the platform `select(2)`
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        (self as *mut FdSet).cast()
    }

    /// Reinterpret a platform `fd_set`
    ///
    /// # Safety
    /// `ptr` must be non-null, aligned, and valid for reads and writes for `'a`.
    #[inline]
    pub unsafe fn from_raw_mut<'a>(ptr: *mut libc::fd_set) -> &'a mut FdSet {
        // SAFETY: FdSet has the exact size and word layout of fd_set
        unsafe { &mut *ptr.cast::<FdSet>() }
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<usize> for FdSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = FdSet::new();
        for fd in iter {
            set.insert(fd);
        }
        set
    }
}

impl<'a> FromIterator<&'a usize> for FdSet {
    fn from_iter<I: IntoIterator<Item = &'a usize>>(iter: I) -> Self {
        iter.into_iter().copied().collect()
    }
}

impl FromIterator<VirtualFd> for FdSet {
    fn from_iter<I: IntoIterator<Item = VirtualFd>>(iter: I) -> Self {
        iter.into_iter().map(VirtualFd::index).collect()
    }
}

impl fmt::Debug for FdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
