use bytes::{Bytes, BytesMut};

/// Size of each shared read slab.
pub(crate) const POOL_CAPACITY: usize = 40 * 1024;
/// Below this many spare bytes the slab is replaced before the next read.
pub(crate) const LOW_WATER: usize = 128;

/// Process-wide read slab shared by every stream.
///
/// Inbound reads land at the front of the slab and are split off as
/// immutable `Bytes` views, so concurrently handed-out slices can never
/// alias. A slab is replaced (never recycled) once it runs low: any
/// outstanding view keeps the old allocation alive on its own.
pub(crate) struct Pool {
    slab: BytesMut,
}

impl Pool {
    pub(crate) fn new() -> Self {
        Self { slab: BytesMut::zeroed(POOL_CAPACITY) }
    }

    /// Replaces the slab when the spare room is below the low-water mark.
    pub(crate) fn ensure(&mut self) {
        if self.slab.len() < LOW_WATER {
            self.slab = BytesMut::zeroed(POOL_CAPACITY);
        }
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.slab.len()
    }

    /// Scratch space for the next read. Bytes actually filled must be
    /// claimed with `take` before the next caller reads.
    #[inline]
    pub(crate) fn read_space(&mut self) -> &mut [u8] {
        &mut self.slab[..]
    }

    /// Claims the first `n` bytes of the slab as an immutable view.
    #[inline]
    pub(crate) fn take(&mut self, n: usize) -> Bytes {
        self.slab.split_to(n).freeze()
    }

    /// Reserves `n` writable bytes for outbound staging, if they fit.
    pub(crate) fn reserve_write(&mut self, n: usize) -> Option<BytesMut> {
        (n <= self.slab.len()).then(|| self.slab.split_to(n))
    }

    /// Returns a fully-written reservation, rewinding the slab cursor.
    pub(crate) fn rewind(&mut self, mut reservation: BytesMut) {
        reservation.unsplit(std::mem::take(&mut self.slab));
        self.slab = reservation;
    }
}
