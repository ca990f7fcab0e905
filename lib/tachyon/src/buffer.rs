use slice_deque::SliceDeque;

type ByteDeque = SliceDeque<u8>;

/// A buffered FIFO byte queue with a logical capacity limit decoupled from
/// the backing allocation. Data is appended at the tail and consumed from
/// the head.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The logical capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Advance the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Advance the tail.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Slice containing free capacity to be written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Copies the supplied bytes onto the tail. Returns false when the data
    /// does not fit in the remaining capacity.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_capacity() {
            return false;
        }

        self.write_slice()[..bytes.len()].copy_from_slice(bytes);
        self.move_tail(bytes.len());

        true
    }

    /// Doubles the logical capacity, up to `max`. Returns false when the
    /// buffer is already at the limit.
    pub fn grow(&mut self, max: usize) -> bool {
        if self.size >= max {
            return false;
        }

        self.size = (self.size * 2).min(max);

        let allocated = self.data.capacity();
        if self.size > allocated {
            self.data.reserve(self.size - self.data.len());
        }

        true
    }
}
