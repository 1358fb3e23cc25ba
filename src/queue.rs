//! Circular-buffer FIFO.
//!
//! `push` and `shift` are O(1) amortized; the backing storage doubles when
//! full. Positional removal slides whichever side of the removed slot is
//! shorter, so its cost is bounded by the distance to the nearer end.

/// Must be a power of two.
const INITIAL_CAPACITY: usize = 16;

#[derive(Debug)]
pub struct Queue<T> {
    buf: Vec<Option<T>>,
    front: usize,
    len: usize,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            buf: empty_buffer(INITIAL_CAPACITY),
            front: 0,
            len: 0,
        }
    }

    #[inline(always)]
    fn mask(&self) -> usize {
        self.buf.len() - 1
    }

    #[inline(always)]
    fn slot(&self, offset: usize) -> usize {
        (self.front + offset) & self.mask()
    }

    pub fn push(&mut self, value: T) {
        if self.len == self.buf.len() {
            self.grow();
        }
        let index = self.slot(self.len);
        self.buf[index] = Some(value);
        self.len += 1;
    }

    fn grow(&mut self) {
        let old = self.buf.len();
        self.buf.resize_with(old * 2, || None);
        // Elements that wrapped around to the start continue past the old end.
        for i in 0..self.front {
            self.buf[old + i] = self.buf[i].take();
        }
    }

    pub fn shift(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.buf[self.front].take();
        self.front = (self.front + 1) & self.mask();
        self.len -= 1;
        value
    }

    /// Removes the first element matching `pred`, preserving the order of the rest.
    pub fn take_where<F>(&mut self, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let offset = (0..self.len)
            .find(|&n| self.buf[self.slot(n)].as_ref().is_some_and(&mut pred))?;
        self.remove_at(offset)
    }

    /// Removes the first element equal to `value`.
    pub fn delete(&mut self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.take_where(|item| item == value).is_some()
    }

    fn remove_at(&mut self, offset: usize) -> Option<T> {
        let mask = self.mask();
        let mut index = self.slot(offset);
        let value = self.buf[index].take();

        if offset * 2 + 1 < self.len {
            for _ in 0..offset {
                let prev = index.wrapping_sub(1) & mask;
                self.buf[index] = self.buf[prev].take();
                index = prev;
            }
            self.front = (self.front + 1) & mask;
        } else {
            for _ in 0..(self.len - offset - 1) {
                let next = (index + 1) & mask;
                self.buf[index] = self.buf[next].take();
                index = next;
            }
        }

        self.len -= 1;
        value
    }

    pub fn clear(&mut self) {
        self.buf = empty_buffer(INITIAL_CAPACITY);
        self.front = 0;
        self.len = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |n| self.buf[self.slot(n)].as_ref())
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_buffer<T>(capacity: usize) -> Vec<Option<T>> {
    let mut buf = Vec::with_capacity(capacity);
    buf.resize_with(capacity, || None);
    buf
}
