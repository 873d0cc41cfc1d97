/// An append-only byte buffer with amortized-doubling growth.
///
/// `push` is the only way to grow the buffer; the slice it returns is valid
/// until the next `push`, which may reallocate and invalidate it.
#[derive(Debug, Default, Clone)]
pub struct GrowBuf {
    data: Vec<u8>,
}

impl GrowBuf {
    pub fn new() -> Self {
        GrowBuf { data: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        GrowBuf {
            data: Vec::with_capacity(cap),
        }
    }

    /// Grow the buffer by `n` bytes and return the newly-added region for
    /// the caller to fill in.
    pub fn push(&mut self, n: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        &mut self.data[start..]
    }

    pub fn push_byte(&mut self, b: u8) {
        self.data.push(b);
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn bottom(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append `other`'s content to self and clear `other`.
    pub fn drain_from(&mut self, other: &mut GrowBuf) {
        self.data.extend_from_slice(&other.data);
        other.data.clear();
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl AsRef<[u8]> for GrowBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
