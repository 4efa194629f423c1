use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Reference-counted, immutable byte slice.
///
/// Buffers handed to data callbacks and queued by `send_data` are
/// `SharedBuf`s. The storage is freed when the last clone is dropped;
/// holding a clone past the callback that delivered it is allowed and does
/// not block further reads, though the `File` read pool pauses once all of
/// its pooled buffers are held externally.
#[derive(Clone)]
pub struct SharedBuf {
    storage: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl SharedBuf {
    /// Wraps complete storage.
    pub(crate) fn new(storage: Arc<[u8]>) -> SharedBuf {
        let end = storage.len();
        SharedBuf {
            storage,
            start: 0,
            end,
        }
    }

    /// Wraps the first `len` bytes of `storage`.
    pub(crate) fn with_len(storage: Arc<[u8]>, len: usize) -> SharedBuf {
        debug_assert!(len <= storage.len());
        SharedBuf {
            storage,
            start: 0,
            end: len,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }
}

impl Deref for SharedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for SharedBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for SharedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuf")
            .field("len", &self.len())
            .field("refs", &Arc::strong_count(&self.storage))
            .finish()
    }
}

impl From<Vec<u8>> for SharedBuf {
    fn from(bytes: Vec<u8>) -> SharedBuf {
        SharedBuf::new(Arc::from(bytes))
    }
}

impl From<&[u8]> for SharedBuf {
    fn from(bytes: &[u8]) -> SharedBuf {
        SharedBuf::new(Arc::from(bytes))
    }
}

impl From<&str> for SharedBuf {
    fn from(s: &str) -> SharedBuf {
        SharedBuf::from(s.as_bytes())
    }
}

impl From<String> for SharedBuf {
    fn from(s: String) -> SharedBuf {
        SharedBuf::from(s.into_bytes())
    }
}

/// A chunk of received or read data.
///
/// For network handles `offset` is always zero; for `File` reads it is the
/// position of the chunk within the file.
#[derive(Clone, Debug)]
pub struct DataChunk {
    pub buf: SharedBuf,
    pub offset: u64,
}

impl DataChunk {
    pub(crate) fn new(buf: SharedBuf, offset: u64) -> DataChunk {
        DataChunk { buf, offset }
    }

    /// Empty chunk used when delivering pure-error callbacks.
    pub(crate) fn empty() -> DataChunk {
        DataChunk {
            buf: SharedBuf::from(Vec::new()),
            offset: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slicing_and_refs() {
        let buf = SharedBuf::from("hello world");
        assert_eq!(buf.len(), 11);
        assert_eq!(&buf[..5], b"hello");

        let clone = buf.clone();
        drop(buf);
        assert_eq!(clone.as_slice(), b"hello world");
    }

    #[test]
    fn with_len_restricts_view() {
        let storage: Arc<[u8]> = Arc::from(vec![1u8, 2, 3, 4]);
        let buf = SharedBuf::with_len(storage, 2);
        assert_eq!(buf.as_slice(), &[1, 2]);
    }
}
