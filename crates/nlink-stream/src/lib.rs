//! Component G — the data stream threaded between pipeline stages: a
//! growable byte buffer plus an ordered metadata bag with release hooks.

use nlink_result::{NexusError, Result};
use std::any::Any;
use std::sync::Arc;
use tracing::trace;

/// Opaque, type-erased metadata value. `Arc` rather than `Box` so cloning
/// a stream can share the value instead of needing to know its concrete
/// type to duplicate it.
pub type MetadataValue = Arc<dyn Any + Send + Sync>;

/// Caller-provided release callback, invoked once per owning bag on
/// overwrite or destruction.
pub type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

struct MetadataEntry {
    key: String,
    value: MetadataValue,
    release: ReleaseHook,
}

/// Ordered string-keyed bag of opaque values. Insertion order is the
/// release order on destruction, reversed.
#[derive(Default)]
pub struct MetadataBag {
    entries: Vec<MetadataEntry>,
}

impl MetadataBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, invoking the displaced entry's release
    /// hook first if `key` was already present.
    pub fn set(&mut self, key: impl Into<String>, value: MetadataValue, release: ReleaseHook) {
        let key = key.into();
        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            (self.entries[pos].release)();
            self.entries[pos] = MetadataEntry { key, value, release };
        } else {
            self.entries.push(MetadataEntry { key, value, release });
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            (self.entries[pos].release)();
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Clone for MetadataBag {
    /// Copies the ordered key list with shared (`Arc`-cloned) values and
    /// hooks — not a deep clone of the opaque values themselves. Both
    /// bags will independently invoke the release hook on their own
    /// destruction; callers whose hooks aren't idempotent should not rely
    /// on cloning a stream that owns non-reentrant resources.
    fn clone(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|e| MetadataEntry {
                    key: e.key.clone(),
                    value: e.value.clone(),
                    release: e.release.clone(),
                })
                .collect(),
        }
    }
}

impl Drop for MetadataBag {
    fn drop(&mut self) {
        for entry in self.entries.drain(..).rev() {
            (entry.release)();
        }
    }
}

/// Growable byte buffer with capacity ≥ size ≥ position ≥ 0, a format
/// tag, and an attached metadata bag.
pub struct DataStream {
    buffer: Vec<u8>,
    size: usize,
    position: usize,
    owns_buffer: bool,
    pub format: String,
    pub metadata: MetadataBag,
}

impl DataStream {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            buffer: Vec::new(),
            size: 0,
            position: 0,
            owns_buffer: true,
            format: format.into(),
            metadata: MetadataBag::new(),
        }
    }

    /// Starts from existing bytes, marked as not owning the underlying
    /// storage — `release` becomes a no-op beyond dropping the local copy.
    pub fn borrowing(bytes: &[u8], format: impl Into<String>) -> Self {
        Self {
            buffer: bytes.to_vec(),
            size: bytes.len(),
            position: 0,
            owns_buffer: false,
            format: format.into(),
            metadata: MetadataBag::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn owns_buffer(&self) -> bool {
        self.owns_buffer
    }

    fn ensure_capacity(&mut self, required: usize) {
        if required <= self.buffer.len() {
            return;
        }
        let grown = (self.buffer.len() * 3) / 2;
        let new_capacity = required.max(grown);
        self.buffer.resize(new_capacity, 0);
    }

    /// Copies `bytes` at the current position and advances it, growing
    /// the buffer per the `max(required, floor(1.5 * capacity))` policy
    /// if needed. Extends `size` if the write ran past the old size.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let end = self
            .position
            .checked_add(bytes.len())
            .ok_or(NexusError::AllocationFailed)?;
        self.ensure_capacity(end);
        self.buffer[self.position..end].copy_from_slice(bytes);
        self.position = end;
        self.size = self.size.max(self.position);
        Ok(bytes.len())
    }

    /// Copies up to `out.len()` bytes starting at the current position
    /// into `out`, advancing position. A short read (fewer bytes
    /// available than requested) is success, not an error.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let available = self.size.saturating_sub(self.position);
        let to_copy = out.len().min(available);
        out[..to_copy].copy_from_slice(&self.buffer[self.position..self.position + to_copy]);
        self.position += to_copy;
        to_copy
    }

    /// Resets position and size to zero; capacity is preserved. The
    /// stream is logically empty afterward — a subsequent `read` returns
    /// nothing until new bytes are written.
    pub fn clear(&mut self) {
        self.position = 0;
        self.size = 0;
    }

    /// Rewinds position to zero without touching size, so the bytes
    /// already written become readable again from the start. This is
    /// the operation a caller uses between a write pass and a read pass
    /// over the same stream.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.size]
    }
}

impl Clone for DataStream {
    /// Deep-copies the byte contents and format; the metadata bag clones
    /// by shared reference per [`MetadataBag::clone`].
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            size: self.size,
            position: self.position,
            owns_buffer: self.owns_buffer,
            format: self.format.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl Drop for DataStream {
    fn drop(&mut self) {
        if self.owns_buffer {
            trace!(capacity = self.buffer.len(), "data stream buffer released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn write_then_read_round_trips_bytes() {
        let mut stream = DataStream::new("binary");
        stream.write(&[1, 2, 3]).unwrap();
        stream.reset();
        let mut out = [0u8; 3];
        let n = stream.read(&mut out);
        assert_eq!(n, 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn sequence_of_writes_reproduces_concatenation_after_reset() {
        let mut stream = DataStream::new("binary");
        stream.write(&[0x01, 0x02]).unwrap();
        stream.write(&[0x03]).unwrap();
        stream.write(&[0xA0, 0xB0, 0xC0]).unwrap();
        let total = stream.size();
        stream.reset();
        let mut out = vec![0u8; total];
        let n = stream.read(&mut out);
        assert_eq!(n, total);
        assert_eq!(out, vec![0x01, 0x02, 0x03, 0xA0, 0xB0, 0xC0]);
    }

    #[test]
    fn short_read_is_not_an_error() {
        let mut stream = DataStream::new("binary");
        stream.write(&[1, 2]).unwrap();
        stream.reset();
        let mut out = [0u8; 10];
        let n = stream.read(&mut out);
        assert_eq!(n, 2);
    }

    #[test]
    fn capacity_grows_by_policy() {
        let mut stream = DataStream::new("binary");
        stream.write(&[0u8; 4]).unwrap();
        assert_eq!(stream.capacity(), 4);
        stream.write(&[0u8; 4]).unwrap();
        // required = 8, floor(1.5*4) = 6, so new capacity = max(8,6) = 8.
        assert_eq!(stream.capacity(), 8);
    }

    #[test]
    fn clear_preserves_capacity_but_zeroes_size_and_position() {
        let mut stream = DataStream::new("binary");
        stream.write(&[1, 2, 3, 4]).unwrap();
        let capacity_before = stream.capacity();
        stream.clear();
        assert_eq!(stream.size(), 0);
        assert_eq!(stream.position(), 0);
        assert_eq!(stream.capacity(), capacity_before);
    }

    #[test]
    fn metadata_set_overwrite_invokes_old_release_hook() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut bag = MetadataBag::new();
        let r = released.clone();
        bag.set(
            "k",
            Arc::new(1u32),
            Arc::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bag.set("k", Arc::new(2u32), Arc::new(|| {}));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(*bag.get("k").unwrap().downcast_ref::<u32>().unwrap(), 2);
    }

    #[test]
    fn metadata_release_hooks_fire_in_reverse_insertion_order_on_drop() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let mut bag = MetadataBag::new();
            for key in ["a", "b", "c"] {
                let order = order.clone();
                let key = key.to_string();
                bag.set(key.clone(), Arc::new(()), Arc::new(move || {
                    order.lock().unwrap().push(key.clone());
                }));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
    }
}
