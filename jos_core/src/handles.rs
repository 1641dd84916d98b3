use crate::content::{ContentRef, Handle};
use crate::error::{ParseError, ParseResult};
use crate::tag::BASE_HANDLE;
use hashbrown::HashMap;

/// Per-session mapping from handle to decoded content.
///
/// Reservation and binding are separate steps: the counter advances at the
/// exact point the wire format consumes a handle, while the slot may be
/// bound afterwards. Shell entities bound early can therefore be mutated in
/// place while their sub-structures are still being read.
pub struct HandleTable {
    next: Handle,
    slots: HashMap<Handle, ContentRef>,
    archive: Vec<HashMap<Handle, ContentRef>>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            next: BASE_HANDLE,
            slots: HashMap::new(),
            archive: Vec::new(),
        }
    }

    /// Consumes the next handle value.
    #[inline]
    pub fn reserve(&mut self) -> Handle {
        let handle = self.next;
        self.next += 1;
        handle
    }

    /// Binds a reserved handle. Re-binding is a parse error.
    pub fn bind(&mut self, handle: Handle, content: ContentRef) -> ParseResult<()> {
        if self.slots.contains_key(&handle) {
            return Err(ParseError::HandleCollision(handle));
        }
        self.slots.insert(handle, content);
        Ok(())
    }

    pub fn get(&self, handle: Handle) -> ParseResult<ContentRef> {
        self.slots
            .get(&handle)
            .cloned()
            .ok_or(ParseError::UnknownHandle(handle))
    }

    /// Archives the live map for post-mortem inspection, clears it and
    /// rewinds the counter.
    pub fn reset(&mut self) {
        if !self.slots.is_empty() {
            self.archive.push(self.slots.clone());
        }
        self.slots.clear();
        self.next = BASE_HANDLE;
    }

    /// Archives the live map without clearing it; called once when parsing
    /// ends.
    pub fn archive_live(&mut self) {
        if !self.slots.is_empty() {
            self.archive.push(self.slots.clone());
        }
    }

    pub fn archive(&self) -> &[HashMap<Handle, ContentRef>] {
        &self.archive
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Live contents in ascending handle order.
    pub fn contents(&self) -> Vec<(Handle, ContentRef)> {
        let mut entries: Vec<_> = self
            .slots
            .iter()
            .map(|(&handle, content)| (handle, content.clone()))
            .collect();
        entries.sort_by_key(|&(handle, _)| handle);
        entries
    }
}

impl Default for HandleTable {
    fn default() -> HandleTable {
        HandleTable::new()
    }
}
