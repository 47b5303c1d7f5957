use std::collections::HashMap;

use nativeprof_object::BuildId;

/// Identifies an executable's unwind information in the chunk index map.
pub type ExecutableHandle = u64;

/// Hands out one handle per build id, so the unwind information of an
/// executable mapped by many processes is only generated once.
pub struct ExecutableDeduper {
    handles: HashMap<BuildId, ExecutableHandle>,
    next_handle: ExecutableHandle,
}

impl Default for ExecutableDeduper {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutableDeduper {
    /// Handle 0 means "no unwind information", so handles start at 1.
    const FIRST_HANDLE: ExecutableHandle = 1;

    pub fn new() -> Self {
        ExecutableDeduper {
            handles: HashMap::new(),
            next_handle: Self::FIRST_HANDLE,
        }
    }

    /// Returns the handle for `build_id` and whether it had been seen before.
    pub fn handle_for(&mut self, build_id: &BuildId) -> (ExecutableHandle, bool) {
        if let Some(handle) = self.handles.get(build_id) {
            return (*handle, true);
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(build_id.clone(), handle);
        (handle, false)
    }

    /// Drops `build_id` so its unwind table is generated again on next sight.
    /// The handle it had is not handed out again.
    pub fn forget(&mut self, build_id: &BuildId) {
        self.handles.remove(build_id);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
        self.next_handle = Self::FIRST_HANDLE;
    }
}
