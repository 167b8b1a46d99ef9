use crate::host::descriptor::File;

/// A key for a file being monitored by an epoll descriptor. As required by
/// epoll, the key is the combination of the file descriptor number and the
/// underlying file object.
#[derive(Clone)]
pub(super) struct Key {
    fd: i32,
    file: File,
}

impl Key {
    pub fn new(fd: i32, file: File) -> Self {
        Self { fd, file }
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        use std::hash::Hash;
        self.fd.hash(state);
        self.file.canonical_handle().hash(state);
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.fd == other.fd && self.file.canonical_handle() == other.file.canonical_handle()
    }
}

impl Eq for Key {}

/// A key ordered by a priority value. Used in the epoll ready set so that
/// entries whose events were reported longest ago are reported first.
pub(super) struct PriorityKey {
    priority: u64,
    key: Key,
}

impl PriorityKey {
    pub fn new(priority: u64, key: Key) -> Self {
        Self { priority, key }
    }

    pub fn priority(&self) -> u64 {
        self.priority
    }
}

impl From<PriorityKey> for Key {
    fn from(x: PriorityKey) -> Self {
        x.key
    }
}

impl PartialEq for PriorityKey {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for PriorityKey {}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority)
    }
}
