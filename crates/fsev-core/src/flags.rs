//! Native flag words.
//!
//! [`EventFlags`] is the per-event word the OS watcher attaches to every
//! reported path; [`CreateFlags`] is the per-stream word supplied when a
//! watch is created. Bit values match the platform's event stream API so
//! that words can be forwarded to consumers unchanged.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Per-event flag word reported alongside each changed path.
    ///
    /// The core never interprets these beyond diagnostics; they are
    /// forwarded exactly as the watcher reports them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u32 {
        /// The consumer must rescan the path and everything beneath it.
        const MUST_SCAN_SUB_DIRS = 0x0000_0001;
        /// Events were dropped in user space.
        const USER_DROPPED = 0x0000_0002;
        /// Events were dropped in the kernel.
        const KERNEL_DROPPED = 0x0000_0004;
        /// The 64-bit event id counter wrapped.
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        /// Sentinel marking the end of replayed history.
        const HISTORY_DONE = 0x0000_0010;
        /// The watched root itself was moved or removed.
        const ROOT_CHANGED = 0x0000_0020;
        /// A volume was mounted under the watched tree.
        const MOUNT = 0x0000_0040;
        /// A volume was unmounted from under the watched tree.
        const UNMOUNT = 0x0000_0080;
        /// The item was created.
        const ITEM_CREATED = 0x0000_0100;
        /// The item was removed.
        const ITEM_REMOVED = 0x0000_0200;
        /// Inode metadata changed.
        const ITEM_INODE_META_MOD = 0x0000_0400;
        /// The item was renamed.
        const ITEM_RENAMED = 0x0000_0800;
        /// The item's contents were modified.
        const ITEM_MODIFIED = 0x0000_1000;
        /// Finder info changed.
        const ITEM_FINDER_INFO_MOD = 0x0000_2000;
        /// Ownership changed.
        const ITEM_CHANGE_OWNER = 0x0000_4000;
        /// Extended attributes changed.
        const ITEM_XATTR_MOD = 0x0000_8000;
        /// The item is a regular file.
        const ITEM_IS_FILE = 0x0001_0000;
        /// The item is a directory.
        const ITEM_IS_DIR = 0x0002_0000;
        /// The item is a symbolic link.
        const ITEM_IS_SYMLINK = 0x0004_0000;
    }
}

impl EventFlags {
    /// Bits describing what happened to a single item, as opposed to
    /// stream-level conditions such as drops or root changes.
    pub const ITEM_MASK: Self = Self::from_bits_retain(0x0007_FF00);

    /// Returns `true` if the watcher signalled that events were lost and
    /// the consumer should rescan.
    #[inline]
    #[must_use]
    pub const fn requires_rescan(self) -> bool {
        self.intersects(
            Self::MUST_SCAN_SUB_DIRS
                .union(Self::USER_DROPPED)
                .union(Self::KERNEL_DROPPED),
        )
    }
}

/// Renders the raw word followed by the names of the set bits, e.g.
/// `0x00010100 ITEM_CREATED ITEM_IS_FILE`.
impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010X}", self.bits())?;
        for (name, _) in self.iter_names() {
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Per-stream creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CreateFlags: u32 {
        /// Deliver the first event after a quiet period immediately
        /// instead of waiting out the latency window.
        const NO_DEFER = 0x0000_0002;
        /// Report [`EventFlags::ROOT_CHANGED`] when the watched root moves.
        const WATCH_ROOT = 0x0000_0004;
        /// Suppress events caused by this process.
        const IGNORE_SELF = 0x0000_0008;
        /// Report individual files instead of their parent directories.
        const FILE_EVENTS = 0x0000_0010;
    }
}

impl CreateFlags {
    /// No creation flags.
    pub const NONE: Self = Self::empty();
}

impl Default for CreateFlags {
    fn default() -> Self {
        Self::WATCH_ROOT
    }
}

// Serialized as the raw word so config files can carry platform values.
impl Serialize for CreateFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for CreateFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}
