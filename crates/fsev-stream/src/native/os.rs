//! The platform backend, built on `notify`.
//!
//! Each stream owns one recommended watcher, watching its root
//! recursively. Watcher events are translated into native flag words:
//!
//! | notify event              | flags                                  |
//! |---------------------------|----------------------------------------|
//! | `Create(File \| Folder)`  | `ITEM_CREATED` + `ITEM_IS_FILE \| DIR` |
//! | `Remove(File \| Folder)`  | `ITEM_REMOVED` + `ITEM_IS_FILE \| DIR` |
//! | `Modify(Data)`            | `ITEM_MODIFIED`                        |
//! | `Modify(Name)`            | `ITEM_RENAMED`                         |
//! | `Modify(Metadata(..))`    | `ITEM_CHANGE_OWNER`, `ITEM_XATTR_MOD`, or `ITEM_INODE_META_MOD` |
//! | rescan hint               | `MUST_SCAN_SUB_DIRS`                   |
//! | watcher error             | `MUST_SCAN_SUB_DIRS \| USER_DROPPED` on the root |
//!
//! Access events are not reported. `IGNORE_SELF` has no effect here: the
//! watcher cannot attribute changes to a process.

use std::fmt;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use fsev_core::{CreateFlags, EventFlags};
use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::{NativeBackend, NativeStream};
use crate::error::WatchError;
use crate::source::EventSink;
use crate::stream::StreamOptions;

/// Watches real directories with the platform's recommended watcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyBackend;

impl NativeBackend for NotifyBackend {
    fn resolve_root(&self, path: &Utf8Path) -> Result<Utf8PathBuf, WatchError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WatchError::path_not_found(path)
            } else {
                WatchError::Io(e)
            }
        })?;

        if !metadata.is_dir() {
            return Err(WatchError::NotADirectory(path.to_owned()));
        }

        Ok(path.canonicalize_utf8()?)
    }

    fn create_stream(
        &self,
        root: &Utf8Path,
        options: &StreamOptions,
        sink: EventSink,
    ) -> Result<Box<dyn NativeStream>, WatchError> {
        let translator = Translator::new(root.as_std_path().to_path_buf(), options.flags);

        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) => {
                let records = translator.translate(&event);
                if !records.is_empty() {
                    sink.push(records);
                }
            }
            Err(error) => {
                tracing::warn!(stream = %sink.stream_id(), error = %error, "watcher error, requesting rescan");
                sink.push([(
                    translator.root.clone(),
                    EventFlags::MUST_SCAN_SUB_DIRS | EventFlags::USER_DROPPED,
                )]);
            }
        })?;

        Ok(Box::new(OsStream {
            root: root.to_owned(),
            watcher,
            watching: false,
        }))
    }
}

struct OsStream {
    root: Utf8PathBuf,
    watcher: RecommendedWatcher,
    watching: bool,
}

impl NativeStream for OsStream {
    fn start(&mut self) -> Result<(), WatchError> {
        self.watcher.watch(self.root.as_std_path(), RecursiveMode::Recursive)?;
        self.watching = true;
        tracing::debug!(root = %self.root, "native watch started");
        Ok(())
    }

    fn stop(&mut self) {
        if !self.watching {
            return;
        }
        self.watching = false;
        if let Err(error) = self.watcher.unwatch(self.root.as_std_path()) {
            tracing::debug!(root = %self.root, error = %error, "unwatch failed");
        }
    }
}

impl fmt::Debug for OsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsStream")
            .field("root", &self.root)
            .field("watching", &self.watching)
            .finish_non_exhaustive()
    }
}

/// Turns watcher events into `(path, flags)` records for one stream.
#[derive(Debug, Clone)]
struct Translator {
    root: PathBuf,
    flags: CreateFlags,
}

impl Translator {
    fn new(root: PathBuf, flags: CreateFlags) -> Self {
        Self { root, flags }
    }

    fn translate(&self, event: &Event) -> Vec<(PathBuf, EventFlags)> {
        let mut base = kind_flags(&event.kind);
        if event.need_rescan() {
            base |= EventFlags::MUST_SCAN_SUB_DIRS;
        }
        if base.is_empty() {
            return Vec::new();
        }

        let paths = if event.paths.is_empty() {
            std::slice::from_ref(&self.root)
        } else {
            event.paths.as_slice()
        };

        let mut records: Vec<(PathBuf, EventFlags)> = Vec::with_capacity(paths.len());
        for path in paths {
            let (path, flags) = self.record(path, base);
            let duplicate = records
                .last()
                .is_some_and(|(last, last_flags)| *last == path && *last_flags == flags);
            if !duplicate {
                records.push((path, flags));
            }
        }
        records
    }

    fn record(&self, path: &Path, mut flags: EventFlags) -> (PathBuf, EventFlags) {
        let is_root = path == self.root;

        if flags.intersects(EventFlags::ITEM_MASK) && !flags.intersects(ITEM_TYPES) {
            flags |= item_type(path);
        }
        if is_root
            && self.flags.contains(CreateFlags::WATCH_ROOT)
            && flags.intersects(EventFlags::ITEM_REMOVED | EventFlags::ITEM_RENAMED)
        {
            flags |= EventFlags::ROOT_CHANGED;
        }

        if self.flags.contains(CreateFlags::FILE_EVENTS) {
            return (path.to_path_buf(), flags);
        }

        // Directory granularity: report the directory whose contents changed.
        let directory = if is_root {
            path.to_path_buf()
        } else {
            path.parent().map_or_else(|| path.to_path_buf(), Path::to_path_buf)
        };
        (directory, flags.difference(EventFlags::ITEM_MASK))
    }
}

const ITEM_TYPES: EventFlags = EventFlags::ITEM_IS_FILE
    .union(EventFlags::ITEM_IS_DIR)
    .union(EventFlags::ITEM_IS_SYMLINK);

fn kind_flags(kind: &EventKind) -> EventFlags {
    match kind {
        EventKind::Create(kind) => {
            EventFlags::ITEM_CREATED
                | match kind {
                    CreateKind::File => EventFlags::ITEM_IS_FILE,
                    CreateKind::Folder => EventFlags::ITEM_IS_DIR,
                    CreateKind::Any | CreateKind::Other => EventFlags::empty(),
                }
        }
        EventKind::Remove(kind) => {
            EventFlags::ITEM_REMOVED
                | match kind {
                    RemoveKind::File => EventFlags::ITEM_IS_FILE,
                    RemoveKind::Folder => EventFlags::ITEM_IS_DIR,
                    RemoveKind::Any | RemoveKind::Other => EventFlags::empty(),
                }
        }
        EventKind::Modify(ModifyKind::Name(_)) => EventFlags::ITEM_RENAMED,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership)) => EventFlags::ITEM_CHANGE_OWNER,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended)) => EventFlags::ITEM_XATTR_MOD,
        EventKind::Modify(ModifyKind::Metadata(_)) => EventFlags::ITEM_INODE_META_MOD,
        EventKind::Modify(_) => EventFlags::ITEM_MODIFIED,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => EventFlags::empty(),
    }
}

/// Looks the item up when the event did not say what it is.
fn item_type(path: &Path) -> EventFlags {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_symlink() => EventFlags::ITEM_IS_SYMLINK,
        Ok(metadata) if metadata.is_dir() => EventFlags::ITEM_IS_DIR,
        Ok(metadata) if metadata.is_file() => EventFlags::ITEM_IS_FILE,
        _ => EventFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use notify::event::{DataChange, Flag, RenameMode};

    use super::*;

    fn translator(flags: CreateFlags) -> Translator {
        Translator::new(PathBuf::from("/w"), flags)
    }

    #[test]
    fn test_create_file_event() {
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/w/a.txt"));
        let records = translator(CreateFlags::FILE_EVENTS).translate(&event);
        assert_eq!(
            records,
            vec![(
                PathBuf::from("/w/a.txt"),
                EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE
            )]
        );
    }

    #[test]
    fn test_metadata_kinds() {
        assert_eq!(
            kind_flags(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership))),
            EventFlags::ITEM_CHANGE_OWNER
        );
        assert_eq!(
            kind_flags(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended))),
            EventFlags::ITEM_XATTR_MOD
        );
        assert_eq!(
            kind_flags(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions))),
            EventFlags::ITEM_INODE_META_MOD
        );
        assert_eq!(
            kind_flags(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            EventFlags::ITEM_MODIFIED
        );
    }

    #[test]
    fn test_access_events_are_ignored() {
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(PathBuf::from("/w/a"));
        assert!(translator(CreateFlags::FILE_EVENTS).translate(&event).is_empty());
    }

    #[test]
    fn test_rescan_hint_without_paths_reports_root() {
        let event = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        let records = translator(CreateFlags::NONE).translate(&event);
        assert_eq!(records, vec![(PathBuf::from("/w"), EventFlags::MUST_SCAN_SUB_DIRS)]);
    }

    #[test]
    fn test_root_removal_with_watch_root() {
        let event = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(PathBuf::from("/w"));

        let watched = translator(CreateFlags::WATCH_ROOT | CreateFlags::FILE_EVENTS).translate(&event);
        assert!(watched[0].1.contains(EventFlags::ROOT_CHANGED));

        let unwatched = translator(CreateFlags::FILE_EVENTS).translate(&event);
        assert!(!unwatched[0].1.contains(EventFlags::ROOT_CHANGED));
    }

    #[test]
    fn test_directory_granularity_reports_parent() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/sub/old"))
            .add_path(PathBuf::from("/w/sub/new"));
        let records = translator(CreateFlags::NONE).translate(&event);
        assert_eq!(records, vec![(PathBuf::from("/w/sub"), EventFlags::empty())]);
    }

    #[test]
    fn test_resolve_root_rejects_missing_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        let missing = NotifyBackend.resolve_root(&root.join("missing"));
        assert!(matches!(missing, Err(WatchError::PathNotFound(_))));

        std::fs::write(root.join("file.txt"), "x").unwrap();
        let file = NotifyBackend.resolve_root(&root.join("file.txt"));
        assert!(matches!(file, Err(WatchError::NotADirectory(_))));

        let resolved = NotifyBackend.resolve_root(root).unwrap();
        assert!(resolved.is_absolute());
    }
}
