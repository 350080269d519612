//! Translation of native notifications into [`FileChangeEvent`]s.
//!
//! Only direct children of the watch root are reported. Directories,
//! access events and metadata-only changes are dropped; renames become a
//! delete of the old name followed by a create of the new one.

use std::path::Path;

use dirsync_core::{ChangeKind, FileChangeEvent};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind};

/// Decode one native notification into zero or more events, in path order.
pub fn normalize(event: &Event, root: &Path) -> Vec<FileChangeEvent> {
    let mut out = Vec::new();
    match &event.kind {
        EventKind::Create(CreateKind::Folder) => {}
        EventKind::Create(_) => {
            for path in &event.paths {
                if !path.is_dir() {
                    push(&mut out, path, root, ChangeKind::Created);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => rename(&mut out, event, root, *mode),
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Modify(_) => {
            for path in &event.paths {
                if !path.is_dir() {
                    push(&mut out, path, root, ChangeKind::Modified);
                }
            }
        }
        EventKind::Remove(RemoveKind::Folder) => {}
        EventKind::Remove(_) => {
            for path in &event.paths {
                push(&mut out, path, root, ChangeKind::Deleted);
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
    out
}

fn rename(out: &mut Vec<FileChangeEvent>, event: &Event, root: &Path, mode: RenameMode) {
    match (mode, event.paths.as_slice()) {
        (RenameMode::Both, [from, to]) => {
            push(out, from, root, ChangeKind::Deleted);
            if !to.is_dir() {
                push(out, to, root, ChangeKind::Created);
            }
        }
        (RenameMode::From, paths) => {
            for path in paths {
                push(out, path, root, ChangeKind::Deleted);
            }
        }
        (RenameMode::To, paths) => {
            for path in paths {
                if !path.is_dir() {
                    push(out, path, root, ChangeKind::Created);
                }
            }
        }
        // Direction unknown (e.g. FSEvents): the filesystem decides.
        (_, paths) => {
            for path in paths {
                if path.is_dir() {
                    continue;
                }
                let kind = if path.exists() {
                    ChangeKind::Created
                } else {
                    ChangeKind::Deleted
                };
                push(out, path, root, kind);
            }
        }
    }
}

fn push(out: &mut Vec<FileChangeEvent>, path: &Path, root: &Path, kind: ChangeKind) {
    if path.parent() != Some(root) {
        return;
    }
    let Some(name) = path.file_name() else {
        return;
    };
    match name.to_str() {
        Some(name) => out.push(FileChangeEvent::new(name, root, kind)),
        None => tracing::warn!(path = %path.display(), "skipping non UTF-8 filename"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange, MetadataKind};
    use rstest::rstest;
    use std::path::PathBuf;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |ev, p| ev.add_path(PathBuf::from(p)))
    }

    #[test]
    fn created_file_yields_exactly_one_event() {
        let ev = event(EventKind::Create(CreateKind::File), &["/data/x.log"]);
        let out = normalize(&ev, Path::new("/data"));
        assert_eq!(
            out,
            vec![FileChangeEvent::new("x.log", "/data", ChangeKind::Created)]
        );
    }

    #[rstest]
    #[case(EventKind::Create(CreateKind::Any), Some(ChangeKind::Created))]
    #[case(EventKind::Modify(ModifyKind::Data(DataChange::Content)), Some(ChangeKind::Modified))]
    #[case(EventKind::Modify(ModifyKind::Any), Some(ChangeKind::Modified))]
    #[case(EventKind::Remove(RemoveKind::File), Some(ChangeKind::Deleted))]
    #[case(EventKind::Remove(RemoveKind::Any), Some(ChangeKind::Deleted))]
    #[case(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)), None)]
    #[case(EventKind::Access(AccessKind::Any), None)]
    #[case(EventKind::Create(CreateKind::Folder), None)]
    #[case(EventKind::Remove(RemoveKind::Folder), None)]
    #[case(EventKind::Other, None)]
    fn kind_mapping(#[case] kind: EventKind, #[case] expected: Option<ChangeKind>) {
        let out = normalize(&event(kind, &["/data/a.txt"]), Path::new("/data"));
        assert_eq!(out.first().map(|e| e.kind), expected);
        assert!(out.len() <= 1);
    }

    #[test]
    fn rename_both_is_delete_then_create() {
        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/data/old.txt", "/data/new.txt"],
        );
        let out = normalize(&ev, Path::new("/data"));
        assert_eq!(
            out,
            vec![
                FileChangeEvent::new("old.txt", "/data", ChangeKind::Deleted),
                FileChangeEvent::new("new.txt", "/data", ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn rename_halves_map_to_delete_and_create() {
        let from = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/data/old.txt"],
        );
        let to = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/data/new.txt"],
        );
        let root = Path::new("/data");
        assert_eq!(normalize(&from, root)[0].kind, ChangeKind::Deleted);
        assert_eq!(normalize(&to, root)[0].kind, ChangeKind::Created);
    }

    #[test]
    fn paths_outside_root_are_ignored() {
        let ev = event(
            EventKind::Create(CreateKind::File),
            &["/data/sub/deep.txt", "/elsewhere/a.txt", "/data"],
        );
        assert!(normalize(&ev, Path::new("/data")).is_empty());
    }

    #[test]
    fn multi_path_event_keeps_reported_order() {
        let ev = event(
            EventKind::Remove(RemoveKind::File),
            &["/data/b", "/data/a", "/data/c"],
        );
        let names: Vec<_> = normalize(&ev, Path::new("/data"))
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }
}
