//! File selector: turns per-file user priorities into per-piece priorities
//! and keeps storage, picker and downloader in step when they change.

mod commit;
mod task;

pub use task::{SelectorHandle, SelectorTask, run};

use crate::error::SelectorError;
use crate::picker::PiecePicker;
use crate::storage::StorageWrapper;
use rand::seq::SliceRandom;
use seed_core::bencoding::Bencode;
use seed_core::priority::{disabled_bitmap, parse_priorities, piece_priorities};
use seed_core::{Priority, PriorityError, TorrentLayout};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receives a list of piece indices.
pub type PieceListFn = Box<dyn FnMut(&[u32]) + Send>;
/// Receives a human-readable message when the torrent must stop.
pub type FailFn = Box<dyn FnMut(String) + Send>;
pub type RerequestFn = Box<dyn FnMut() + Send>;

// Collaborators latched by `tie_in`.
struct Tie {
    picker: Box<dyn PiecePicker + Send>,
    cancel: PieceListFn,
    request_more: PieceListFn,
}

pub struct FileSelector<S> {
    layout: Arc<TorrentLayout>,
    storage: S,
    priority: Vec<Priority>,
    piece_priority: Vec<Priority>,
    /// Files currently disabled at the storage layer.
    file_disabled: Vec<bool>,
    pending_priority: Option<Vec<Priority>>,
    pending_partials: Option<Vec<u32>>,
    tie: Option<Tie>,
    rerequest: Option<RerequestFn>,
    fail: FailFn,
    sched: mpsc::UnboundedSender<SelectorTask>,
}

impl<S: StorageWrapper> FileSelector<S> {
    /// Creates a selector with every file at `Normal` priority.
    ///
    /// `sched` is the queue of the task that owns this selector; staged
    /// commits are posted there.
    pub fn new(
        layout: Arc<TorrentLayout>,
        storage: S,
        sched: mpsc::UnboundedSender<SelectorTask>,
        fail: FailFn,
    ) -> Self {
        let files = layout.num_files();
        let pieces = layout.piece_count() as usize;
        Self {
            layout,
            storage,
            priority: vec![Priority::Normal; files],
            piece_priority: vec![Priority::Normal; pieces],
            file_disabled: vec![false; files],
            pending_priority: None,
            pending_partials: None,
            tie: None,
            rerequest: None,
            fail,
            sched,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn layout(&self) -> &TorrentLayout {
        &self.layout
    }

    pub fn piece_priority(&self) -> &[Priority] {
        &self.piece_priority
    }

    /// Called when a commit turns a complete torrent incomplete again.
    pub fn set_rerequest_fn(&mut self, f: RerequestFn) {
        self.rerequest = Some(f);
    }

    /// Validates and stages the initial priorities, disabling files marked
    /// `-1` at the storage layer. Must run before `tie_in`.
    pub fn init_priority(&mut self, values: &[i64]) -> Result<(), SelectorError> {
        let new_priority = parse_priorities(values, self.layout.num_files())?;

        let mut files_updated = false;
        let mut result = Ok(());
        for (f, p) in new_priority.iter().enumerate() {
            if !p.is_disabled() || self.file_disabled[f] {
                continue;
            }
            if let Err(source) = self.storage.disable_file(f) {
                result = Err(SelectorError::Io {
                    action: "open partial file for",
                    path: self.file_name(f),
                    source,
                });
                break;
            }
            self.file_disabled[f] = true;
            files_updated = true;
        }
        if files_updated {
            self.storage.reset_file_status();
        }
        if let Err(e) = result {
            (self.fail)(e.to_string());
            return Err(e);
        }

        self.pending_priority = Some(new_priority);
        Ok(())
    }

    /// Restores priorities and partially downloaded pieces from resume data.
    pub fn unpickle(&mut self, data: &Bencode) -> Result<(), SelectorError> {
        if let Some(list) = data.get(b"priority") {
            let values = list
                .as_list()
                .ok_or_else(|| SelectorError::BadResumeData("priority is not a list".into()))?
                .iter()
                .map(|v| {
                    v.as_int().ok_or_else(|| {
                        SelectorError::BadResumeData("priority entry is not an integer".into())
                    })
                })
                .collect::<Result<Vec<i64>, _>>()?;
            self.init_priority(&values)?;
        }

        let staged = self.pending_priority.as_ref().unwrap_or(&self.priority);
        let blocked = disabled_bitmap(&piece_priorities(&self.layout, staged));
        self.storage.reblock(&blocked);

        let partials = self.storage.unpickle(data);
        debug!("Restored {} partial pieces", partials.len());
        if !partials.is_empty() {
            self.pending_partials = Some(partials);
        }
        Ok(())
    }

    /// Latches the picker and downloader callbacks, commits any staged
    /// priorities and re-announces restored partial pieces.
    pub fn tie_in(
        &mut self,
        picker: Box<dyn PiecePicker + Send>,
        cancel: PieceListFn,
        request_more: PieceListFn,
    ) {
        self.tie = Some(Tie {
            picker,
            cancel,
            request_more,
        });

        if self.pending_priority.is_some() {
            self.set_priorities_now();
        }

        if let Some(mut partials) = self.pending_partials.take() {
            partials.shuffle(&mut rand::rng());
            if let Some(tie) = self.tie.as_mut() {
                for piece in partials {
                    tie.picker.requested(piece);
                }
            }
        }
    }

    /// Stages `new_priority` and schedules a commit. A later call before the
    /// commit runs replaces this one.
    pub fn set_priorities(&mut self, new_priority: Vec<Priority>) -> Result<(), SelectorError> {
        let expected = self.layout.num_files();
        if new_priority.len() != expected {
            return Err(PriorityError::WrongLength {
                expected,
                actual: new_priority.len(),
            }
            .into());
        }
        self.pending_priority = Some(new_priority);
        if self.sched.send(SelectorTask::CommitPending).is_err() {
            warn!("Selector queue is closed, priorities stay staged");
        }
        Ok(())
    }

    pub fn set_priority(&mut self, file: usize, priority: Priority) -> Result<(), SelectorError> {
        let mut new_priority = self.get_priorities();
        let slot = new_priority
            .get_mut(file)
            .ok_or(SelectorError::NoSuchFile(file))?;
        *slot = priority;
        self.set_priorities(new_priority)
    }

    /// The staged priorities if a commit is pending, else the active ones.
    pub fn get_priorities(&self) -> Vec<Priority> {
        self.pending_priority
            .as_ref()
            .unwrap_or(&self.priority)
            .clone()
    }

    pub fn priority_of(&self, file: usize) -> Option<Priority> {
        self.pending_priority
            .as_ref()
            .unwrap_or(&self.priority)
            .get(file)
            .copied()
    }

    /// Resume data: the active priorities merged with the storage's own entries.
    pub fn pickle(&self) -> Bencode {
        let mut d: BTreeMap<Vec<u8>, Bencode> = self.storage.pickle();
        let priority = self
            .priority
            .iter()
            .map(|p| Bencode::Int(p.value() as i64))
            .collect();
        d.insert(b"priority".to_vec(), Bencode::List(priority));
        Bencode::Dict(d)
    }

    /// Deletes every file that is still disabled once the download is done.
    pub fn finish(&mut self) {
        for f in 0..self.priority.len() {
            if !self.priority[f].is_disabled() {
                continue;
            }
            if let Err(e) = self.storage.delete_file(f) {
                warn!("Could not delete {}: {}", self.file_name(f), e);
            }
        }
    }

    fn file_name(&self, f: usize) -> String {
        self.layout
            .file(f)
            .map(|file| file.display_path())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::PieceUpdate;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use seed_core::FileInfo;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use Priority::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Read(u32, u32, u32),
        Write(u32, u32),
        Disable(usize),
        Enable(usize),
        Delete(usize),
        Reset,
        Doublecheck(Vec<u32>),
        Reblock(Vec<bool>),
        SetPriority(u32, Priority),
        Requested(u32),
        Cancel(Vec<u32>),
        RequestMore(Vec<u32>),
        Rerequest,
    }

    type Log = Arc<Mutex<Vec<Event>>>;

    struct MockStorage {
        log: Log,
        have: Vec<bool>,
        blocked: Vec<bool>,
        partials: Vec<u32>,
        fail_disable: bool,
        fail_read: bool,
        fail_write: bool,
        doublecheck_ok: bool,
    }

    fn disk_error(name: &str) -> StorageError {
        StorageError::FileIo {
            path: PathBuf::from(name),
            source: std::io::Error::other("disk full"),
        }
    }

    impl StorageWrapper for MockStorage {
        fn has_data(&self, piece: u32) -> bool {
            self.have[piece as usize]
        }

        fn read_raw(&mut self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError> {
            self.log.lock().push(Event::Read(piece, offset, length));
            if self.fail_read {
                return Err(disk_error("a"));
            }
            Ok(Bytes::from(vec![0u8; length as usize]))
        }

        fn write_raw(&mut self, piece: u32, offset: u32, _data: &[u8]) -> Result<(), StorageError> {
            self.log.lock().push(Event::Write(piece, offset));
            if self.fail_write {
                return Err(disk_error(".partial/0"));
            }
            Ok(())
        }

        fn reblock(&mut self, blocked: &[bool]) {
            self.blocked = blocked.to_vec();
            self.log.lock().push(Event::Reblock(blocked.to_vec()));
        }

        fn disable_file(&mut self, index: usize) -> Result<(), StorageError> {
            if self.fail_disable {
                return Err(disk_error(".partial/2"));
            }
            self.log.lock().push(Event::Disable(index));
            Ok(())
        }

        fn enable_file(&mut self, index: usize) -> Result<(), StorageError> {
            self.log.lock().push(Event::Enable(index));
            Ok(())
        }

        fn delete_file(&mut self, index: usize) -> Result<(), StorageError> {
            self.log.lock().push(Event::Delete(index));
            Ok(())
        }

        // Edge-piece ranges of the a/b/c layout.
        fn get_piece_update_list(&self, index: usize) -> Vec<PieceUpdate> {
            let ranges: &[(u32, u32, u32)] = match index {
                0 => &[(0, 0, 4), (1, 0, 2)],
                1 => &[(1, 2, 2)],
                _ => &[(2, 0, 4)],
            };
            ranges
                .iter()
                .map(|&(piece, start, length)| PieceUpdate { piece, start, length })
                .collect()
        }

        fn reset_file_status(&mut self) {
            self.log.lock().push(Event::Reset);
        }

        fn doublecheck_data(&mut self, pieces: &BTreeSet<u32>) -> bool {
            self.log
                .lock()
                .push(Event::Doublecheck(pieces.iter().copied().collect()));
            self.doublecheck_ok
        }

        fn am_i_complete(&self) -> bool {
            self.have.iter().zip(&self.blocked).all(|(&h, &b)| h || b)
        }

        fn pickle(&self) -> BTreeMap<Vec<u8>, Bencode> {
            let mut d = BTreeMap::new();
            let partials = self.partials.iter().map(|&p| Bencode::Int(p as i64)).collect();
            d.insert(b"partials".to_vec(), Bencode::List(partials));
            d
        }

        fn unpickle(&mut self, data: &Bencode) -> Vec<u32> {
            data.get(b"partials")
                .and_then(|p| p.as_list())
                .map(|l| l.iter().filter_map(|v| v.as_int()).map(|v| v as u32).collect())
                .unwrap_or_default()
        }
    }

    struct MockPicker {
        log: Log,
    }

    impl PiecePicker for MockPicker {
        fn set_priority(&mut self, piece: u32, priority: Priority) {
            self.log.lock().push(Event::SetPriority(piece, priority));
        }

        fn requested(&mut self, piece: u32) {
            self.log.lock().push(Event::Requested(piece));
        }
    }

    struct Harness {
        selector: FileSelector<MockStorage>,
        rx: mpsc::UnboundedReceiver<SelectorTask>,
        log: Log,
        failures: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new(have: Vec<bool>) -> Self {
            let files = vec![
                FileInfo::new("a", 6),
                FileInfo::new("b", 2),
                FileInfo::new("c", 4),
            ];
            let layout = Arc::new(TorrentLayout::new(4, files, Vec::new()).unwrap());
            let log: Log = Arc::new(Mutex::new(Vec::new()));
            let failures = Arc::new(Mutex::new(Vec::new()));
            let storage = MockStorage {
                log: log.clone(),
                blocked: vec![false; have.len()],
                have,
                partials: Vec::new(),
                fail_disable: false,
                fail_read: false,
                fail_write: false,
                doublecheck_ok: true,
            };
            let (tx, rx) = mpsc::unbounded_channel();
            let sink = failures.clone();
            let selector = FileSelector::new(
                layout,
                storage,
                tx,
                Box::new(move |msg| sink.lock().push(msg)),
            );
            Self {
                selector,
                rx,
                log,
                failures,
            }
        }

        fn tie_in(&mut self) {
            let picker = MockPicker { log: self.log.clone() };
            let cancel_log = self.log.clone();
            let more_log = self.log.clone();
            self.selector.tie_in(
                Box::new(picker),
                Box::new(move |pieces| {
                    let mut sorted = pieces.to_vec();
                    sorted.sort();
                    cancel_log.lock().push(Event::Cancel(sorted));
                }),
                Box::new(move |pieces| {
                    let mut sorted = pieces.to_vec();
                    sorted.sort();
                    more_log.lock().push(Event::RequestMore(sorted));
                }),
            );
        }

        fn drain(&mut self) {
            while let Ok(task) = self.rx.try_recv() {
                self.selector.handle_task(task);
            }
        }

        fn take_log(&self) -> Vec<Event> {
            std::mem::take(&mut *self.log.lock())
        }

        fn position(log: &[Event], event: &Event) -> usize {
            log.iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("{:?} missing from {:?}", event, log))
        }

        fn set_priority_calls(log: &[Event]) -> Vec<(u32, Priority)> {
            let mut calls: Vec<_> = log
                .iter()
                .filter_map(|e| match e {
                    Event::SetPriority(p, pr) => Some((*p, *pr)),
                    _ => None,
                })
                .collect();
            calls.sort_by_key(|(p, _)| *p);
            calls
        }
    }

    #[test]
    fn test_fold_on_tie_in() {
        let mut h = Harness::new(vec![false; 3]);
        h.selector.init_priority(&[1, 0, 2]).unwrap();
        h.tie_in();
        assert_eq!(h.selector.piece_priority(), &[Highest, Highest, Lowest]);
        let log = h.take_log();
        assert_eq!(
            Harness::set_priority_calls(&log),
            vec![(0, Highest), (1, Highest), (2, Lowest)]
        );
        assert!(log.contains(&Event::Reblock(vec![false, false, false])));
    }

    #[test]
    fn test_disable_relocates_and_cancels() {
        let mut h = Harness::new(vec![true; 3]);
        h.selector.init_priority(&[1, 1, 1]).unwrap();
        h.tie_in();
        h.take_log();

        h.selector.set_priorities(vec![Disabled, Normal, Normal]).unwrap();
        h.drain();
        let log = h.take_log();

        let disable = Harness::position(&log, &Event::Disable(0));
        assert!(Harness::position(&log, &Event::Read(0, 0, 4)) < disable);
        assert!(Harness::position(&log, &Event::Read(1, 0, 2)) < disable);
        let reset = Harness::position(&log, &Event::Reset);
        assert!(disable < reset);
        assert!(reset < Harness::position(&log, &Event::Write(0, 0)));
        assert!(reset < Harness::position(&log, &Event::Write(1, 0)));
        assert!(log.contains(&Event::Doublecheck(vec![0, 1])));

        assert_eq!(
            Harness::set_priority_calls(&log),
            vec![(0, Disabled), (1, Normal), (2, Normal)]
        );
        let cancel = Harness::position(&log, &Event::Cancel(vec![0]));
        let reblock = Harness::position(&log, &Event::Reblock(vec![true, false, false]));
        assert!(cancel < reblock);
        assert!(!log.iter().any(|e| matches!(e, Event::RequestMore(_))));
        assert!(h.failures.lock().is_empty());
    }

    #[test]
    fn test_reenable_requests_more_after_reblock() {
        let mut h = Harness::new(vec![true; 3]);
        h.selector.init_priority(&[1, 1, 1]).unwrap();
        h.tie_in();
        h.selector.set_priorities(vec![Disabled, Normal, Normal]).unwrap();
        h.drain();
        h.take_log();

        h.selector.set_priorities(vec![Normal, Normal, Normal]).unwrap();
        h.drain();
        let log = h.take_log();

        assert!(log.contains(&Event::Enable(0)));
        assert!(!log.iter().any(|e| matches!(e, Event::Cancel(_))));
        let reblock = Harness::position(&log, &Event::Reblock(vec![false, false, false]));
        let more = Harness::position(&log, &Event::RequestMore(vec![0]));
        assert!(reblock < more);
    }

    #[test]
    fn test_unchanged_priorities_touch_no_files() {
        let mut h = Harness::new(vec![true; 3]);
        h.selector.init_priority(&[1, -1, 1]).unwrap();
        h.tie_in();
        h.take_log();

        let current = h.selector.get_priorities();
        h.selector.set_priorities(current).unwrap();
        h.drain();
        let log = h.take_log();
        assert!(!log.iter().any(|e| matches!(
            e,
            Event::Disable(_) | Event::Enable(_) | Event::Cancel(_) | Event::RequestMore(_)
        )));
        let reblocks = log.iter().filter(|e| matches!(e, Event::Reblock(_))).count();
        assert_eq!(reblocks, 1);
    }

    #[test]
    fn test_last_staged_commit_wins() {
        let mut h = Harness::new(vec![false; 3]);
        h.selector.init_priority(&[1, 1, 1]).unwrap();
        h.tie_in();
        h.take_log();

        h.selector.set_priorities(vec![Lowest, Lowest, Lowest]).unwrap();
        h.selector.set_priority(2, Highest).unwrap();
        assert_eq!(h.selector.get_priorities(), vec![Lowest, Lowest, Highest]);
        h.drain();
        let log = h.take_log();
        let reblocks = log.iter().filter(|e| matches!(e, Event::Reblock(_))).count();
        assert_eq!(reblocks, 1);
        assert_eq!(h.selector.piece_priority(), &[Lowest, Lowest, Highest]);
    }

    #[test]
    fn test_staged_before_tie_in_is_applied_at_tie_in() {
        let mut h = Harness::new(vec![false; 3]);
        h.selector.set_priorities(vec![Normal, Disabled, Normal]).unwrap();
        h.drain();
        assert_eq!(h.selector.get_priorities(), vec![Normal, Disabled, Normal]);
        assert!(h.take_log().is_empty());

        h.tie_in();
        let log = h.take_log();
        assert!(log.contains(&Event::Disable(1)));
        assert_eq!(h.selector.piece_priority(), &[Normal, Normal, Normal]);
    }

    #[test]
    fn test_bad_priority_has_no_side_effects() {
        let mut h = Harness::new(vec![false; 3]);
        let err = h.selector.init_priority(&[1, 5, -1]).unwrap_err();
        assert!(matches!(err, SelectorError::BadPriority(PriorityError::InvalidValue(5))));
        let err = h.selector.init_priority(&[1, 1]).unwrap_err();
        assert!(matches!(err, SelectorError::BadPriority(PriorityError::WrongLength { .. })));
        assert!(h.take_log().is_empty());
        assert!(h.selector.set_priority(7, Highest).is_err());
    }

    #[test]
    fn test_disable_failure_calls_fail_fn() {
        let mut h = Harness::new(vec![false; 3]);
        h.selector.init_priority(&[1, 1, 1]).unwrap();
        h.tie_in();
        h.take_log();

        h.selector.storage_mut().fail_disable = true;
        h.selector.set_priorities(vec![Normal, Normal, Disabled]).unwrap();
        h.drain();

        let failures = h.failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("c"), "{}", failures[0]);
        assert!(!h.take_log().iter().any(|e| matches!(e, Event::Reblock(_))));
    }

    // Nothing past the failed relocation step may reach the picker or storage blocks.
    fn assert_no_piece_updates(log: &[Event]) {
        assert!(
            !log.iter().any(|e| matches!(
                e,
                Event::SetPriority(..) | Event::Cancel(_) | Event::Reblock(_) | Event::RequestMore(_)
            )),
            "{:?}",
            log
        );
    }

    #[test]
    fn test_buffer_read_failure_aborts_before_switching_files() {
        let mut h = Harness::new(vec![true; 3]);
        h.selector.init_priority(&[1, 1, 1]).unwrap();
        h.tie_in();
        h.take_log();

        h.selector.storage_mut().fail_read = true;
        h.selector.set_priorities(vec![Disabled, Normal, Normal]).unwrap();
        h.drain();
        let log = h.take_log();

        assert_eq!(log, vec![Event::Read(0, 0, 4)]);
        assert_no_piece_updates(&log);
        let failures = h.failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("relocation failed"), "{}", failures[0]);
        assert_eq!(h.selector.piece_priority(), &[Normal, Normal, Normal]);
    }

    #[test]
    fn test_replay_write_failure_is_fatal() {
        let mut h = Harness::new(vec![true; 3]);
        h.selector.init_priority(&[1, 1, 1]).unwrap();
        h.tie_in();
        h.take_log();

        h.selector.storage_mut().fail_write = true;
        h.selector.set_priorities(vec![Disabled, Normal, Normal]).unwrap();
        h.drain();
        let log = h.take_log();

        let disable = Harness::position(&log, &Event::Disable(0));
        let reset = Harness::position(&log, &Event::Reset);
        let write = Harness::position(&log, &Event::Write(0, 0));
        assert!(disable < reset && reset < write);
        assert!(!log.contains(&Event::Write(1, 0)));
        assert!(!log.iter().any(|e| matches!(e, Event::Doublecheck(_))));
        assert_no_piece_updates(&log);
        assert_eq!(h.failures.lock().len(), 1);
    }

    #[test]
    fn test_doublecheck_mismatch_skips_picker_update() {
        let mut h = Harness::new(vec![true; 3]);
        h.selector.init_priority(&[1, 1, 1]).unwrap();
        h.tie_in();
        h.take_log();

        h.selector.storage_mut().doublecheck_ok = false;
        h.selector.set_priorities(vec![Disabled, Normal, Normal]).unwrap();
        h.drain();
        let log = h.take_log();

        let write = Harness::position(&log, &Event::Write(1, 0));
        let check = Harness::position(&log, &Event::Doublecheck(vec![0, 1]));
        assert!(write < check);
        assert_eq!(check, log.len() - 1);
        assert_no_piece_updates(&log);
        let failures = h.failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("[0, 1]"), "{}", failures[0]);
    }

    #[test]
    fn test_all_disabled_blocks_every_piece() {
        let mut h = Harness::new(vec![false; 3]);
        h.selector.init_priority(&[-1, -1, -1]).unwrap();
        h.tie_in();
        let log = h.take_log();
        assert!(log.contains(&Event::Reblock(vec![true, true, true])));
        assert!(h.selector.piece_priority().iter().all(|p| p.is_disabled()));
    }

    #[test]
    fn test_pickle_unpickle_restores_priorities_and_partials() {
        let mut h = Harness::new(vec![false; 3]);
        h.selector.init_priority(&[-1, 0, 2]).unwrap();
        h.tie_in();
        h.selector.storage_mut().partials = vec![1, 2];
        let encoded = h.selector.pickle().encode();
        let blob = seed_core::bencoding::decode_all(&encoded).unwrap();

        let mut restored = Harness::new(vec![false; 3]);
        restored.selector.unpickle(&blob).unwrap();
        let log = restored.take_log();
        let disable = Harness::position(&log, &Event::Disable(0));
        let reblock = Harness::position(&log, &Event::Reblock(vec![true, false, false]));
        assert!(disable < reblock);

        restored.tie_in();
        assert_eq!(restored.selector.get_priorities(), vec![Disabled, Highest, Lowest]);
        let mut requested: Vec<u32> = restored
            .take_log()
            .into_iter()
            .filter_map(|e| match e {
                Event::Requested(p) => Some(p),
                _ => None,
            })
            .collect();
        requested.sort();
        assert_eq!(requested, vec![1, 2]);
    }

    #[test]
    fn test_rerequest_when_completion_is_lost() {
        let mut h = Harness::new(vec![true, true, false]);
        h.selector.init_priority(&[1, 1, -1]).unwrap();
        let log = h.log.clone();
        h.selector
            .set_rerequest_fn(Box::new(move || log.lock().push(Event::Rerequest)));
        h.tie_in();
        assert!(h.selector.storage().am_i_complete());
        h.take_log();

        h.selector.set_priorities(vec![Normal, Normal, Normal]).unwrap();
        h.drain();
        assert!(h.take_log().contains(&Event::Rerequest));
    }

    #[test]
    fn test_finish_deletes_disabled_files() {
        let mut h = Harness::new(vec![false; 3]);
        h.selector.init_priority(&[1, -1, 1]).unwrap();
        h.tie_in();
        h.take_log();
        h.selector.finish();
        assert_eq!(h.take_log(), vec![Event::Delete(1)]);
    }
}
