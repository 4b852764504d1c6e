//! Applying a staged priority vector.

use super::FileSelector;
use crate::error::SelectorError;
use crate::storage::StorageWrapper;
use bytes::Bytes;
use rand::seq::SliceRandom;
use seed_core::Priority;
use seed_core::priority::{disabled_bitmap, piece_priorities};
use std::collections::BTreeSet;
use tracing::{debug, error, info};

impl<S: StorageWrapper> FileSelector<S> {
    /// Commits the staged priorities if the picker is tied in. Failures stop
    /// the torrent through the fail callback.
    pub(crate) fn set_priorities_now(&mut self) {
        if self.tie.is_none() {
            return;
        }
        let Some(new_priority) = self.pending_priority.take() else {
            return;
        };
        if let Err(e) = self.commit(new_priority) {
            error!("Priority change failed: {}", e);
            (self.fail)(e.to_string());
        }
    }

    fn commit(&mut self, new_priority: Vec<Priority>) -> Result<(), SelectorError> {
        let was_complete = self.storage.am_i_complete();

        let flips: Vec<(usize, bool)> = new_priority
            .iter()
            .enumerate()
            .filter(|&(f, p)| p.is_disabled() != self.file_disabled[f])
            .map(|(f, p)| (f, p.is_disabled()))
            .collect();
        if !flips.is_empty() {
            self.relocate(&flips)?;
        }

        self.priority = new_priority;
        let new_piece_priority = piece_priorities(&self.layout, &self.priority);
        self.apply_piece_priority(new_piece_priority);

        if was_complete && !self.storage.am_i_complete() {
            info!("Torrent is no longer complete, re-announcing");
            if let Some(rerequest) = self.rerequest.as_mut() {
                rerequest();
            }
        }
        Ok(())
    }

    /// Moves the edge-piece bytes of each flipped file between the real file
    /// and its partial file.
    fn relocate(&mut self, flips: &[(usize, bool)]) -> Result<(), SelectorError> {
        let mut buffered: Vec<(u32, u32, Bytes)> = Vec::new();
        for &(f, _) in flips {
            for update in self.storage.get_piece_update_list(f) {
                if !self.storage.has_data(update.piece) {
                    continue;
                }
                let data = self
                    .storage
                    .read_raw(update.piece, update.start, update.length)
                    .map_err(SelectorError::Relocation)?;
                buffered.push((update.piece, update.start, data));
            }
        }

        let mut files_updated = false;
        let mut result = Ok(());
        for &(f, disable) in flips {
            let (action, outcome) = if disable {
                ("create partial file for", self.storage.disable_file(f))
            } else {
                ("open", self.storage.enable_file(f))
            };
            if let Err(source) = outcome {
                result = Err(SelectorError::Io {
                    action,
                    path: self.file_name(f),
                    source,
                });
                break;
            }
            self.file_disabled[f] = disable;
            files_updated = true;
            debug!("File {} is now {}", f, if disable { "disabled" } else { "enabled" });
        }
        if files_updated {
            self.storage.reset_file_status();
        }
        result?;

        let mut changed = BTreeSet::new();
        for (piece, start, data) in buffered {
            self.storage
                .write_raw(piece, start, &data)
                .map_err(SelectorError::Relocation)?;
            changed.insert(piece);
        }
        if !self.storage.doublecheck_data(&changed) {
            return Err(SelectorError::HashMismatch(changed.into_iter().collect()));
        }
        Ok(())
    }

    fn apply_piece_priority(&mut self, new_piece_priority: Vec<Priority>) {
        let Some(tie) = self.tie.as_mut() else {
            self.piece_priority = new_piece_priority;
            return;
        };

        let mut pieces: Vec<u32> = (0..new_piece_priority.len() as u32).collect();
        pieces.shuffle(&mut rand::rng());

        let mut new_blocked = Vec::new();
        let mut new_unblocked = Vec::new();
        for piece in pieces {
            let new = new_piece_priority[piece as usize];
            tie.picker.set_priority(piece, new);
            let old = self.piece_priority[piece as usize];
            match (old.is_disabled(), new.is_disabled()) {
                (false, true) => new_blocked.push(piece),
                (true, false) => new_unblocked.push(piece),
                _ => {}
            }
        }

        if !new_blocked.is_empty() {
            (tie.cancel)(&new_blocked);
        }
        self.storage.reblock(&disabled_bitmap(&new_piece_priority));
        if !new_unblocked.is_empty() {
            (tie.request_more)(&new_unblocked);
        }
        self.piece_priority = new_piece_priority;
    }
}
