//! Piece picker interface driven by the file selector.

use parking_lot::Mutex;
use rand::Rng;
use seed_core::Priority;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What the file selector needs from a piece picker.
pub trait PiecePicker {
    /// Idempotent and cheap.
    fn set_priority(&mut self, piece: u32, priority: Priority);

    /// Marks `piece` as having outstanding blocks from a previous session.
    fn requested(&mut self, piece: u32);
}

impl<P: PiecePicker> PiecePicker for Arc<Mutex<P>> {
    fn set_priority(&mut self, piece: u32, priority: Priority) {
        self.lock().set_priority(piece, priority);
    }

    fn requested(&mut self, piece: u32) {
        self.lock().requested(piece);
    }
}

/// A small picker that honours piece priorities.
///
/// Pieces already started are finished first; otherwise the most urgent
/// priority wins and ties are broken uniformly at random.
pub struct PriorityPicker {
    priority: Vec<Priority>,
    complete: Vec<bool>,
    started: BTreeSet<u32>,
}

impl PriorityPicker {
    pub fn new(piece_count: u32) -> Self {
        Self {
            priority: vec![Priority::Normal; piece_count as usize],
            complete: vec![false; piece_count as usize],
            started: BTreeSet::new(),
        }
    }

    pub fn priority(&self, piece: u32) -> Priority {
        self.priority[piece as usize]
    }

    pub fn is_started(&self, piece: u32) -> bool {
        self.started.contains(&piece)
    }

    pub fn complete(&mut self, piece: u32) {
        self.complete[piece as usize] = true;
        self.started.remove(&piece);
    }

    /// Chooses the next piece to request among those `peer_has` reports.
    pub fn next_piece(&mut self, peer_has: impl Fn(u32) -> bool) -> Option<u32> {
        let wanted = |p: u32| {
            !self.complete[p as usize] && !self.priority[p as usize].is_disabled() && peer_has(p)
        };

        let resumed: Vec<u32> = self.started.iter().copied().filter(|&p| wanted(p)).collect();
        let pool: Vec<u32> = if resumed.is_empty() {
            (0..self.priority.len() as u32).filter(|&p| wanted(p)).collect()
        } else {
            resumed
        };

        let best = pool.iter().map(|&p| self.priority[p as usize].value()).min()?;
        let available: Vec<u32> = pool
            .into_iter()
            .filter(|&p| self.priority[p as usize].value() == best)
            .collect();

        let mut rng = rand::rng();
        let piece = available[rng.random_range(0..available.len())];
        self.started.insert(piece);
        Some(piece)
    }
}

impl PiecePicker for PriorityPicker {
    fn set_priority(&mut self, piece: u32, priority: Priority) {
        self.priority[piece as usize] = priority;
    }

    fn requested(&mut self, piece: u32) {
        self.started.insert(piece);
    }
}
