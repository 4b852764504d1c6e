//! File and piece priorities.

use crate::layout::TorrentLayout;
use std::fmt;
use thiserror::Error;

/// Download priority of a file or piece. Lower values are more urgent;
/// `Disabled` means the data is not wanted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    Disabled,
    Highest,
    #[default]
    Normal,
    Lowest,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriorityError {
    #[error("invalid priority value {0}, expected one of -1, 0, 1, 2")]
    InvalidValue(i64),

    #[error("priority vector has {actual} entries, torrent has {expected} files")]
    WrongLength { expected: usize, actual: usize },
}

impl Priority {
    pub fn value(self) -> i8 {
        match self {
            Priority::Disabled => -1,
            Priority::Highest => 0,
            Priority::Normal => 1,
            Priority::Lowest => 2,
        }
    }

    pub fn is_disabled(self) -> bool {
        self == Priority::Disabled
    }
}

impl TryFrom<i64> for Priority {
    type Error = PriorityError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            -1 => Ok(Priority::Disabled),
            0 => Ok(Priority::Highest),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::Lowest),
            other => Err(PriorityError::InvalidValue(other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Converts raw integers into a priority vector for `num_files` files.
pub fn parse_priorities(values: &[i64], num_files: usize) -> Result<Vec<Priority>, PriorityError> {
    if values.len() != num_files {
        return Err(PriorityError::WrongLength {
            expected: num_files,
            actual: values.len(),
        });
    }
    values.iter().map(|&v| Priority::try_from(v)).collect()
}

/// Folds per-file priorities into per-piece priorities.
///
/// A piece takes the most urgent priority among the enabled files that
/// overlap it, and stays `Disabled` only when every overlapping file is.
pub fn piece_priorities(layout: &TorrentLayout, file_priority: &[Priority]) -> Vec<Priority> {
    let mut pieces = vec![Priority::Disabled; layout.piece_count() as usize];
    for (index, &p) in file_priority.iter().enumerate() {
        if p.is_disabled() {
            continue;
        }
        for piece in layout.file_pieces(index) {
            let slot = &mut pieces[piece as usize];
            if slot.is_disabled() || p.value() < slot.value() {
                *slot = p;
            }
        }
    }
    pieces
}

/// Bitmap of pieces whose priority is `Disabled`.
pub fn disabled_bitmap(piece_priority: &[Priority]) -> Vec<bool> {
    piece_priority.iter().map(|p| p.is_disabled()).collect()
}
