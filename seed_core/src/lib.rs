//! Core library for the onionseed client.
//!
//! This library holds the network-free building blocks: the piece layout of a
//! multi-file torrent, file and piece priorities, bencoded resume data, piece
//! digests and the SOCKS5 wire format.

pub mod bencoding;
pub mod hash;
pub mod layout;
pub mod priority;
pub mod socks5;

pub use layout::{FileInfo, FileSpan, LayoutError, TorrentLayout};
pub use priority::{Priority, PriorityError};
