pub mod bencode;
pub mod decoder;

pub use bencode::Bencode;
pub use decoder::{decode, decode_all};
