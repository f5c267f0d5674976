pub mod block;
pub mod file;
pub mod types;

pub use block::{AccountBlock, BlockType, SnapshotBlock};
pub use file::CompressedFileMeta;
pub use types::{Address, Hash, HashHeight};
