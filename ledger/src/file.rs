use serde::{Deserialize, Serialize};

use crate::Hash;

/// Descriptor of a compressed bundle of historical blocks served in bulk.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedFileMeta {
    pub filename: String,
    pub file_size: u64,
    pub start_height: u64,
    pub end_height: u64,
    pub blocks_count: u64,
    /// Hash of the compressed content.
    pub hash: Hash,
}

impl CompressedFileMeta {
    /// Whether `height` falls inside this file.
    pub fn covers(&self, height: u64) -> bool {
        self.start_height <= height && height <= self.end_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(99, false)]
    #[case(100, true)]
    #[case(150, true)]
    #[case(200, true)]
    #[case(201, false)]
    fn test_covers(#[case] height: u64, #[case] expected: bool) {
        let meta = CompressedFileMeta {
            start_height: 100,
            end_height: 200,
            ..Default::default()
        };
        assert_eq!(meta.covers(height), expected);
    }
}
