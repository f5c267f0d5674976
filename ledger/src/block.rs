use serde::{Deserialize, Serialize};

use crate::{Address, Hash};

/// A block in the global snapshot chain.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotBlock {
    pub hash: Hash,
    pub prev_hash: Hash,
    pub height: u64,
    pub timestamp: u64,
}

impl SnapshotBlock {
    /// Build a block on top of `prev_hash` and seal its hash.
    pub fn new(prev_hash: Hash, height: u64, timestamp: u64) -> Self {
        let mut block = Self {
            hash: Hash::zero(),
            prev_hash,
            height,
            timestamp,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn genesis() -> Self {
        Self::new(Hash::zero(), 0, 0)
    }

    pub fn compute_hash(&self) -> Hash {
        let mut data = Vec::with_capacity(48);
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(&self.height.to_be_bytes());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        Hash::digest(&data)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    #[default]
    Send,
    Receive,
}

/// A block on a single account chain.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBlock {
    pub hash: Hash,
    pub prev_hash: Hash,
    pub account_address: Address,
    pub height: u64,
    pub block_type: BlockType,
    /// Send block being received; zero for send blocks.
    pub from_block_hash: Hash,
    pub amount: u64,
    /// Snapshot height this block was included at.
    pub snapshot_height: u64,
}

impl AccountBlock {
    pub fn new_send(
        account_address: Address,
        prev_hash: Hash,
        height: u64,
        amount: u64,
        snapshot_height: u64,
    ) -> Self {
        let mut block = Self {
            hash: Hash::zero(),
            prev_hash,
            account_address,
            height,
            block_type: BlockType::Send,
            from_block_hash: Hash::zero(),
            amount,
            snapshot_height,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn new_receive(
        account_address: Address,
        prev_hash: Hash,
        height: u64,
        from_block_hash: Hash,
        snapshot_height: u64,
    ) -> Self {
        let mut block = Self {
            hash: Hash::zero(),
            prev_hash,
            account_address,
            height,
            block_type: BlockType::Receive,
            from_block_hash,
            amount: 0,
            snapshot_height,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn is_send(&self) -> bool {
        self.block_type == BlockType::Send
    }

    pub fn compute_hash(&self) -> Hash {
        let mut data = Vec::with_capacity(128);
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(&self.account_address.0);
        data.extend_from_slice(&self.height.to_be_bytes());
        data.push(match self.block_type {
            BlockType::Send => 0,
            BlockType::Receive => 1,
        });
        data.extend_from_slice(self.from_block_hash.as_bytes());
        data.extend_from_slice(&self.amount.to_be_bytes());
        data.extend_from_slice(&self.snapshot_height.to_be_bytes());
        Hash::digest(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snapshot_block_hash_is_sealed() {
        let genesis = SnapshotBlock::genesis();
        let next = SnapshotBlock::new(genesis.hash, 1, 1_000);
        assert_eq!(next.hash, next.compute_hash());
        assert_ne!(next.hash, genesis.hash);
        assert_eq!(next.prev_hash, genesis.hash);
    }

    #[test]
    fn test_account_block_kinds() {
        let addr = Address([1; 20]);
        let send = AccountBlock::new_send(addr, Hash::zero(), 1, 10, 5);
        let recv = AccountBlock::new_receive(addr, send.hash, 2, send.hash, 6);
        assert!(send.is_send());
        assert!(!recv.is_send());
        assert_eq!(recv.from_block_hash, send.hash);
        assert_ne!(send.hash, recv.hash);
    }

    #[test]
    fn test_snapshot_block_json_uses_camel_case() {
        let block = SnapshotBlock::new(Hash::zero(), 7, 42);
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["height"], 7);
        assert!(json.get("prevHash").is_some());
    }
}
