//! A simple, volatile, in-memory implementation of [`DataStore`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use block_consensus::{
    pluggables::{DataStore, StoreError},
    types::{
        consensus_log::{ConsensusLog, Phase},
        data_block::{BlockStatus, DataBlock},
        data_types::{BlockId, SliceNumber},
    },
};

#[derive(Default)]
struct Contents {
    blocks: HashMap<(BlockId, SliceNumber), DataBlock>,
    logs: Vec<ConsensusLog>,
    rejection: Option<String>,
    fail_writes: bool,
    fail_block_writes: bool,
}

/// An in-memory implementation of [`DataStore`]. Clones share the same contents.
#[derive(Clone, Default)]
pub(crate) struct MemStore(Arc<Mutex<Contents>>);

impl MemStore {
    /// Create a new, empty `MemStore`.
    pub(crate) fn new() -> MemStore {
        MemStore::default()
    }

    pub(crate) fn block(&self, block_id: &BlockId, slice_number: SliceNumber) -> Option<DataBlock> {
        self.0
            .lock()
            .unwrap()
            .blocks
            .get(&(block_id.clone(), slice_number))
            .cloned()
    }

    pub(crate) fn status(&self, block_id: &BlockId, slice_number: SliceNumber) -> Option<BlockStatus> {
        self.block(block_id, slice_number).map(|block| block.status)
    }

    pub(crate) fn logs(&self) -> Vec<ConsensusLog> {
        self.0.lock().unwrap().logs.clone()
    }

    pub(crate) fn logs_at(&self, phase: Phase) -> Vec<ConsensusLog> {
        self.logs().into_iter().filter(|log| log.status == phase).collect()
    }

    /// Make `validate` reject every block with `reason`.
    pub(crate) fn reject_blocks(&self, reason: &str) {
        self.0.lock().unwrap().rejection = Some(reason.to_string());
    }

    /// Make every write fail with a backend error.
    pub(crate) fn fail_writes(&self) {
        self.0.lock().unwrap().fail_writes = true;
    }

    /// Make every write of a block fail with a backend error. Consensus logs are still written.
    pub(crate) fn fail_block_writes(&self) {
        self.0.lock().unwrap().fail_block_writes = true;
    }

    fn check_writable(contents: &Contents) -> Result<(), StoreError> {
        if contents.fail_writes {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        Ok(())
    }

    fn check_block_writable(contents: &Contents) -> Result<(), StoreError> {
        if contents.fail_block_writes {
            return Err(StoreError::Backend("block volume full".to_string()));
        }
        MemStore::check_writable(contents)
    }
}

impl DataStore for MemStore {
    fn validate(&self, _block: &DataBlock) -> Result<(), StoreError> {
        match &self.0.lock().unwrap().rejection {
            Some(reason) => Err(StoreError::Rejected(reason.clone())),
            None => Ok(()),
        }
    }

    fn store_value(&self, block: &DataBlock) -> Result<(), StoreError> {
        let mut contents = self.0.lock().unwrap();
        MemStore::check_block_writable(&contents)?;
        contents
            .blocks
            .insert((block.block_id.clone(), block.slice_number), block.clone());
        Ok(())
    }

    fn update_status(
        &self,
        block_id: &BlockId,
        slice_number: SliceNumber,
        status: BlockStatus,
    ) -> Result<(), StoreError> {
        let mut contents = self.0.lock().unwrap();
        MemStore::check_block_writable(&contents)?;
        match contents.blocks.get_mut(&(block_id.clone(), slice_number)) {
            Some(block) => {
                block.status = status;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                block_id: block_id.clone(),
                slice_number,
            }),
        }
    }

    fn delete(&self, block_id: &BlockId, slice_number: SliceNumber) -> Result<(), StoreError> {
        let mut contents = self.0.lock().unwrap();
        MemStore::check_block_writable(&contents)?;
        contents.blocks.remove(&(block_id.clone(), slice_number));
        Ok(())
    }

    fn find(&self, block_id: &BlockId, slice_number: SliceNumber) -> Result<Option<DataBlock>, StoreError> {
        Ok(self.block(block_id, slice_number))
    }

    fn insert_log(&self, log: &ConsensusLog) -> Result<(), StoreError> {
        let mut contents = self.0.lock().unwrap();
        MemStore::check_writable(&contents)?;
        contents.logs.push(log.clone());
        Ok(())
    }
}
