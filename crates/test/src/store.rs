//! In-memory block and state stores.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tenderbft_core_types::{
    Block, BlockId, BlockMeta, BlockStore, BoxError, ChainState, Commit, ExtendedCommit, Height,
    PartSet, StateStore,
};

struct StoredBlock {
    block: Block,
    block_id: BlockId,
    seen_commit: Commit,
    extended_commit: Option<ExtendedCommit>,
}

/// An in-memory [`BlockStore`].
#[derive(Default)]
pub struct MemBlockStore {
    blocks: Mutex<BTreeMap<u64, StoredBlock>>,
}

impl MemBlockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemBlockStore {
    fn height(&self) -> Height {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .keys()
            .next_back()
            .copied()
            .map(Height::new)
            .unwrap_or(Height::ZERO)
    }

    fn base(&self) -> Height {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .keys()
            .next()
            .copied()
            .map(Height::new)
            .unwrap_or(Height::ZERO)
    }

    fn save_block(&self, block: Block, parts: &PartSet, seen_commit: Commit) {
        let height = block.header.height;
        let block_id = BlockId::new(block.hash(), parts.header());

        self.blocks.lock().unwrap().insert(
            height.as_u64(),
            StoredBlock {
                block,
                block_id,
                seen_commit,
                extended_commit: None,
            },
        );
    }

    fn save_block_with_extended_commit(
        &self,
        block: Block,
        parts: &PartSet,
        seen_ext_commit: ExtendedCommit,
    ) {
        let height = block.header.height;
        let block_id = BlockId::new(block.hash(), parts.header());
        let seen_commit = seen_ext_commit.strip_extensions();

        self.blocks.lock().unwrap().insert(
            height.as_u64(),
            StoredBlock {
                block,
                block_id,
                seen_commit,
                extended_commit: Some(seen_ext_commit),
            },
        );
    }

    fn load_block(&self, height: Height) -> Option<Block> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height.as_u64())
            .map(|stored| stored.block.clone())
    }

    fn load_block_commit(&self, height: Height) -> Option<Commit> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height.as_u64())
            .map(|stored| stored.seen_commit.clone())
    }

    fn load_seen_commit(&self) -> Option<Commit> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .values()
            .next_back()
            .map(|stored| stored.seen_commit.clone())
    }

    fn load_block_extended_commit(&self, height: Height) -> Option<ExtendedCommit> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height.as_u64())
            .and_then(|stored| stored.extended_commit.clone())
    }

    fn load_block_meta(&self, height: Height) -> Option<BlockMeta> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height.as_u64())
            .map(|stored| BlockMeta {
                block_id: stored.block_id,
                header: stored.block.header.clone(),
            })
    }
}

/// An in-memory [`StateStore`] that the test executor writes back to on
/// every applied block, so a restarted node picks up where it left off.
pub struct MemStateStore {
    state: Mutex<ChainState>,
}

impl MemStateStore {
    /// Create a store holding the given state.
    pub fn new(state: ChainState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Overwrite the stored state.
    pub fn save(&self, state: ChainState) {
        *self.state.lock().unwrap() = state;
    }
}

impl StateStore for MemStateStore {
    fn load(&self) -> Result<ChainState, BoxError> {
        Ok(self.state.lock().unwrap().clone())
    }
}
