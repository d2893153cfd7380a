/*!

The registry of live blocks: an append-indexed table supporting O(1)
removal by swapping with the last entry. The block moved into the vacated
slot has its `id` rewritten in place, so `registry[i].id == i` holds after
every operation and no caller ever has to index past the live length.

*/

use crate::core::gc::block::BlockPtr;

pub(crate) struct BlockRegistry {
  blocks: Vec<BlockPtr>,
}

impl BlockRegistry {
  pub fn new() -> Self {
    BlockRegistry { blocks: Vec::new() }
  }

  #[inline(always)]
  pub fn len(&self) -> usize {
    self.blocks.len()
  }

  #[inline(always)]
  pub fn is_empty(&self) -> bool {
    self.blocks.is_empty()
  }

  #[inline(always)]
  pub fn get(&self, idx: usize) -> BlockPtr {
    assert!(idx < self.blocks.len());
    self.blocks[idx]
  }

  /// Appends a block whose `id` must already equal the current length.
  pub fn add(&mut self, blk: BlockPtr) {
    debug_assert_eq!(unsafe { (*blk).id }, self.blocks.len());
    self.blocks.push(blk);
  }

  /// Swap-removes the entry at `idx`, fixing up the id of the block that
  /// takes its place.
  pub fn remove(&mut self, idx: usize) {
    assert!(idx < self.blocks.len());
    let last = self.blocks.pop().expect("remove from empty registry");
    if idx < self.blocks.len() {
      self.blocks[idx] = last;
      unsafe {
        (*last).id = idx;
      }
    }
  }

  /// Empties the registry, handing every block to the caller. Used at
  /// shutdown.
  pub fn drain(&mut self) -> Vec<BlockPtr> {
    std::mem::take(&mut self.blocks)
  }

  #[cfg(test)]
  pub fn iter(&self) -> impl Iterator<Item = BlockPtr> + '_ {
    self.blocks.iter().copied()
  }
}
