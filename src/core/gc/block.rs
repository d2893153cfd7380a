/*!

The `Block` header prepended to every managed allocation.

```text
┌─────────────────────────────┐ ← returned by the alloc hook
│ Block                       │
│   sentinel of backlink list │
│   id, size, dtor, flags     │
├─────────────────────────────┤ ← payload pointer handed to the user
│ user payload                │
└─────────────────────────────┘
```

The sentinel is an ordinary `Link` embedded in the header: an empty list
points at itself, and insertion before/after the sentinel gives the
back/front of the list. The payload sits at exactly `size_of::<Block>()`
bytes past the header, so a payload pointer converts back to its header
with one pointer subtraction.

*/

use std::ptr::{self, null_mut};

use enumflags2::{bitflags, BitFlags};

use crate::core::{
  gc::link::{Link, LinkPtr},
  Void,
};

pub(crate) type BlockPtr = *mut Block;

/// Type-erased finaliser run on the payload before the memory is released.
pub(crate) type DtorFn = unsafe fn(*mut Void);

#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) enum BlockFlag {
  /// Reached by the search episode currently in flight.
  Visited,
  /// Finaliser has run; the memory itself is not yet released.
  Finalized,
}

pub(crate) type BlockFlags = BitFlags<BlockFlag, u8>;

pub(crate) struct Block {
  /// Sentinel of the circular backlink list. `sentinel.next` is the first
  /// incoming link, `sentinel.prev` the last.
  sentinel: Link,
  /// Position in the registry. Rewritten when a swap-removal moves us.
  pub(crate) id: usize,
  /// Total allocation size (header + payload), kept for the free hook.
  size : usize,
  dtor : DtorFn,
  flags: BlockFlags,
}

impl Block {
  /// Writes a fresh header into raw memory and points the sentinel at
  /// itself. The memory must be at least `size` bytes.
  pub unsafe fn init(blk: BlockPtr, id: usize, size: usize, dtor: DtorFn) {
    ptr::write(
      blk,
      Block {
        sentinel: Link::detached(null_mut()),
        id,
        size,
        dtor,
        flags: BlockFlags::empty(),
      },
    );
    let sentinel = ptr::addr_of_mut!((*blk).sentinel);
    (*sentinel).next = sentinel;
    (*sentinel).prev = sentinel;
  }

  #[inline(always)]
  pub fn sentinel_ptr(&mut self) -> LinkPtr {
    &mut self.sentinel
  }

  /// Head of the backlink list; equals the sentinel when the list is empty.
  #[inline(always)]
  pub fn first_backlink(&mut self) -> LinkPtr {
    self.sentinel.next
  }

  #[inline(always)]
  pub fn payload(&self) -> *mut Void {
    unsafe { (self as *const Block as *mut Void).add(size_of::<Block>()) }
  }

  /// Recovers the header from a payload pointer. The pointer must have been
  /// produced by `payload()`.
  #[inline(always)]
  pub unsafe fn from_payload(payload: *mut Void) -> BlockPtr {
    (payload as BlockPtr).sub(1)
  }

  #[inline(always)]
  pub fn size(&self) -> usize {
    self.size
  }

  #[inline(always)]
  pub fn is_visited(&self) -> bool {
    self.flags.contains(BlockFlag::Visited)
  }

  #[inline(always)]
  pub fn set_visited(&mut self) {
    self.flags.insert(BlockFlag::Visited);
  }

  #[inline(always)]
  pub fn clear_visited(&mut self) {
    self.flags.remove(BlockFlag::Visited);
  }

  #[inline(always)]
  pub fn is_finalized(&self) -> bool {
    self.flags.contains(BlockFlag::Finalized)
  }

  #[inline(always)]
  pub fn set_finalized(&mut self) {
    self.flags.insert(BlockFlag::Finalized);
  }

  /// Runs the finaliser on the payload. Only legal while the block's whole
  /// sub-graph is being deleted, so backlinks need no repair afterwards.
  pub unsafe fn finalize(blk: BlockPtr) {
    let payload = (*blk).payload();
    ((*blk).dtor)(payload);
  }
}
