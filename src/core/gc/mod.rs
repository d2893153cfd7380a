/*!

The collector for garbage collected memory. Four pieces cooperate:

 1. A `Block` header prepended to every managed allocation. The header
    anchors the block's *backlink list*: a circular doubly-linked list of
    every `Link` record whose reference currently targets the block.
 2. A `Link` record per outstanding reference edge, owned by the smart
    reference that created it and threaded into its target's backlink list.
 3. A registry of all live blocks, indexed so that removal is a cheap swap.
 4. An incremental state machine that repeatedly picks a block and walks
    backlinks to decide whether its ancestor set contains a root. Blocks
    whose entire ancestor set is rootless are unreachable and destroyed.

*/
mod block;
mod collector;
mod link;
mod registry;

#[cfg(test)]
mod tests;

// Used internally
pub(crate) use block::{Block, BlockPtr};
pub(crate) use collector::{acquire_collector, alloc};
pub(crate) use link::LinkPtr;

// These are the only public API
pub use collector::{
  effort,
  finish,
  init,
  num_blocks,
  num_links,
  set_alloc_hooks,
  set_effort,
  set_report_collection,
  step,
  AllocFn,
  FreeFn,
  ReportFn,
};
