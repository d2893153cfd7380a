/*!

An incremental garbage collector that traces *backwards*. Every reference
keeps a record on its target, so each managed block knows the complete set
of edges pointing at it. A collection episode seeds at an arbitrary block
and walks these backlinks: reaching a root edge proves the block live,
exhausting the ancestor set proves the whole walked sub-graph unreachable.
Work is metered in bounded `step()` units amortised over allocations, so
pause times stay flat no matter how large the live heap grows.

```no_run
use backgc::Ref;

struct Node {
  next: Ref<Node>,
}

fn main() {
  backgc::init(1.0);

  // Build a two-element list held by a root reference.
  let mut head = Ref::make_with(|this| Node { next: Ref::interior(this) });
  let tail     = Ref::make_with(|this| Node { next: Ref::interior(this) });
  head.next.assign(&tail);
  drop(tail); // still reachable through `head`

  head.clear(); // now garbage; reclaimed incrementally by future steps
  for _ in 0..100 {
    backgc::step();
  }

  backgc::finish();
}
```

*/

pub mod abstractions;
pub mod api;
mod core;

// We re-export abstractions that are meant to be used publicly.
pub use abstractions::log;

pub use api::Ref;
pub use crate::core::{
  gc::{
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
  },
  Void,
};
