/*!

# The incremental collector

The collector decides reachability *in reverse*. An episode seeds at a
randomly chosen block, marks it visited, and walks the backlink lists of
everything it reaches: each link names the block it came `from`, so the
walk enumerates the seed's ancestor set one edge per step. Two outcomes are
possible.

 - A link with a null `from` is a root edge. The sub-graph walked so far is
   reachable, the episode aborts, and a `Clear` pass unwinds the visited
   marks.
 - The ancestor set is exhausted without meeting a root. Every edge into
   every visited block was enumerated, so no outside reference exists: the
   whole sub-graph is unreachable and is finalised and destroyed.

Mutations race against an episode in a benign way. Any operation that
touches a backlink list first runs the `poke` barrier; if it touches a
visited block while a search is in flight, the deletion decision is
abandoned before the list changes under the cursor.

Collection work is amortised over allocation: each allocation runs a number
of steps proportional to the heap's edge density, scaled by the runtime
`effort` tunable.

The collector is a process-wide singleton behind a mutex. Finalisers and
telemetry hooks are user code and may create or destroy references, so they
are never invoked while the guard is held.

*/

use std::{
  alloc::Layout,
  ptr::null_mut,
  sync::{Mutex, MutexGuard},
};

use once_cell::sync::Lazy;

use crate::{
  core::{
    gc::{
      block::{Block, BlockPtr, DtorFn},
      link::{Link, LinkPtr},
      registry::BlockRegistry,
    },
    Void,
  },
  debug,
};

/// Raw-memory hook used for every managed allocation.
pub type AllocFn = unsafe fn(usize) -> *mut Void;
/// Raw-memory hook releasing an allocation of the given size.
pub type FreeFn = unsafe fn(*mut Void, usize);
/// Telemetry hook invoked with the number of blocks a finished search
/// proved unreachable, just before they are finalised.
pub type ReportFn = fn(usize);

const DEFAULT_EFFORT: f64 = 1.0;

unsafe fn default_alloc(size: usize) -> *mut Void {
  let layout = Layout::from_size_align(size, align_of::<Block>())
      .expect("bad block layout");
  std::alloc::alloc(layout)
}

unsafe fn default_free(ptr: *mut Void, size: usize) {
  let layout = Layout::from_size_align(size, align_of::<Block>())
      .expect("bad block layout");
  std::alloc::dealloc(ptr, layout);
}

/// One episode runs `Initialize → Search`, then either `Clear` (a root was
/// found, or a mutation invalidated the search) or `Finalize → Destroy`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Mode {
  Initialize,
  Search,
  Clear,
  Finalize,
  Destroy,
}

/// Poor quality but very fast generator based on the FNV hash. It only
/// picks search seeds, so quality hardly matters.
struct FnvRand {
  state: u64,
}

impl FnvRand {
  const BASIS: u64 = 0xcbf29ce484222325;
  const PRIME: u64 = 0x100000001b3;

  fn new() -> Self {
    FnvRand { state: Self::BASIS }
  }

  fn next_below(&mut self, n: usize) -> usize {
    self.state = self.state.wrapping_mul(Self::PRIME) ^ Self::BASIS;
    (self.state % n as u64) as usize
  }
}

/// Work a step decided on that must run outside the collector lock.
/// Finalisers and the telemetry hook are user code and may re-enter the
/// collector through the reference API.
enum StepAction {
  None,
  /// A search completed; `usize` blocks are about to be finalised.
  Report(usize),
  /// Run this block's finaliser.
  Finalize(BlockPtr),
}

static GLOBAL_COLLECTOR: Lazy<Mutex<Collector>> = Lazy::new(|| {
  Mutex::new(Collector::new(DEFAULT_EFFORT))
});

/// Acquire the global collector. The `caller_msg` is for debugging purposes.
#[inline(always)]
pub(crate) fn acquire_collector(caller_msg: &str) -> MutexGuard<'static, Collector> {
  GLOBAL_COLLECTOR.lock().expect(caller_msg)
}

pub(crate) struct Collector {
  blocks     : BlockRegistry,
  rand       : FnvRand,
  total_links: usize,

  // State of the episode in flight
  search_stack: Vec<BlockPtr>,
  search_list : Vec<BlockPtr>,
  pos         : usize,
  search_blk  : BlockPtr,
  search_link : LinkPtr,
  mode        : Mode,

  // Tunables and hooks
  effort   : f64,
  alloc_fn : AllocFn,
  free_fn  : FreeFn,
  report_fn: Option<ReportFn>,

  // True while a finaliser is running; allocation is illegal then.
  finalizing: bool,
}

// Access is hidden behind a mutex.
unsafe impl Send for Collector {}

impl Collector {
  fn new(effort: f64) -> Self {
    Collector {
      blocks     : BlockRegistry::new(),
      rand       : FnvRand::new(),
      total_links: 0,

      search_stack: Vec::new(),
      search_list : Vec::new(),
      pos         : 0,
      search_blk  : null_mut(),
      search_link : null_mut(),
      mode        : Mode::Initialize,

      effort,
      alloc_fn : default_alloc,
      free_fn  : default_free,
      report_fn: None,

      finalizing: false,
    }
  }

  // region Link bookkeeping

  /// Creates the link record for a new reference and, when `to` is
  /// non-null, threads it into `to`'s backlink list.
  pub(crate) fn new_link(&mut self, from: BlockPtr, to: BlockPtr) -> LinkPtr {
    self.total_links += 1;
    let link = Box::into_raw(Box::new(Link::detached(from)));
    unsafe {
      self.attach(link, to);
    }
    link
  }

  /// Unthreads and destroys the link record of a dying reference.
  pub(crate) fn release_link(&mut self, link: LinkPtr) {
    unsafe {
      self.detach(link);
      drop(Box::from_raw(link));
    }
    self.total_links -= 1;
  }

  /// Re-targets an existing link, preserving its `from`.
  pub(crate) fn retarget(&mut self, link: LinkPtr, to: BlockPtr) {
    unsafe {
      self.detach(link);
      self.attach(link, to);
    }
  }

  /// Threads a detached link into `to`'s backlink list. Root edges go to
  /// the front so a search meets them on the first step of expanding the
  /// target; interior edges go to the back.
  unsafe fn attach(&mut self, link: LinkPtr, to: BlockPtr) {
    (*link).to = to;
    if to.is_null() {
      (*link).next = null_mut();
      (*link).prev = null_mut();
      return;
    }

    self.poke(to);
    let sentinel = (*to).sentinel_ptr();
    if (*link).is_root() {
      // Front: immediately after the sentinel.
      (*link).next = (*sentinel).next;
      (*link).prev = sentinel;
    } else {
      // Back: immediately before the sentinel.
      (*link).next = sentinel;
      (*link).prev = (*sentinel).prev;
    }
    (*(*link).prev).next = link;
    (*(*link).next).prev = link;
  }

  /// Unthreads a link from its target's backlink list, if it has one.
  unsafe fn detach(&mut self, link: LinkPtr) {
    let to = (*link).to;
    if to.is_null() {
      return;
    }

    self.poke(to);
    debug_assert!(
      (*(*link).next).prev == link && (*(*link).prev).next == link,
      "backlink list corrupted"
    );
    (*(*link).next).prev = (*link).prev;
    (*(*link).prev).next = (*link).next;
    (*link).to = null_mut();
  }

  // endregion

  /// The write barrier. A mutation touching a block the current search has
  /// visited means the sub-graph can no longer be proven dead; abandon the
  /// episode and unwind the visited marks.
  pub(crate) fn poke(&mut self, blk: BlockPtr) {
    debug_assert!(!blk.is_null());
    if unsafe { (*blk).is_visited() }
        && (self.mode == Mode::Initialize || self.mode == Mode::Search)
    {
      self.mode = Mode::Clear;
      self.pos = 0;
    }
  }

  // region State machine

  fn step_once(&mut self) -> StepAction {
    match self.mode {
      Mode::Initialize => {
        self.initialize_step();
        StepAction::None
      }
      Mode::Search => self.search_step(),
      Mode::Clear => {
        self.clear_step();
        StepAction::None
      }
      Mode::Finalize => self.finalize_step(),
      Mode::Destroy => {
        self.destroy_step();
        StepAction::None
      }
    }
  }

  fn initialize_step(&mut self) {
    match self.search_stack.pop() {
      None => {
        // A fresh episode. Idle on an empty heap, otherwise seed at random.
        if self.blocks.is_empty() {
          return;
        }
        let seed = self.blocks.get(self.rand.next_below(self.blocks.len()));
        unsafe {
          (*seed).set_visited();
        }
        self.search_list.push(seed);
        self.search_blk = seed;
      }
      Some(blk) => {
        self.search_blk = blk;
      }
    }
    self.mode = Mode::Search;
    self.search_link = unsafe { (*self.search_blk).first_backlink() };
  }

  fn search_step(&mut self) -> StepAction {
    let sentinel = unsafe { (*self.search_blk).sentinel_ptr() };
    if self.search_link == sentinel {
      // search_blk's backlinks are exhausted.
      if self.search_stack.is_empty() {
        // The entire ancestor set was walked without meeting a root:
        // everything in search_list is unreachable.
        self.mode = Mode::Finalize;
        self.pos = 0;
        return StepAction::Report(self.search_list.len());
      }
      self.mode = Mode::Initialize;
      return StepAction::None;
    }

    let from = unsafe { (*self.search_link).from };
    if from.is_null() {
      // Root reached; the sub-graph is live.
      self.mode = Mode::Clear;
      self.pos = 0;
      return StepAction::None;
    }
    if unsafe { !(*from).is_visited() } {
      unsafe {
        (*from).set_visited();
      }
      self.search_list.push(from);
      self.search_stack.push(from);
    }
    self.search_link = unsafe { (*self.search_link).next };
    StepAction::None
  }

  fn clear_step(&mut self) {
    let blk = self.search_list[self.pos];
    unsafe {
      (*blk).clear_visited();
    }
    self.pos += 1;
    if self.pos >= self.search_list.len() {
      self.mode = Mode::Initialize;
      self.search_stack.clear();
      self.search_list.clear();
    }
  }

  fn finalize_step(&mut self) -> StepAction {
    let blk = self.search_list[self.pos];
    // The whole sub-graph dies together, so its backlinks need no repair.
    let id = unsafe { (*blk).id };
    self.blocks.remove(id);
    self.pos += 1;
    if self.pos >= self.search_list.len() {
      self.mode = Mode::Destroy;
      self.pos = 0;
    }
    StepAction::Finalize(blk)
  }

  fn destroy_step(&mut self) {
    let blk = self.search_list[self.pos];
    self.free_block(blk);
    self.pos += 1;
    if self.pos >= self.search_list.len() {
      self.mode = Mode::Initialize;
      self.search_list.clear();
    }
  }

  // endregion

  /// Number of steps to run before the next allocation: proportional to the
  /// heap's edge density, plus a floor so sparse heaps still make progress.
  fn pacing_steps(&self) -> usize {
    if self.blocks.is_empty() {
      return 0;
    }
    let links_per_block = self.total_links / self.blocks.len();
    (self.effort * ((2 * links_per_block + 7) as f64)) as usize
  }

  fn allocate_block(&mut self, size: usize, dtor: DtorFn) -> *mut Void {
    debug_assert!(!self.finalizing, "allocation re-entered from a finaliser");

    let total = size + size_of::<Block>();
    let raw = unsafe { (self.alloc_fn)(total) };
    assert!(!raw.is_null(), "block allocation failed");

    let blk = raw as BlockPtr;
    unsafe {
      Block::init(blk, self.blocks.len(), total, dtor);
      self.blocks.add(blk);
      (*blk).payload()
    }
  }

  fn free_block(&mut self, blk: BlockPtr) {
    debug_assert!(unsafe { (*blk).is_finalized() });
    let size = unsafe { (*blk).size() };
    unsafe {
      (self.free_fn)(blk as *mut Void, size);
    }
  }

  /// Empties the heap for shutdown. Returns the still-registered blocks and
  /// any blocks of a partially executed episode that were already finalised
  /// but not yet freed.
  fn take_all(&mut self) -> (Vec<BlockPtr>, Vec<BlockPtr>) {
    let live = self.blocks.drain();
    let pending: Vec<BlockPtr> = match self.mode {
      Mode::Finalize => self.search_list[..self.pos].to_vec(),
      Mode::Destroy => self.search_list[self.pos..].to_vec(),
      _ => Vec::new(),
    };

    // Finalisers run after this may still poke these blocks; stale visited
    // marks would fake an episode in flight.
    for &blk in &live {
      unsafe {
        (*blk).clear_visited();
      }
    }

    self.search_stack.clear();
    self.search_list.clear();
    self.pos = 0;
    self.search_blk = null_mut();
    self.search_link = null_mut();
    self.mode = Mode::Initialize;

    (live, pending)
  }

  /// Prints the state of the collector.
  #[cfg(feature = "gc_debug")]
  pub fn dump_state(&self) {
    eprintln!("╭─────────────────────────────────────────────╮");
    eprintln!("│{:<32} {:>12}│", "Variable", "Value");
    eprintln!("├─────────────────────────────────────────────┤");
    eprintln!("│{:<32} {:>12}│", "blocks", self.blocks.len());
    eprintln!("│{:<32} {:>12}│", "total_links", self.total_links);
    eprintln!("│{:<32} {:>12}│", "mode", format!("{:?}", self.mode));
    eprintln!("│{:<32} {:>12}│", "search_list", self.search_list.len());
    eprintln!("│{:<32} {:>12}│", "search_stack", self.search_stack.len());
    eprintln!("│{:<32} {:>12}│", "pos", self.pos);
    eprintln!("│{:<32} {:>12}│", "effort", self.effort);
    eprintln!("╰─────────────────────────────────────────────╯");
  }
}

/// Runs a block's finaliser with the collector unlocked, flagging the
/// re-entrancy guard around the user code.
unsafe fn run_finalizer(blk: BlockPtr) {
  {
    let mut collector = acquire_collector("finalize");
    collector.finalizing = true;
    (*blk).set_finalized();
  }
  Block::finalize(blk);
  acquire_collector("finalize").finalizing = false;
}

fn dispatch(action: StepAction) {
  match action {
    StepAction::None => {}
    StepAction::Report(count) => {
      debug!(2, "collection: {} unreachable blocks", count);
      #[cfg(feature = "gc_debug")]
      acquire_collector("report").dump_state();
      let report = acquire_collector("report").report_fn;
      if let Some(report) = report {
        report(count);
      }
    }
    StepAction::Finalize(blk) => unsafe {
      run_finalizer(blk);
    },
  }
}

/// Runs one bounded unit of collector work.
#[inline(always)]
pub fn step() {
  let action = acquire_collector("step").step_once();
  dispatch(action);
}

/// Allocates a managed block with `size` payload bytes, amortising pending
/// collection work first. Returns the payload pointer.
pub(crate) unsafe fn alloc(size: usize, dtor: DtorFn) -> *mut Void {
  let steps = acquire_collector("alloc").pacing_steps();
  for _ in 0..steps {
    step();
  }
  acquire_collector("alloc").allocate_block(size, dtor)
}

/// Configures the collector. The instance itself is created lazily on first
/// use; calling `init` again only retunes `effort`.
pub fn init(effort: f64) {
  set_effort(effort);
}

/// Destroys every remaining managed block. All finalisers run first, then
/// all memory is released: a finaliser may still read other managed blocks,
/// so no memory can be freed before every finaliser has run.
pub fn finish() {
  let (live, pending) = acquire_collector("finish").take_all();
  let count = live.len() + pending.len();

  for &blk in &live {
    unsafe {
      run_finalizer(blk);
    }
  }

  let mut collector = acquire_collector("finish");
  for blk in live {
    collector.free_block(blk);
  }
  for blk in pending {
    collector.free_block(blk);
  }
  drop(collector);

  debug!(2, "shutdown: {} blocks released", count);
}

/// Current number of live managed blocks.
pub fn num_blocks() -> usize {
  acquire_collector("num_blocks").blocks.len()
}

/// Current number of live reference edges.
pub fn num_links() -> usize {
  acquire_collector("num_links").total_links
}

pub fn effort() -> f64 {
  acquire_collector("effort").effort
}

/// Tunes how much collection work each allocation amortises. Linear in
/// work: higher means shorter garbage lifetime, longer allocation pauses.
pub fn set_effort(effort: f64) {
  assert!(effort > 0.0, "effort must be positive");
  acquire_collector("set_effort").effort = effort;
}

/// Routes all managed-heap bytes through custom hooks. Install before the
/// first allocation; blocks allocated by one pair of hooks must be freed by
/// the same pair.
pub fn set_alloc_hooks(alloc: AllocFn, free: FreeFn) {
  let mut collector = acquire_collector("set_alloc_hooks");
  collector.alloc_fn = alloc;
  collector.free_fn = free;
}

/// Installs the collection telemetry hook.
pub fn set_report_collection(report: ReportFn) {
  acquire_collector("set_report_collection").report_fn = Some(report);
}

// Test-only introspection.
#[cfg(test)]
pub(crate) fn debug_mode() -> Mode {
  acquire_collector("debug_mode").mode
}

#[cfg(test)]
pub(crate) fn debug_search_list_len() -> usize {
  acquire_collector("debug_search_list_len").search_list.len()
}

#[cfg(test)]
pub(crate) fn debug_all_unvisited() -> bool {
  let collector = acquire_collector("debug_all_unvisited");
  let result = collector
      .blocks
      .iter()
      .all(|blk| unsafe { !(*blk).is_visited() });
  result
}

#[cfg(test)]
pub(crate) fn debug_registry_contiguous() -> bool {
  let collector = acquire_collector("debug_registry_contiguous");
  let result = collector
      .blocks
      .iter()
      .enumerate()
      .all(|(i, blk)| unsafe { (*blk).id } == i);
  result
}

/// Walks a block's backlink list front to back, returning each link and
/// its source block (null for roots).
#[cfg(test)]
pub(crate) fn debug_backlinks(blk: BlockPtr) -> Vec<(LinkPtr, BlockPtr)> {
  let _guard = acquire_collector("debug_backlinks");
  let mut entries = Vec::new();
  unsafe {
    let sentinel = (*blk).sentinel_ptr();
    let mut cursor = (*blk).first_backlink();
    while cursor != sentinel {
      entries.push((cursor, (*cursor).from));
      cursor = (*cursor).next;
    }
  }
  entries
}
