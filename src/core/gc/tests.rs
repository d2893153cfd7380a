use std::{
  alloc::Layout,
  sync::atomic::{AtomicIsize, AtomicUsize, Ordering::Relaxed},
};

use rand::Rng;
use serial_test::serial;

use crate::{core::Void, debug, Ref};

use super::{
  block::Block,
  collector::{
    debug_all_unvisited,
    debug_backlinks,
    debug_mode,
    debug_registry_contiguous,
    debug_search_list_len,
    Mode,
  },
  finish,
  num_blocks,
  num_links,
  set_alloc_hooks,
  set_report_collection,
  step,
};

// Counting allocator hooks, mirroring how a malloc/free shim would audit the
// heap. Installed once per test that asserts on the balance; tests are
// serialised, so relative snapshots are race-free.
static ALLOC_BALANCE: AtomicIsize = AtomicIsize::new(0);

unsafe fn counting_alloc(size: usize) -> *mut Void {
  ALLOC_BALANCE.fetch_add(1, Relaxed);
  let layout = Layout::from_size_align(size, align_of::<Block>()).unwrap();
  std::alloc::alloc(layout)
}

unsafe fn counting_free(ptr: *mut Void, size: usize) {
  ALLOC_BALANCE.fetch_sub(1, Relaxed);
  let layout = Layout::from_size_align(size, align_of::<Block>()).unwrap();
  std::alloc::dealloc(ptr, layout);
}

static REPORTED_BLOCKS: AtomicUsize = AtomicUsize::new(0);

fn record_collection(count: usize) {
  REPORTED_BLOCKS.fetch_add(count, Relaxed);
}

static FINALIZED_THINGS: AtomicUsize = AtomicUsize::new(0);

/// One list cell. Its `next` field is an interior reference, so a `Thing`
/// only keeps its successor alive while it is reachable itself.
struct Thing {
  next: Ref<Thing>,
}

impl Thing {
  fn make() -> Ref<Thing> {
    Ref::make_with(|this| Thing {
      next: Ref::interior(this),
    })
  }
}

impl Drop for Thing {
  fn drop(&mut self) {
    FINALIZED_THINGS.fetch_add(1, Relaxed);
  }
}

/// Builds a singly linked chain of `len` things and returns a root
/// reference to its head. Each new cell points at the previous head.
fn make_chain(len: usize) -> Ref<Thing> {
  let mut head: Ref<Thing> = Ref::null();
  for _ in 0..len {
    let mut cell = Thing::make();
    cell.next.assign(&head);
    head = cell;
  }
  head
}

fn run_steps(n: usize) {
  for _ in 0..n {
    step();
  }
}

/// Steps until every unreachable block is gone. Panics if the collector
/// fails to converge.
fn collect_all(cap: usize, expected: usize) {
  let mut taken = 0;
  while num_blocks() > expected {
    step();
    taken += 1;
    assert!(taken < cap, "collector failed to converge");
  }
}

/// True only between episodes: `Initialize` alone is not enough, because a
/// search returns there to pop the next frontier block.
fn idle_between_episodes() -> bool {
  debug_mode() == Mode::Initialize && debug_search_list_len() == 0
}

/// Steps until the machine idles between episodes. Callers must ensure no
/// collection can complete first (every block pinned by a root, or the
/// machine already unwinding in `Clear`).
fn settle_to_idle() {
  let mut taken = 0;
  while !idle_between_episodes() {
    step();
    taken += 1;
    assert!(taken < 10_000, "collector failed to settle");
  }
}

#[test]
#[serial]
fn step_on_empty_heap_is_a_noop() {
  finish();
  assert_eq!(num_blocks(), 0);
  run_steps(10);
  assert_eq!(debug_mode(), Mode::Initialize);
  assert_eq!(num_blocks(), 0);
}

#[test]
#[serial]
fn isolated_block_collected_in_one_episode() {
  finish();
  set_report_collection(record_collection);
  let reported = REPORTED_BLOCKS.load(Relaxed);

  let lone = Ref::make(5i32);
  assert_eq!(num_blocks(), 1);
  drop(lone);

  // One full episode: initialize, exhaust the empty backlink list, then one
  // finalize and one destroy step.
  run_steps(4);
  assert_eq!(num_blocks(), 0);
  assert_eq!(REPORTED_BLOCKS.load(Relaxed), reported + 1);
  finish();
}

#[test]
#[serial]
fn rooted_cycle_survives() {
  finish();

  let mut a = Thing::make();
  let mut b = Thing::make();
  let mut c = Thing::make();
  a.next.assign(&b);
  b.next.assign(&c);
  c.next.assign(&a);
  drop(b);
  drop(c);

  // `a` stays rooted; every episode must abort on its root edge.
  run_steps(1000);
  assert_eq!(num_blocks(), 3);
  assert!(debug_registry_contiguous());

  drop(a);
  collect_all(1000, 0);
  finish();
}

#[test]
#[serial]
fn rootless_cycle_fully_collected() {
  finish();
  set_alloc_hooks(counting_alloc, counting_free);
  set_report_collection(record_collection);
  let balance = ALLOC_BALANCE.load(Relaxed);
  let reported = REPORTED_BLOCKS.load(Relaxed);

  let mut a = Thing::make();
  let mut b = Thing::make();
  let mut c = Thing::make();
  a.next.assign(&b);
  b.next.assign(&c);
  c.next.assign(&a);
  drop(a);
  drop(b);
  drop(c);

  collect_all(1000, 0);
  // The cycle is reverse-reachable from any seed, so a single episode
  // accounts for all three blocks.
  assert_eq!(REPORTED_BLOCKS.load(Relaxed), reported + 3);
  assert_eq!(ALLOC_BALANCE.load(Relaxed), balance);
  finish();
}

#[test]
#[serial]
fn cleared_chain_fully_collected() {
  finish();
  set_alloc_hooks(counting_alloc, counting_free);
  set_report_collection(record_collection);
  let balance = ALLOC_BALANCE.load(Relaxed);
  let reported = REPORTED_BLOCKS.load(Relaxed);
  let finalized = FINALIZED_THINGS.load(Relaxed);

  let mut head = make_chain(10);
  assert_eq!(num_blocks(), 10);

  head.clear();
  collect_all(10_000, 0);
  drop(head);

  // Depending on where episodes seed, the chain may fall in pieces, but
  // every block is reported and finalised exactly once.
  assert_eq!(REPORTED_BLOCKS.load(Relaxed), reported + 10);
  assert_eq!(FINALIZED_THINGS.load(Relaxed), finalized + 10);
  assert_eq!(ALLOC_BALANCE.load(Relaxed), balance);
  finish();
}

#[test]
#[serial]
fn mutation_aborts_search_before_finalize() {
  finish();
  set_report_collection(record_collection);

  // Two blocks referencing each other, so any seed visits both within two
  // steps of a fresh episode.
  let mut x = Thing::make();
  let mut y = Thing::make();
  x.next.assign(&y);
  y.next.assign(&x);
  let x_raw = x.as_ptr();

  settle_to_idle();
  drop(x);
  drop(y);
  assert_eq!(num_blocks(), 2);
  assert!(idle_between_episodes());

  let reported = REPORTED_BLOCKS.load(Relaxed);

  step(); // seed one block of the pair
  step(); // expand its single interior backlink: both now visited
  assert_eq!(debug_mode(), Mode::Search);
  assert_eq!(debug_search_list_len(), 2);

  // Re-targeting an interior reference onto a visited block must abandon
  // the episode before any finalisation can happen.
  unsafe {
    (*x_raw).next.assign_raw(x_raw);
  }
  assert_eq!(debug_mode(), Mode::Clear);

  // The barrier is idempotent within a step: poking again changes nothing.
  let _ = unsafe { (*x_raw).next.as_ptr() };
  assert_eq!(debug_mode(), Mode::Clear);

  // The aborted episode unwinds without collecting anything.
  settle_to_idle();
  assert_eq!(num_blocks(), 2);
  assert_eq!(REPORTED_BLOCKS.load(Relaxed), reported);
  assert!(debug_all_unvisited());

  // Both blocks really are garbage, so later episodes may take them.
  collect_all(1000, 0);
  assert_eq!(REPORTED_BLOCKS.load(Relaxed), reported + 2);
  finish();
}

#[test]
#[serial]
fn visited_marks_cleared_after_aborted_episodes() {
  finish();

  let mut a = Thing::make();
  let mut b = Thing::make();
  a.next.assign(&b);
  b.next.assign(&a);
  drop(b);

  // Episodes keep aborting on the root; between episodes no mark survives.
  for _ in 0..20 {
    step();
    if idle_between_episodes() {
      assert!(debug_all_unvisited());
    }
  }

  drop(a);
  collect_all(1000, 0);
  finish();
}

#[test]
#[serial]
fn root_links_precede_interior_links() {
  finish();

  let target = Thing::make();
  let mut holder = Thing::make();
  holder.next.assign(&target); // interior edge, inserted at the back
  let extra = target.clone(); // root edge, inserted at the front

  let backlinks = debug_backlinks(target.target());
  assert_eq!(backlinks.len(), 3);

  let first_interior = backlinks
      .iter()
      .position(|(_, from)| !from.is_null())
      .unwrap();
  assert!(
    backlinks[first_interior..].iter().all(|(_, from)| !from.is_null()),
    "a root link appeared after an interior link"
  );
  assert_eq!(backlinks[first_interior].1, holder.target());

  drop(extra);
  drop(holder);
  drop(target);
  collect_all(1000, 0);
  finish();
}

#[test]
#[serial]
fn reassignment_restores_list_position() {
  finish();

  let a = Thing::make();
  let b = Thing::make();
  let root_copy = a.clone();
  let mut holder = Thing::make();
  holder.next.assign(&a);

  let before = debug_backlinks(a.target());
  assert_eq!(before.len(), 3);

  // Swing the interior reference away and back again.
  holder.next.assign(&b);
  holder.next.assign(&a);
  assert_eq!(debug_backlinks(a.target()), before);

  // Same for the front-of-list root reference.
  let mut root_copy = root_copy;
  root_copy.assign(&b);
  root_copy.assign(&a);
  assert_eq!(debug_backlinks(a.target()), before);
  assert_eq!(before[0].0, root_copy.link_ptr());

  drop(root_copy);
  drop(holder);
  drop(a);
  drop(b);
  collect_all(1000, 0);
  finish();
}

#[test]
#[serial]
fn finish_runs_every_finalizer_exactly_once() {
  finish();
  set_alloc_hooks(counting_alloc, counting_free);
  let balance = ALLOC_BALANCE.load(Relaxed);
  let finalized = FINALIZED_THINGS.load(Relaxed);

  let chain = make_chain(5);
  let mut a = Thing::make();
  let mut b = Thing::make();
  a.next.assign(&b);
  b.next.assign(&a);
  drop(a);
  drop(b);
  drop(chain);

  finish();
  assert_eq!(num_blocks(), 0);
  assert_eq!(FINALIZED_THINGS.load(Relaxed), finalized + 7);
  assert_eq!(ALLOC_BALANCE.load(Relaxed), balance);
}

/// The chain-churn workload: every iteration builds a ten-cell chain and
/// stashes its head in a bounded pool of roots, randomly evicting two. Run
/// long enough, the heap reaches a steady state where collection keeps up
/// with the churn.
fn chain_churn(iterations: usize) {
  const CHAIN_LEN: usize = 10;
  const TARGET_ROOTS: usize = 100;
  const REPORT_INTERVAL: usize = 1000;

  finish();
  set_alloc_hooks(counting_alloc, counting_free);
  let balance = ALLOC_BALANCE.load(Relaxed);
  let finalized = FINALIZED_THINGS.load(Relaxed);

  let mut rng = rand::thread_rng();
  let mut things: Vec<Ref<Thing>> = Vec::new();

  for i in 0..iterations {
    things.push(make_chain(CHAIN_LEN));
    for _ in 0..2 {
      let candidate = rng.gen_range(0..2 * TARGET_ROOTS);
      if candidate < things.len() {
        things.swap_remove(candidate);
      }
    }
    if i % REPORT_INTERVAL == 0 {
      let reachable = things.len() * CHAIN_LEN;
      let total = num_blocks();
      let waste = if reachable == 0 {
        0.0
      } else {
        (total as f64 - reachable as f64) * 100.0 / reachable as f64
      };
      debug!(
        3,
        "iteration: {}\treachable: {}\ttotal: {}\twaste: {:.2}%",
        i,
        reachable,
        total,
        waste
      );
    }
  }

  drop(things);
  finish();

  assert_eq!(num_blocks(), 0);
  assert_eq!(num_links(), 0);
  assert_eq!(ALLOC_BALANCE.load(Relaxed), balance, "leaked blocks");
  assert_eq!(
    FINALIZED_THINGS.load(Relaxed),
    finalized + iterations * CHAIN_LEN
  );
}

#[test]
#[serial]
fn stress_chain_churn() {
  chain_churn(10_000);
}

/// The full-size run of the workload above. Slow; run explicitly with
/// `cargo test -- --ignored`.
#[test]
#[serial]
#[ignore]
fn stress_chain_churn_full() {
  chain_churn(1_000_000);
}
