/*!

`Ref<T>` is the user-facing handle to a managed block. Every `Ref` owns
exactly one link record; constructing, re-targeting and dropping the
reference maintain the record's position in the target's backlink list, so
the collector always sees the complete edge set of every block.

Whether a reference is a *root* or an *interior* edge is a structural
property of where it lives: on the stack or in a static (root) versus
inside a managed payload (interior). It is fixed at construction. A root
pins its target; an interior edge only keeps its target alive while the
enclosing block is itself reachable.

*/

use std::{
  fmt,
  marker::PhantomData,
  ops::{Deref, DerefMut},
  ptr::null_mut,
};

use crate::core::{
  gc::{self, acquire_collector, Block, BlockPtr, LinkPtr},
  Void,
};

/// Type-erased finaliser for a payload of type `T`.
unsafe fn drop_payload<T>(payload: *mut Void) {
  std::ptr::drop_in_place(payload as *mut T);
}

pub struct Ref<T> {
  link    : LinkPtr,
  _payload: PhantomData<*mut T>,
}

impl<T> Ref<T> {
  /// A root reference holding nothing.
  pub fn null() -> Ref<T> {
    Ref::from_link(acquire_collector("new reference").new_link(null_mut(), null_mut()))
  }

  /// An interior reference with no target yet, living inside the payload at
  /// `enclosing`. Pass the enclosing object's own pointer, as handed to the
  /// `make_with` closure; a wrong enclosing pointer corrupts reachability.
  pub fn interior<P>(enclosing: *mut P) -> Ref<T> {
    assert!(!enclosing.is_null());
    let from = unsafe { Block::from_payload(enclosing as *mut Void) };
    Ref::from_link(acquire_collector("new reference").new_link(from, null_mut()))
  }

  /// An interior reference with its target fully specified.
  pub fn interior_to<P>(enclosing: *mut P, target: *mut T) -> Ref<T> {
    assert!(!enclosing.is_null());
    let from = unsafe { Block::from_payload(enclosing as *mut Void) };
    let to = Self::target_block(target);
    Ref::from_link(acquire_collector("new reference").new_link(from, to))
  }

  /// Allocates a managed block, constructs the payload in place, and
  /// returns a root reference to it.
  ///
  /// The block is registered with the heap *before* `init` runs, so the
  /// closure may create interior references from the pointer it is given:
  ///
  /// ```no_run
  /// use backgc::Ref;
  ///
  /// struct Node { next: Ref<Node> }
  ///
  /// let node = Ref::make_with(|this| Node { next: Ref::interior(this) });
  /// ```
  pub fn make_with<F>(init: F) -> Ref<T>
  where
    F: FnOnce(*mut T) -> T,
  {
    assert!(
      align_of::<T>() <= align_of::<Block>(),
      "payload alignment exceeds block alignment"
    );
    let payload = unsafe { gc::alloc(size_of::<T>(), drop_payload::<T>) } as *mut T;
    let value = init(payload);
    unsafe {
      payload.write(value);
    }
    let mut reference: Ref<T> = Ref::null();
    reference.assign_raw(payload);
    reference
  }

  /// Allocates a managed block holding `value` and returns a root reference
  /// to it. Convenience form of `make_with` for payloads that contain no
  /// interior references.
  pub fn make(value: T) -> Ref<T> {
    Ref::make_with(|_| value)
  }

  /// Re-targets this reference at the other reference's target. Whether
  /// this reference is a root or an interior edge is unchanged.
  pub fn assign(&mut self, other: &Ref<T>) {
    let to = other.target();
    acquire_collector("assign reference").retarget(self.link, to);
  }

  /// Re-targets this reference from a raw payload pointer previously
  /// obtained from a managed block.
  pub fn assign_raw(&mut self, target: *mut T) {
    let to = Self::target_block(target);
    acquire_collector("assign reference").retarget(self.link, to);
  }

  /// Drops the current target, leaving the reference null.
  pub fn clear(&mut self) {
    acquire_collector("clear reference").retarget(self.link, null_mut());
  }

  #[inline(always)]
  pub fn is_null(&self) -> bool {
    self.target().is_null()
  }

  /// The payload pointer of the target. Panics on a null reference. Like
  /// dereferencing, this pokes the collector's write barrier defensively.
  pub fn as_ptr(&self) -> *mut T {
    let to = self.target();
    assert!(!to.is_null(), "dereferenced a null managed reference");
    acquire_collector("dereference").poke(to);
    unsafe { (*to).payload() as *mut T }
  }

  #[inline(always)]
  fn from_link(link: LinkPtr) -> Ref<T> {
    Ref {
      link,
      _payload: PhantomData,
    }
  }

  #[inline(always)]
  pub(crate) fn target(&self) -> BlockPtr {
    unsafe { (*self.link).to }
  }

  #[cfg(test)]
  pub(crate) fn link_ptr(&self) -> LinkPtr {
    self.link
  }

  #[inline(always)]
  fn target_block(target: *mut T) -> BlockPtr {
    if target.is_null() {
      null_mut()
    } else {
      unsafe { Block::from_payload(target as *mut Void) }
    }
  }
}

impl<T> Default for Ref<T> {
  fn default() -> Ref<T> {
    Ref::null()
  }
}

impl<T> Clone for Ref<T> {
  /// Copies the target only. The copy is **always a root**, even when it is
  /// stored inside a managed payload: a clone living in a managed block
  /// pins its target for as long as that block lives. Use `interior` /
  /// `interior_to` for an edge that should participate in collection.
  fn clone(&self) -> Ref<T> {
    Ref::from_link(
      acquire_collector("clone reference").new_link(null_mut(), self.target()),
    )
  }
}

impl<T> Drop for Ref<T> {
  fn drop(&mut self) {
    acquire_collector("release reference").release_link(self.link);
  }
}

impl<T> Deref for Ref<T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.as_ptr() }
  }
}

impl<T> DerefMut for Ref<T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.as_ptr() }
  }
}

/// Equality compares targets only.
impl<T> PartialEq for Ref<T> {
  fn eq(&self, other: &Ref<T>) -> bool {
    std::ptr::eq(self.target(), other.target())
  }
}

impl<T> Eq for Ref<T> {}

impl<T> fmt::Debug for Ref<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_null() {
      write!(f, "Ref(null)")
    } else {
      write!(f, "Ref({:p})", self.target())
    }
  }
}
