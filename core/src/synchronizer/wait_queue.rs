use std::sync::Arc;

use arc_swap::ArcSwapOption;
use qsync_utils_rs::ThreadToken;

use super::node::{compare_and_set_link, same_node, AcquireMode, Node, WaitStatus};

/// Intrusive FIFO of waiter nodes.
///
/// `head` and `tail` stay empty until the first contended acquire, which installs a
/// sentinel head. After that the head is always a node whose waiter has been
/// cleared. Appends race on `tail` with compare-and-swap; the `next` link of the
/// old tail is written afterwards, so readers fall back to walking `prev` from the
/// tail whenever `next` is missing.
pub(crate) struct WaitQueue {
  head: ArcSwapOption<Node>,
  tail: ArcSwapOption<Node>,
}

impl WaitQueue {
  pub(crate) fn new() -> Self {
    Self {
      head: ArcSwapOption::empty(),
      tail: ArcSwapOption::empty(),
    }
  }

  #[inline]
  pub(crate) fn head(&self) -> Option<Arc<Node>> {
    self.head.load_full()
  }

  #[inline]
  pub(crate) fn tail(&self) -> Option<Arc<Node>> {
    self.tail.load_full()
  }

  #[inline]
  pub(crate) fn is_head(&self, node: &Arc<Node>) -> bool {
    matches!(&*self.head.load(), Some(head) if Arc::ptr_eq(head, node))
  }

  #[inline]
  pub(crate) fn is_tail(&self, node: &Arc<Node>) -> bool {
    matches!(&*self.tail.load(), Some(tail) if Arc::ptr_eq(tail, node))
  }

  /// Appends `node`, initializing the sentinel head on first use, and returns its
  /// predecessor.
  pub(crate) fn enqueue(&self, node: &Arc<Node>) -> Arc<Node> {
    loop {
      match self.tail.load_full() {
        None => {
          let sentinel = Arc::new(Node::sentinel());
          if compare_and_set_link(&self.head, &None, Some(sentinel.clone())) {
            tracing::trace!("wait queue initialized");
            self.tail.store(Some(sentinel));
          }
        }
        Some(tail) => {
          node.prev.store(Some(tail.clone()));
          let current = Some(tail.clone());
          if compare_and_set_link(&self.tail, &current, Some(node.clone())) {
            tail.next.store(Some(node.clone()));
            return tail;
          }
        }
      }
    }
  }

  /// Creates a node for the calling thread and appends it.
  pub(crate) fn add_waiter(&self, mode: AcquireMode) -> Arc<Node> {
    let node = Arc::new(Node::for_current(mode, WaitStatus::Init));
    self.enqueue(&node);
    tracing::trace!(%mode, "enqueued waiter");
    node
  }

  /// Promotes `node` to head. Only the thread that just acquired through `node`
  /// may call this.
  pub(crate) fn set_head(&self, node: &Arc<Node>) {
    self.head.store(Some(node.clone()));
    node.waiter.store(None);
    node.prev.store(None);
  }

  /// Swings the tail back from `expect` to `update`, used when the last node
  /// cancels.
  pub(crate) fn compare_and_set_tail(&self, expect: &Arc<Node>, update: &Arc<Node>) -> bool {
    compare_and_set_link(&self.tail, &Some(expect.clone()), Some(update.clone()))
  }

  pub(crate) fn has_contended(&self) -> bool {
    self.head.load().is_some()
  }

  pub(crate) fn has_queued_threads(&self) -> bool {
    let head = self.head.load_full();
    let tail = self.tail.load_full();
    !same_node(&head, &tail)
  }

  /// Whether some other thread has been waiting longer than `current`.
  pub(crate) fn has_queued_predecessors(&self, current: ThreadToken) -> bool {
    // Tail is read before head so a half-initialized queue reads as empty.
    let tail = self.tail.load_full();
    let head = self.head.load_full();
    match (head, tail) {
      (Some(head), Some(tail)) if !Arc::ptr_eq(&head, &tail) => match head.next.load_full() {
        None => true,
        Some(first) => first.waiter_token() != Some(current),
      },
      _ => false,
    }
  }

  /// Walks from the tail towards the head, yielding every node still bound to a
  /// waiter.
  fn for_each_waiting(&self, mut f: impl FnMut(&Arc<Node>, ThreadToken)) {
    let mut cursor = self.tail.load_full();
    while let Some(node) = cursor {
      if let Some(token) = node.waiter_token() {
        f(&node, token);
      }
      cursor = node.prev.load_full();
    }
  }

  /// The thread that has been queued the longest.
  pub(crate) fn first_queued_thread(&self) -> Option<ThreadToken> {
    if !self.has_queued_threads() {
      return None;
    }
    // Fast path: a fully linked first node.
    if let Some(head) = self.head.load_full() {
      if let Some(first) = head.next.load_full() {
        let linked = first.prev.load_full().is_some_and(|prev| Arc::ptr_eq(&prev, &head));
        if let (true, Some(token)) = (linked, first.waiter_token()) {
          return Some(token);
        }
      }
    }
    let mut first = None;
    self.for_each_waiting(|_, token| first = Some(token));
    first
  }

  pub(crate) fn is_queued(&self, thread: ThreadToken) -> bool {
    let mut found = false;
    self.for_each_waiting(|_, token| found |= token == thread);
    found
  }

  pub(crate) fn queue_length(&self) -> usize {
    let mut length = 0;
    self.for_each_waiting(|_, _| length += 1);
    length
  }

  /// Queued threads, most recently enqueued first.
  pub(crate) fn queued_threads(&self, mode: Option<AcquireMode>) -> Vec<ThreadToken> {
    let mut threads = Vec::new();
    self.for_each_waiting(|node, token| {
      if mode.map_or(true, |mode| node.mode() == mode) {
        threads.push(token);
      }
    });
    threads
  }
}

impl Drop for WaitQueue {
  fn drop(&mut self) {
    // Break the prev/next pairs so the remaining nodes are freed.
    let mut cursor = self.tail.swap(None);
    while let Some(node) = cursor {
      node.next.store(None);
      cursor = node.prev.swap(None);
    }
    let mut cursor = self.head.swap(None);
    while let Some(node) = cursor {
      node.prev.store(None);
      cursor = node.next.swap(None);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn first_enqueue_installs_sentinel_head() {
    let queue = WaitQueue::new();
    assert!(!queue.has_contended());

    let node = Arc::new(Node::for_current(AcquireMode::Exclusive, WaitStatus::Init));
    let pred = queue.enqueue(&node);

    assert!(queue.is_head(&pred));
    assert!(queue.is_tail(&node));
    assert_eq!(pred.waiter_token(), None);
    assert!(Arc::ptr_eq(&node.predecessor().unwrap(), &pred));
    assert!(same_node(&pred.next.load_full(), &Some(node)));
  }

  #[test]
  fn enqueue_links_in_fifo_order() {
    let queue = WaitQueue::new();
    let a = queue.add_waiter(AcquireMode::Exclusive);
    let b = queue.add_waiter(AcquireMode::Shared);

    assert!(Arc::ptr_eq(&b.predecessor().unwrap(), &a));
    assert_eq!(queue.queue_length(), 2);
    assert!(queue.has_queued_threads());
    assert_eq!(queue.queued_threads(Some(AcquireMode::Shared)).len(), 1);
    assert_eq!(queue.first_queued_thread(), Some(ThreadToken::current()));
    assert!(queue.is_queued(ThreadToken::current()));
  }

  #[test]
  fn predecessors_are_judged_by_first_waiter() {
    let queue = WaitQueue::new();
    assert!(!queue.has_queued_predecessors(ThreadToken::current()));

    let node = queue.add_waiter(AcquireMode::Exclusive);
    // The first waiter is the caller itself.
    assert!(!queue.has_queued_predecessors(ThreadToken::current()));

    let other = std::thread::spawn(ThreadToken::current).join().unwrap();
    assert!(queue.has_queued_predecessors(other));

    queue.set_head(&node);
    assert!(!queue.has_queued_threads());
    assert_eq!(queue.queue_length(), 0);
    assert_eq!(node.waiter_token(), None);
  }
}
