use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use qsync_utils_rs::{ThreadParker, ThreadToken};
use rstest::*;
use tracing_subscriber::EnvFilter;

use super::*;
use crate::SyncError;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn init_logger() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .try_init();
}

fn eventually(mut condition: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(10);
  while !condition() {
    assert!(Instant::now() < deadline, "condition not reached in time");
    thread::sleep(Duration::from_millis(1));
  }
}

/// Non-reentrant mutex: state 1 while held.
struct Mutex;

impl SyncPolicy for Mutex {
  fn try_acquire(&self, core: &SyncCore, amount: u32) -> SyncResult<bool> {
    Ok(core.state().compare_and_set_owned(0, amount, Some(ThreadToken::current())))
  }

  fn try_release(&self, core: &SyncCore, _amount: u32) -> SyncResult<bool> {
    if core.state().exclusive_owner() != Some(ThreadToken::current()) {
      return Err(SyncError::of_illegal_monitor_state("release"));
    }
    core.state().set_owned(0, None);
    Ok(true)
  }
}

/// Counting permits handed out in shared mode.
struct Permits;

impl SyncPolicy for Permits {
  fn try_acquire_shared(&self, core: &SyncCore, amount: u32) -> SyncResult<SharedAcquire> {
    loop {
      let available = core.state().state();
      let Some(remaining) = available.checked_sub(amount) else {
        return Ok(SharedAcquire::Failed);
      };
      if core.state().compare_and_set_state(available, remaining) {
        return Ok(if remaining > 0 {
          SharedAcquire::AcquiredWithSurplus
        } else {
          SharedAcquire::Acquired
        });
      }
    }
  }

  fn try_release_shared(&self, core: &SyncCore, amount: u32) -> SyncResult<bool> {
    loop {
      let current = core.state().state();
      if core.state().compare_and_set_state(current, current + amount) {
        return Ok(true);
      }
    }
  }
}

/// One-shot gate: closed at 0, open for good once released.
struct Gate;

impl SyncPolicy for Gate {
  fn try_acquire_shared(&self, core: &SyncCore, _amount: u32) -> SyncResult<SharedAcquire> {
    Ok(if core.state().state() != 0 {
      SharedAcquire::AcquiredWithSurplus
    } else {
      SharedAcquire::Failed
    })
  }

  fn try_release_shared(&self, core: &SyncCore, _amount: u32) -> SyncResult<bool> {
    core.state().set_state(1);
    Ok(true)
  }
}

#[test]
fn test_exclusive_acquire_and_release() -> TestResult<()> {
  init_logger();
  let sync = QueuedSynchronizer::new(Mutex);

  sync.acquire(1)?;
  assert_eq!(sync.state(), 1);
  assert!(sync.is_held_exclusively());
  assert!(!sync.try_acquire(1)?);

  assert!(sync.release(1)?);
  assert_eq!(sync.state(), 0);
  assert!(!sync.is_held_exclusively());
  Ok(())
}

#[test]
fn test_release_by_non_owner_fails() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Mutex));
  sync.acquire(1)?;

  let cloned = sync.clone();
  let result = thread::spawn(move || cloned.release(1)).join().unwrap();
  assert!(result.unwrap_err().is_illegal_monitor_state());
  assert_eq!(sync.state(), 1);

  sync.release(1)?;
  Ok(())
}

#[test]
fn test_unimplemented_mode_reports_unsupported() {
  init_logger();
  let sync = QueuedSynchronizer::new(Mutex);
  assert_eq!(
    sync.try_acquire_shared(1).unwrap_err(),
    SyncError::of_unsupported("try_acquire_shared")
  );
  assert_eq!(
    sync.acquire_shared(1).unwrap_err(),
    SyncError::of_unsupported("try_acquire_shared")
  );
  assert!(!sync.has_contended());

  let shared = QueuedSynchronizer::new(Gate);
  assert_eq!(shared.release(1).unwrap_err(), SyncError::of_unsupported("try_release"));
}

#[rstest]
#[case(2, 1000)]
#[case(4, 500)]
#[case(8, 200)]
fn test_exclusive_mode_admits_one_thread_at_a_time(#[case] threads: usize, #[case] iterations: usize) {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Mutex));
  let inside = Arc::new(AtomicUsize::new(0));
  let total = Arc::new(AtomicUsize::new(0));

  let handles = (0..threads)
    .map(|_| {
      let sync = sync.clone();
      let inside = inside.clone();
      let total = total.clone();
      thread::spawn(move || {
        for _ in 0..iterations {
          sync.acquire(1).unwrap();
          assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
          total.fetch_add(1, Ordering::Relaxed);
          inside.fetch_sub(1, Ordering::SeqCst);
          sync.release(1).unwrap();
        }
      })
    })
    .collect::<Vec<_>>();
  for handle in handles {
    handle.join().unwrap();
  }

  assert_eq!(total.load(Ordering::Relaxed), threads * iterations);
  assert_eq!(sync.state(), 0);
  assert!(!sync.has_queued_threads());
}

#[test]
fn test_timed_acquire_gives_up_and_leaves_queue_clean() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Mutex));
  sync.acquire(1)?;

  let cloned = sync.clone();
  let started = Instant::now();
  let acquired = thread::spawn(move || cloned.try_acquire_for(1, Duration::from_millis(50)))
    .join()
    .unwrap()?;
  assert!(!acquired);
  assert!(started.elapsed() >= Duration::from_millis(50));
  assert_eq!(sync.queue_length(), 0);
  assert!(!sync.has_queued_threads());

  sync.release(1)?;
  assert!(sync.try_acquire(1)?);
  Ok(())
}

#[test]
fn test_elapsed_deadline_fails_without_queueing() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Mutex));
  sync.acquire(1)?;

  let cloned = sync.clone();
  let acquired = thread::spawn(move || cloned.try_acquire_until(1, Instant::now()))
    .join()
    .unwrap()?;
  assert!(!acquired);
  assert!(!sync.has_contended());
  Ok(())
}

#[test]
fn test_interruptible_acquire_aborts_on_interrupt() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Mutex));
  sync.acquire(1)?;

  let (tx, rx) = mpsc::channel();
  let cloned = sync.clone();
  let waiter = thread::spawn(move || {
    tx.send(ThreadParker::current()).unwrap();
    cloned.acquire_interruptibly(1)
  });
  let parker = rx.recv()?;
  eventually(|| sync.queue_length() == 1);
  parker.interrupt();

  assert_eq!(waiter.join().unwrap(), Err(SyncError::Interrupted));
  assert_eq!(sync.queue_length(), 0);
  assert!(sync.is_held_exclusively());
  sync.release(1)?;
  Ok(())
}

#[test]
fn test_pending_interrupt_fails_fast() {
  init_logger();
  let sync = QueuedSynchronizer::new(Mutex);
  qsync_utils_rs::self_interrupt();
  assert_eq!(sync.acquire_interruptibly(1), Err(SyncError::Interrupted));
  assert_eq!(sync.state(), 0);
}

#[test]
fn test_uninterruptible_acquire_defers_interrupt() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Mutex));
  sync.acquire(1)?;

  let (tx, rx) = mpsc::channel();
  let cloned = sync.clone();
  let waiter = thread::spawn(move || {
    tx.send(ThreadParker::current()).unwrap();
    cloned.acquire(1).unwrap();
    let interrupted = qsync_utils_rs::interrupted();
    cloned.release(1).unwrap();
    interrupted
  });
  let parker = rx.recv()?;
  eventually(|| sync.queue_length() == 1);
  parker.interrupt();
  thread::sleep(Duration::from_millis(20));
  assert!(sync.is_queued(parker.token()));

  sync.release(1)?;
  assert!(waiter.join().unwrap());
  Ok(())
}

#[test]
fn test_cancelled_neighbours_do_not_strand_waiter() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Mutex));
  sync.acquire(1)?;

  let cloned = sync.clone();
  let patient = thread::spawn(move || {
    cloned.acquire(1).unwrap();
    cloned.release(1).unwrap();
  });
  eventually(|| sync.queue_length() == 1);

  let impatient = (0..3)
    .map(|_| {
      let sync = sync.clone();
      thread::spawn(move || sync.try_acquire_for(1, Duration::from_millis(30)).unwrap())
    })
    .collect::<Vec<_>>();
  for handle in impatient {
    assert!(!handle.join().unwrap());
  }
  assert_eq!(sync.queue_length(), 1);

  sync.release(1)?;
  patient.join().unwrap();
  assert_eq!(sync.state(), 0);
  Ok(())
}

#[test]
fn test_queue_introspection_reports_waiters() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Mutex));
  sync.acquire(1)?;
  assert_eq!(sync.first_queued_thread(), None);

  let mut tokens = Vec::new();
  let mut handles = Vec::new();
  for i in 0..2 {
    let (tx, rx) = mpsc::channel();
    let cloned = sync.clone();
    handles.push(thread::spawn(move || {
      tx.send(ThreadToken::current()).unwrap();
      cloned.acquire(1).unwrap();
      cloned.release(1).unwrap();
    }));
    tokens.push(rx.recv()?);
    eventually(|| sync.queue_length() == i + 1);
  }

  assert!(sync.has_contended());
  assert!(sync.has_queued_threads());
  assert!(sync.has_queued_predecessors());
  assert_eq!(sync.first_queued_thread(), Some(tokens[0]));
  assert!(tokens.iter().all(|token| sync.is_queued(*token)));
  assert!(!sync.is_queued(ThreadToken::current()));
  assert_eq!(sync.queued_threads(), vec![tokens[1], tokens[0]]);
  assert_eq!(sync.exclusive_queued_threads().len(), 2);
  assert!(sync.shared_queued_threads().is_empty());

  sync.release(1)?;
  for handle in handles {
    handle.join().unwrap();
  }
  assert!(!sync.has_queued_threads());
  Ok(())
}

#[test]
fn test_shared_release_opens_gate_for_every_waiter() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Gate));

  let handles = (0..4)
    .map(|_| {
      let sync = sync.clone();
      thread::spawn(move || sync.acquire_shared(1))
    })
    .collect::<Vec<_>>();
  eventually(|| sync.queue_length() == 4);
  assert_eq!(sync.shared_queued_threads().len(), 4);

  assert!(sync.release_shared(1)?);
  for handle in handles {
    handle.join().unwrap()?;
  }
  assert!(!sync.has_queued_threads());
  assert!(sync.try_acquire_shared(1)?.is_acquired());
  Ok(())
}

#[test]
fn test_shared_release_propagates_surplus_permits() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Permits));
  let acquired = Arc::new(AtomicUsize::new(0));

  let handles = (0..3)
    .map(|_| {
      let sync = sync.clone();
      let acquired = acquired.clone();
      thread::spawn(move || {
        sync.acquire_shared(1).unwrap();
        acquired.fetch_add(1, Ordering::SeqCst);
      })
    })
    .collect::<Vec<_>>();
  eventually(|| sync.queue_length() == 3);

  sync.release_shared(3)?;
  for handle in handles {
    handle.join().unwrap();
  }
  assert_eq!(acquired.load(Ordering::SeqCst), 3);
  assert_eq!(sync.state(), 0);
  Ok(())
}

#[test]
fn test_timed_shared_acquire_times_out() -> TestResult<()> {
  init_logger();
  let sync = QueuedSynchronizer::new(Permits);
  assert!(!sync.try_acquire_shared_for(1, Duration::from_millis(20))?);
  assert!(!sync.has_queued_threads());

  sync.release_shared(1)?;
  assert!(sync.try_acquire_shared_for(1, Duration::from_millis(20))?);
  assert_eq!(sync.state(), 0);
  Ok(())
}

#[test]
fn test_interruptible_shared_acquire_aborts_on_interrupt() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Gate));

  let (tx, rx) = mpsc::channel();
  let cloned = sync.clone();
  let waiter = thread::spawn(move || {
    tx.send(ThreadParker::current()).unwrap();
    cloned.acquire_shared_interruptibly(1)
  });
  let parker = rx.recv()?;
  eventually(|| sync.queue_length() == 1);
  parker.interrupt();

  assert_eq!(waiter.join().unwrap(), Err(SyncError::Interrupted));
  assert_eq!(sync.queue_length(), 0);
  Ok(())
}

#[test]
fn test_condition_ownership_is_checked() -> TestResult<()> {
  init_logger();
  let sync = Arc::new(QueuedSynchronizer::new(Mutex));
  let other = Arc::new(QueuedSynchronizer::new(Mutex));
  let condition = ConditionObject::new(sync.clone());
  assert!(sync.owns(&condition));
  assert!(!other.owns(&condition));

  other.acquire(1)?;
  assert_eq!(other.has_waiters(&condition), Err(SyncError::ForeignCondition));
  other.release(1)?;

  assert!(sync.wait_queue_length(&condition).unwrap_err().is_illegal_monitor_state());
  sync.acquire(1)?;
  assert_eq!(sync.wait_queue_length(&condition)?, 0);
  assert!(sync.waiting_threads(&condition)?.is_empty());
  sync.release(1)?;
  Ok(())
}
