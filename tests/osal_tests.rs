//! End-to-end tests on the hosted backend
//!
//! With a 1000 Hz tick, one tick is one millisecond of wall time; timing
//! assertions use generous windows so loaded CI machines stay green.

use std::ptr;
use std::sync::{Mutex as StdMutex, Once};
use std::time::{Duration, Instant};

use portable_atomic::{AtomicU32, AtomicU64, Ordering};

use osal::critical::{enter_isr_for_test, exit_isr_for_test};
use osal::task::{self, Task};
use osal::types::TaskState;
use osal::{
    mem, os_init, os_start, Mutex, OsError, Queue, Semaphore, Timer, TimerMode, NO_WAIT,
    WAIT_FOREVER,
};

// One kernel per process; every test shares it, and tests that measure
// heap stats or timer counts must not interleave
static SERIAL: StdMutex<()> = StdMutex::new(());
static BOOT: Once = Once::new();

fn setup() -> std::sync::MutexGuard<'static, ()> {
    BOOT.call_once(|| {
        os_init().unwrap();
        os_start().unwrap();
    });
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn wait_deleted(t: &Task) {
    let start = Instant::now();
    while t.state() != TaskState::Deleted && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(t.state(), TaskState::Deleted);
}

// ============ Mutex ============

static RACE_MUTEX: Mutex = Mutex::new();
static RACE_COUNTER: AtomicU64 = AtomicU64::new(0);
static RACE_DONE: AtomicU32 = AtomicU32::new(0);

fn race_entry(_arg: *mut ()) {
    for _ in 0..200 {
        RACE_MUTEX.lock(WAIT_FOREVER).unwrap();
        // Deliberately non-atomic read-modify-write; the lock is the
        // only thing preventing lost updates
        let v = RACE_COUNTER.load(Ordering::Relaxed);
        task::yield_now();
        RACE_COUNTER.store(v + 1, Ordering::Relaxed);
        RACE_MUTEX.unlock().unwrap();
    }
    RACE_DONE.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn mutex_serializes_two_racing_tasks() {
    let _g = setup();
    RACE_COUNTER.store(0, Ordering::SeqCst);
    RACE_DONE.store(0, Ordering::SeqCst);

    let a = Task::create("race-a", race_entry, ptr::null_mut(), 10, 256).unwrap();
    let b = Task::create("race-b", race_entry, ptr::null_mut(), 10, 256).unwrap();
    wait_deleted(&a);
    wait_deleted(&b);

    assert_eq!(RACE_DONE.load(Ordering::SeqCst), 2);
    assert_eq!(RACE_COUNTER.load(Ordering::SeqCst), 400);
}

static HOLD_MUTEX: Mutex = Mutex::new();

fn holder_entry(_arg: *mut ()) {
    HOLD_MUTEX.lock(NO_WAIT).unwrap();
    let _ = task::delay(100);
    HOLD_MUTEX.unlock().unwrap();
}

#[test]
fn contended_lock_blocks_until_unlock() {
    let _g = setup();

    let holder = Task::create("holder", holder_entry, ptr::null_mut(), 5, 256).unwrap();

    // Wait until the holder actually owns the lock
    let start = Instant::now();
    while !HOLD_MUTEX.is_locked() && start.elapsed() < Duration::from_secs(2) {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(HOLD_MUTEX.is_locked());
    assert!(!HOLD_MUTEX.try_lock());

    let blocked_at = Instant::now();
    HOLD_MUTEX.lock(WAIT_FOREVER).unwrap();
    assert!(blocked_at.elapsed() >= Duration::from_millis(50));
    HOLD_MUTEX.unlock().unwrap();

    wait_deleted(&holder);
}

static FOREIGN_MUTEX: Mutex = Mutex::new();
static FOREIGN_RESULT: AtomicU32 = AtomicU32::new(0);

fn foreign_unlock_entry(_arg: *mut ()) {
    let code = match FOREIGN_MUTEX.unlock() {
        Err(OsError::Error) => 1,
        _ => 2,
    };
    FOREIGN_RESULT.store(code, Ordering::SeqCst);
}

#[test]
fn unlock_by_non_owner_is_rejected() {
    let _g = setup();

    FOREIGN_MUTEX.lock(NO_WAIT).unwrap();
    let t = Task::create("foreign", foreign_unlock_entry, ptr::null_mut(), 8, 256).unwrap();
    wait_deleted(&t);

    assert_eq!(FOREIGN_RESULT.load(Ordering::SeqCst), 1);
    assert!(FOREIGN_MUTEX.is_locked());
    FOREIGN_MUTEX.unlock().unwrap();
}

#[test]
fn lock_timeout_expires() {
    let _g = setup();

    let m = Mutex::new();
    m.lock(NO_WAIT).unwrap();
    // Same task re-locking is refused outright, so use a fresh thread
    // through the task API for the timed attempt
    static TIMED: Mutex = Mutex::new();
    static TIMED_RESULT: AtomicU32 = AtomicU32::new(0);

    fn timed_entry(_arg: *mut ()) {
        let code = match TIMED.lock(50) {
            Err(OsError::Timeout) => 1,
            _ => 2,
        };
        TIMED_RESULT.store(code, Ordering::SeqCst);
    }

    TIMED.lock(NO_WAIT).unwrap();
    let t = Task::create("timed", timed_entry, ptr::null_mut(), 8, 256).unwrap();
    wait_deleted(&t);
    assert_eq!(TIMED_RESULT.load(Ordering::SeqCst), 1);
    TIMED.unlock().unwrap();
    m.unlock().unwrap();
}

// ============ Semaphore ============

#[test]
fn semaphore_count_is_min_of_gives_and_ceiling() {
    let _g = setup();

    let sem = Semaphore::new(0, 10);
    for _ in 0..7 {
        sem.give().unwrap();
    }
    for _ in 0..3 {
        sem.take(NO_WAIT).unwrap();
    }
    assert_eq!(sem.count(), 4);

    let capped = Semaphore::new(0, 5);
    for _ in 0..20 {
        capped.give().unwrap();
    }
    assert_eq!(capped.count(), 5);
}

static SIGNAL: Semaphore = Semaphore::new(0, 1);

fn signaler_entry(_arg: *mut ()) {
    let _ = task::delay(60);
    SIGNAL.give().unwrap();
}

#[test]
fn take_blocks_until_given() {
    let _g = setup();

    let t = Task::create("signaler", signaler_entry, ptr::null_mut(), 6, 256).unwrap();
    let start = Instant::now();
    SIGNAL.take(WAIT_FOREVER).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));
    wait_deleted(&t);
}

static ORDER_SEM: Semaphore = Semaphore::new(0, 3);
static ORDER_LOG: StdMutex<Vec<u8>> = StdMutex::new(Vec::new());

fn order_entry(arg: *mut ()) {
    let tag = arg as usize as u8;
    ORDER_SEM.take(WAIT_FOREVER).unwrap();
    ORDER_LOG.lock().unwrap().push(tag);
}

#[test]
fn contenders_are_released_in_priority_order() {
    let _g = setup();
    ORDER_LOG.lock().unwrap().clear();

    // Arrival order deliberately disagrees with priority order
    let low = Task::create("order-low", order_entry, 3 as *mut (), 20, 256).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    let high = Task::create("order-high", order_entry, 1 as *mut (), 4, 256).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    let mid = Task::create("order-mid", order_entry, 2 as *mut (), 12, 256).unwrap();
    std::thread::sleep(Duration::from_millis(30));

    for _ in 0..3 {
        ORDER_SEM.give().unwrap();
        std::thread::sleep(Duration::from_millis(30));
    }

    wait_deleted(&low);
    wait_deleted(&high);
    wait_deleted(&mid);
    assert_eq!(*ORDER_LOG.lock().unwrap(), vec![1, 2, 3]);
}

static FIFO_SEM: Semaphore = Semaphore::new(0, 2);
static FIFO_LOG: StdMutex<Vec<u8>> = StdMutex::new(Vec::new());

fn fifo_entry(arg: *mut ()) {
    let tag = arg as usize as u8;
    FIFO_SEM.take(WAIT_FOREVER).unwrap();
    FIFO_LOG.lock().unwrap().push(tag);
}

#[test]
fn equal_priority_contenders_are_released_fifo() {
    let _g = setup();
    FIFO_LOG.lock().unwrap().clear();

    let first = Task::create("fifo-first", fifo_entry, 1 as *mut (), 10, 256).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    let second = Task::create("fifo-second", fifo_entry, 2 as *mut (), 10, 256).unwrap();
    std::thread::sleep(Duration::from_millis(30));

    for _ in 0..2 {
        FIFO_SEM.give().unwrap();
        std::thread::sleep(Duration::from_millis(30));
    }

    wait_deleted(&first);
    wait_deleted(&second);
    assert_eq!(*FIFO_LOG.lock().unwrap(), vec![1, 2]);
}

#[test]
fn take_times_out_on_empty_semaphore() {
    let _g = setup();

    let sem = Semaphore::new(0, 1);
    let start = Instant::now();
    assert_eq!(sem.take(50), Err(OsError::Timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(40));
    assert!(elapsed < Duration::from_millis(1000));
}

// ============ Queue ============

#[test]
fn queue_preserves_fifo_order() {
    let _g = setup();

    let q = Queue::create(8, 4).unwrap();
    for i in 0u32..8 {
        q.send(&i.to_le_bytes(), NO_WAIT).unwrap();
    }
    for i in 0u32..8 {
        let mut out = [0u8; 4];
        q.receive(&mut out, NO_WAIT).unwrap();
        assert_eq!(u32::from_le_bytes(out), i);
    }
}

#[test]
fn send_front_jumps_the_line() {
    let _g = setup();

    let q = Queue::create(4, 4).unwrap();
    q.send(&1u32.to_le_bytes(), NO_WAIT).unwrap();
    q.send(&2u32.to_le_bytes(), NO_WAIT).unwrap();
    q.send_front(&99u32.to_le_bytes(), NO_WAIT).unwrap();

    let mut out = [0u8; 4];
    q.receive(&mut out, NO_WAIT).unwrap();
    assert_eq!(u32::from_le_bytes(out), 99);
}

#[test]
fn isr_variants_work_and_blocking_calls_are_rejected_in_isr() {
    let _g = setup();

    let q = Queue::create(2, 1).unwrap();
    let sem = Semaphore::new(0, 1);

    enter_isr_for_test();
    assert_eq!(q.send(&[1], NO_WAIT), Err(OsError::Error));
    assert_eq!(sem.take(NO_WAIT), Err(OsError::Error));

    q.send_from_isr(&[7]).unwrap();
    sem.give_from_isr().unwrap();

    let mut out = [0u8; 1];
    q.receive_from_isr(&mut out).unwrap();
    assert_eq!(out[0], 7);
    assert_eq!(q.receive_from_isr(&mut out), Err(OsError::Empty));
    exit_isr_for_test();

    sem.take(NO_WAIT).unwrap();
}

static ISR_WAKE_SEM: Semaphore = Semaphore::new(0, 1);
static ISR_WAKE_FLAG: AtomicU32 = AtomicU32::new(0);

fn isr_wake_entry(_arg: *mut ()) {
    ISR_WAKE_SEM.take(WAIT_FOREVER).unwrap();
    ISR_WAKE_FLAG.store(1, Ordering::SeqCst);
}

#[test]
fn isr_give_releases_a_blocked_taker() {
    let _g = setup();
    ISR_WAKE_FLAG.store(0, Ordering::SeqCst);

    let t = Task::create("isr-wake", isr_wake_entry, ptr::null_mut(), 7, 256).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(ISR_WAKE_FLAG.load(Ordering::SeqCst), 0);

    enter_isr_for_test();
    ISR_WAKE_SEM.give_from_isr().unwrap();
    exit_isr_for_test();

    wait_deleted(&t);
    assert_eq!(ISR_WAKE_FLAG.load(Ordering::SeqCst), 1);
}

static XFER: StdMutex<Option<Queue>> = StdMutex::new(None);

fn drainer_entry(_arg: *mut ()) {
    let _ = task::delay(60);
    let guard = XFER.lock().unwrap();
    let q = guard.as_ref().unwrap();
    let mut out = [0u8; 1];
    q.receive(&mut out, WAIT_FOREVER).unwrap();
}

#[test]
fn send_to_full_queue_blocks_until_drained() {
    let _g = setup();

    *XFER.lock().unwrap() = Some(Queue::create(1, 1).unwrap());
    {
        let guard = XFER.lock().unwrap();
        guard.as_ref().unwrap().send(&[1], NO_WAIT).unwrap();
    }

    let t = Task::create("drainer", drainer_entry, ptr::null_mut(), 6, 256).unwrap();

    let start = Instant::now();
    {
        let guard = XFER.lock().unwrap();
        guard.as_ref().unwrap().send(&[2], WAIT_FOREVER).unwrap();
    }
    assert!(start.elapsed() >= Duration::from_millis(30));

    wait_deleted(&t);
    *XFER.lock().unwrap() = None;
}

// ============ Timers ============

static PERIODIC_HITS: AtomicU32 = AtomicU32::new(0);

fn periodic_cb(_arg: *mut ()) {
    PERIODIC_HITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn periodic_timer_fires_on_schedule_and_stops_cleanly() {
    let _g = setup();
    PERIODIC_HITS.store(0, Ordering::SeqCst);

    let t = Timer::create(100, TimerMode::Periodic, periodic_cb, ptr::null_mut()).unwrap();
    t.start().unwrap();

    std::thread::sleep(Duration::from_millis(360));
    let hits = PERIODIC_HITS.load(Ordering::SeqCst);
    assert!((2..=4).contains(&hits), "expected ~3 callbacks, got {hits}");

    t.stop().unwrap();
    assert!(!t.is_active());
    // Wait out any callback already in flight, then confirm silence
    std::thread::sleep(Duration::from_millis(50));
    let settled = PERIODIC_HITS.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(PERIODIC_HITS.load(Ordering::SeqCst), settled);
}

static ONESHOT_HITS: AtomicU32 = AtomicU32::new(0);

fn oneshot_cb(_arg: *mut ()) {
    ONESHOT_HITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn one_shot_fires_once_and_goes_inactive() {
    let _g = setup();
    ONESHOT_HITS.store(0, Ordering::SeqCst);

    let t = Timer::create(50, TimerMode::OneShot, oneshot_cb, ptr::null_mut()).unwrap();
    t.start().unwrap();
    assert!(t.is_active());

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(ONESHOT_HITS.load(Ordering::SeqCst), 1);
    assert!(!t.is_active());

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(ONESHOT_HITS.load(Ordering::SeqCst), 1);
}

// ============ Memory ============

#[test]
fn aligned_allocation_round_trips_and_frees_clean() {
    let _g = setup();

    let before = mem::stats();
    let p = mem::alloc_aligned(32, 100);
    assert!(!p.is_null());
    assert_eq!(p as usize % 32, 0);

    unsafe {
        for i in 0..100u8 {
            p.add(i as usize).write(i);
        }
        for i in 0..100u8 {
            assert_eq!(p.add(i as usize).read(), i);
        }
    }

    mem::free(p);
    let after = mem::stats();
    assert_eq!(after.free, before.free);
}

#[test]
fn calloc_zeroes_and_realloc_preserves() {
    let _g = setup();

    let p = mem::calloc(16, 8);
    assert!(!p.is_null());
    unsafe {
        for i in 0..128 {
            assert_eq!(p.add(i).read(), 0);
        }
        for i in 0..128 {
            p.add(i).write(i as u8);
        }
    }

    let bigger = mem::realloc(p, 512);
    assert!(!bigger.is_null());
    unsafe {
        for i in 0..128 {
            assert_eq!(bigger.add(i).read(), i as u8);
        }
    }
    mem::free(bigger);
}

#[test]
fn watermark_never_rises() {
    let _g = setup();

    let s1 = mem::stats();
    assert!(s1.min_free <= s1.free);

    let p = mem::alloc(1024);
    assert!(!p.is_null());
    let s2 = mem::stats();
    assert!(s2.min_free <= s1.min_free);

    mem::free(p);
    let s3 = mem::stats();
    assert!(s3.min_free <= s2.free);
    assert!(s3.min_free <= s1.min_free);
}

#[test]
fn zero_size_and_bad_align_yield_null() {
    let _g = setup();

    assert!(mem::alloc(0).is_null());
    assert!(mem::alloc_aligned(0, 16).is_null());
    assert!(mem::alloc_aligned(24, 16).is_null());
    // Freeing null is a no-op
    mem::free(ptr::null_mut());
}

#[test]
fn absurd_sizes_fail_cleanly() {
    let _g = setup();

    assert!(mem::alloc(usize::MAX).is_null());
    assert!(mem::calloc(usize::MAX, 2).is_null());

    let p = mem::alloc(16);
    assert!(!p.is_null());
    assert!(mem::realloc(p, usize::MAX).is_null());
    mem::free(p);
}

// ============ Tasks and lifecycle ============

#[test]
fn second_init_reports_already_initialized() {
    let _g = setup();
    assert_eq!(os_init(), Err(OsError::AlreadyInit));
    assert!(osal::is_running());
}

#[test]
fn delay_sleeps_at_least_the_requested_ticks() {
    let _g = setup();

    let start = Instant::now();
    task::delay(50).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(40));
}

static PRIO_PROBE: AtomicU32 = AtomicU32::new(0);

fn prio_probe_entry(_arg: *mut ()) {
    PRIO_PROBE.store(1, Ordering::SeqCst);
    let _ = task::delay(200);
}

#[test]
fn task_attributes_are_observable_through_the_handle() {
    let _g = setup();

    let t = Task::create("probe", prio_probe_entry, ptr::null_mut(), 12, 256).unwrap();
    assert_eq!(t.name(), "probe");
    assert_eq!(t.prio(), 12);

    t.set_prio(9).unwrap();
    assert_eq!(t.prio(), 9);
    assert_eq!(t.set_prio(200), Err(OsError::InvalidParam));

    t.delete().unwrap();
}
