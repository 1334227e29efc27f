// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios exercising the synchronization core with
//! real threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nucleus::clock;
use spin::Mutex as SpinLock;
use tandem_rt::cond::{CondAttr, ShadowCond};
use tandem_rt::error::Errno;
use tandem_rt::event::{EventAttr, EventMode, ShadowEvent};
use tandem_rt::mq::{AccessMode, MqAttr, MqOpenFlags};
use tandem_rt::mutex::{MutexAttr, MutexProtocol, ShadowMutex};
use tandem_rt::sem::{SemFlags, ShadowSem};
use tandem_rt::signal::SigEvent;
use tandem_rt::syscall;
use tandem_rt::thread::{RtThread, SchedParam};
use tandem_rt::{Kernel, Process};

fn setup(name: &str, prio: i32) -> (Arc<Kernel>, Arc<Process>, Arc<RtThread>) {
    let kernel = Kernel::new();
    let process = Process::new(&kernel);
    let thread = RtThread::attach_current(&process, name, SchedParam::fifo(prio)).unwrap();
    (kernel, process, thread)
}

fn spin_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::yield_now();
    }
}

/// Scenario 1: priority inheritance across a contended mutex.
///
/// L (prio 1) holds a PI mutex; H (prio 3) blocks on it, boosting L
/// to 3 until release; M (prio 2) queues behind H and acquires last.
#[test]
fn pi_boost_and_wake_order() {
    let (_kernel, process, _main) = setup("pi-main", 0);
    let mutex = Arc::new(
        ShadowMutex::init(MutexAttr {
            protocol: MutexProtocol::PriorityInherit,
            ..Default::default()
        })
        .unwrap(),
    );
    let order = Arc::new(SpinLock::new(Vec::new()));
    let low_holds = Arc::new(AtomicBool::new(false));
    let release_low = Arc::new(AtomicBool::new(false));

    let (m, lh, rl) = (mutex.clone(), low_holds.clone(), release_low.clone());
    let low = RtThread::spawn(&process, "L", SchedParam::fifo(1), move || {
        m.lock().unwrap();
        lh.store(true, Ordering::Release);
        while !rl.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        m.unlock().unwrap();
    })
    .unwrap();

    spin_until("L to take the lock", || low_holds.load(Ordering::Acquire));
    assert_eq!(low.nucleus().effective_priority(), 1);

    let (m, o) = (mutex.clone(), order.clone());
    let high = RtThread::spawn(&process, "H", SchedParam::fifo(3), move || {
        m.lock().unwrap();
        o.lock().push('H');
        m.unlock().unwrap();
    })
    .unwrap();

    // H blocking on the lock must boost L to priority 3.
    spin_until("the PI boost", || low.nucleus().effective_priority() == 3);
    assert_eq!(low.nucleus().base_priority(), 1);

    let (m, o) = (mutex.clone(), order.clone());
    let mid = RtThread::spawn(&process, "M", SchedParam::fifo(2), move || {
        m.lock().unwrap();
        o.lock().push('M');
        m.unlock().unwrap();
    })
    .unwrap();
    // Give M time to queue behind H.
    std::thread::sleep(Duration::from_millis(30));

    release_low.store(true, Ordering::Release);
    low.join().unwrap();
    high.join().unwrap();
    mid.join().unwrap();

    // The boost fell away with the release and the hand-off went
    // highest priority first.
    assert_eq!(low.nucleus().effective_priority(), 1);
    assert_eq!(*order.lock(), vec!['H', 'M']);
    mutex.destroy().unwrap();
}

/// Scenario 2: a signal issued while holding the mutex is delivered
/// by the unlock, not before.
#[test]
fn deferred_cond_signal_delivers_at_unlock() {
    let (_kernel, process, _main) = setup("cond-main", 1);
    let mutex = Arc::new(ShadowMutex::init(MutexAttr::default()).unwrap());
    let cond = Arc::new(ShadowCond::init(CondAttr::default()).unwrap());
    let woken = Arc::new(AtomicBool::new(false));
    let holds = Arc::new(AtomicBool::new(false));

    let (m, c, w, h) = (mutex.clone(), cond.clone(), woken.clone(), holds.clone());
    let waiter = RtThread::spawn(&process, "waiter", SchedParam::fifo(2), move || {
        m.lock().unwrap();
        h.store(true, Ordering::Release);
        c.wait(&m, None).unwrap();
        w.store(true, Ordering::Release);
        m.unlock().unwrap();
    })
    .unwrap();

    // Lock only once the waiter holds the mutex: our acquisition then
    // proves its prologue released it, with the waiter committed to
    // the sleep (the prologue publishes the waiter before the
    // release).
    spin_until("the waiter to take the lock", || holds.load(Ordering::Acquire));
    mutex.lock().unwrap();
    cond.signal().unwrap();

    // The signal is deferred on the lock word; no wake may happen
    // while we still hold the mutex.
    std::thread::sleep(Duration::from_millis(40));
    assert!(!woken.load(Ordering::Acquire));

    mutex.unlock().unwrap();
    waiter.join().unwrap();
    assert!(woken.load(Ordering::Acquire));

    // The binding dissolved with the last waiter and the lock word
    // carries no residue: both objects go away cleanly.
    cond.destroy().unwrap();
    mutex.destroy().unwrap();
}

/// Scenario 3: broadcast with one waiter interrupted between the two
/// wait phases; the interrupted waiter still reacquires the mutex and
/// the condvar unbinds after the last epilogue.
#[test]
fn cond_broadcast_with_interrupted_waiter() {
    let (_kernel, process, _main) = setup("bcast-main", 1);
    let mutex = Arc::new(ShadowMutex::init(MutexAttr::default()).unwrap());
    let cond = Arc::new(ShadowCond::init(CondAttr::default()).unwrap());
    let results: Arc<SpinLock<Vec<(char, Result<(), Errno>)>>> =
        Arc::new(SpinLock::new(Vec::new()));
    let entered = Arc::new(AtomicUsize::new(0));

    let mut waiters = Vec::new();
    for tag in ['a', 'b', 'c'] {
        let (m, c, r, e) = (mutex.clone(), cond.clone(), results.clone(), entered.clone());
        waiters.push(
            RtThread::spawn(&process, &format!("w-{tag}"), SchedParam::fifo(2), move || {
                m.lock().unwrap();
                e.fetch_add(1, Ordering::SeqCst);
                let outcome = c.wait(&m, None).map_err(|err| err.error());
                r.lock().push((tag, outcome));
                m.unlock().unwrap();
            })
            .unwrap(),
        );
    }
    spin_until("all three to reach the wait", || {
        entered.load(Ordering::SeqCst) == 3
    });
    // All three hold-and-released the mutex; give the last one time
    // to finish its prologue.
    std::thread::sleep(Duration::from_millis(30));

    // Deliver the host signal to the middle waiter until its wait
    // reports the interruption.
    let victim = waiters[1].clone();
    spin_until("the victim to take the interrupt", || {
        let _ = syscall::sys_sigkill(victim.tid(), 9);
        std::thread::sleep(Duration::from_millis(2));
        results.lock().iter().any(|(tag, _)| *tag == 'b')
    });
    assert_eq!(
        results.lock().iter().find(|(t, _)| *t == 'b').unwrap().1,
        Err(Errno::EINTR)
    );

    // Broadcast while nobody holds the mutex: the remaining two wake
    // with success.
    cond.broadcast().unwrap();
    for waiter in waiters {
        waiter.join().unwrap();
    }
    let results = results.lock();
    assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 2);

    // Everyone epilogued, so the condvar is unbound and destructible.
    cond.destroy().unwrap();
    mutex.destroy().unwrap();
}

/// Scenario 4: priority-ordered delivery and the one-shot arrival
/// notification on the empty-to-non-empty edge.
#[test]
fn mq_priority_order_and_single_notification() {
    let (_kernel, _process, _main) = setup("mq-main", 1);
    const NOTIFY_SIG: u32 = 17;
    let fd = syscall::sys_mq_open(
        "scn4",
        AccessMode::ReadWrite,
        MqOpenFlags::CREAT,
        Some(MqAttr {
            maxmsg: 2,
            msgsize: 64,
        }),
    )
    .unwrap();
    syscall::sys_mq_notify(
        fd,
        Some(SigEvent {
            signo: NOTIFY_SIG,
            value: 99,
        }),
    )
    .unwrap();

    syscall::sys_mq_timedsend(fd, b"low", 1, None).unwrap();
    syscall::sys_mq_timedsend(fd, b"high", 5, None).unwrap();

    // Exactly one notification, from the 0 -> 1 transition.
    let si = syscall::sys_sigwaitinfo(1u64 << (NOTIFY_SIG - 1)).unwrap();
    assert_eq!(si.signo, NOTIFY_SIG);
    assert_eq!(si.value, 99);
    assert_eq!(syscall::sys_sigpending().unwrap(), 0);

    let (first, prio_first) = syscall::sys_mq_timedreceive(fd, 64, None).unwrap();
    let (second, prio_second) = syscall::sys_mq_timedreceive(fd, 64, None).unwrap();
    assert_eq!((first.as_slice(), prio_first), (b"high".as_slice(), 5));
    assert_eq!((second.as_slice(), prio_second), (b"low".as_slice(), 1));

    // The notification disarmed itself; a second cycle stays silent.
    syscall::sys_mq_timedsend(fd, b"again", 1, None).unwrap();
    let probe = syscall::sys_sigtimedwait(
        1u64 << (NOTIFY_SIG - 1),
        clock::now() + 20_000_000,
    );
    assert_eq!(probe.unwrap_err().error(), Errno::EAGAIN);

    syscall::sys_mq_close(fd).unwrap();
    syscall::sys_mq_unlink("scn4").unwrap();
}

/// Scenario 5: an ANY-mode waiter wakes with exactly the satisfied
/// subset of its mask.
#[test]
fn event_any_wait_returns_satisfied_bits() {
    let (_kernel, process, _main) = setup("event-main", 1);
    let event = Arc::new(ShadowEvent::init(0, EventAttr::default()).unwrap());
    let seen = Arc::new(AtomicUsize::new(usize::MAX));

    let (e, s) = (event.clone(), seen.clone());
    let waiter = RtThread::spawn(&process, "ev-waiter", SchedParam::fifo(2), move || {
        let bits = e.wait(0b1010, EventMode::Any, None).unwrap();
        s.store(bits as usize, Ordering::SeqCst);
    })
    .unwrap();

    spin_until("the waiter to block", || {
        event.inquire().unwrap().nwaiters == 1
    });
    event.post(0b0010).unwrap();
    waiter.join().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 0b0010);
    event.destroy().unwrap();
}

/// Scenario 6: destroy-while-waiter honors the no-busy-delete flag;
/// without it the waiter is flushed with `EINVAL`.
#[test]
fn sem_destroy_with_waiters() {
    let (_kernel, process, _main) = setup("sem-main", 1);

    // Guarded semaphore: destroy refuses while pended.
    let guarded = Arc::new(
        ShadowSem::init(SemFlags::NOBUSYDEL | SemFlags::REPORT, 0).unwrap(),
    );
    let (g, release) = (guarded.clone(), Arc::new(AtomicBool::new(false)));
    let r = release.clone();
    let blocked = RtThread::spawn(&process, "sem-blocked", SchedParam::fifo(2), move || {
        g.wait().unwrap();
        while !r.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    })
    .unwrap();
    spin_until("the waiter to deplete the count", || {
        guarded.getvalue().unwrap() == -1
    });
    assert_eq!(guarded.destroy().unwrap_err().error(), Errno::EBUSY);
    guarded.post().unwrap();
    release.store(true, Ordering::Release);
    blocked.join().unwrap();
    guarded.destroy().unwrap();

    // Unguarded semaphore: destroy succeeds and the waiter learns the
    // object died.
    let plain = Arc::new(ShadowSem::init(SemFlags::REPORT, 0).unwrap());
    let p = plain.clone();
    let doomed = RtThread::spawn(&process, "sem-doomed", SchedParam::fifo(2), move || {
        assert_eq!(p.wait().unwrap_err().error(), Errno::EINVAL);
    })
    .unwrap();
    spin_until("the waiter to deplete the count", || {
        plain.getvalue().unwrap() == -1
    });
    assert!(!plain.destroy().unwrap());
    doomed.join().unwrap();
}
