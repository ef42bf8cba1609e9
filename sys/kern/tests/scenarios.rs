// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scheduling scenarios, run against the kernel state
//! machine on the host.
//!
//! The harness plays the role of the tick interrupt and the
//! context-switch trap: each simulated tick advances time by one,
//! takes a scheduler pass, and then acts as the chosen thread --
//! incrementing counters, taking locks, or announcing blocks exactly
//! the way the thread's code would. Determinism makes the expected
//! counts exact.

use abi::{Priority, ThreadId, Wake};
use kern::thread::StackRef;
use kern::Kernel;

fn nop(_arg: usize) -> usize {
    0
}

fn stack(i: usize) -> StackRef {
    StackRef {
        base: 0x1000_0000 + i * 0x2000,
        size: 0x2000,
    }
}

fn spawn(k: &mut Kernel, pri: u8, i: usize) -> ThreadId {
    let (t, _hint) = k
        .thread_init_and_run(Priority(pri), nop, 0, stack(i))
        .expect("spawn");
    t
}

/// One simulated tick: time advances, the trap runs the scheduler, and
/// the caller learns which thread has the CPU for this tick.
fn tick(k: &mut Kernel) -> ThreadId {
    k.advance_time(1);
    k.schedule()
}

#[test]
fn priority_starvation() {
    const T: u64 = 5000;
    const D: u64 = 50;

    let mut k = Kernel::new();
    let ts = [
        spawn(&mut k, 1, 0),
        spawn(&mut k, 2, 1),
        spawn(&mut k, 3, 2),
    ];
    let _idle = spawn(&mut k, 7, 3);
    let _ = k.schedule();

    // Each thread: increment, then spin (non-blocking) for D ticks.
    let mut counter = [0u64; 3];
    let mut busy = [0u64; 3];
    for _ in 0..T {
        let cur = tick(&mut k);
        for i in 0..3 {
            if cur == ts[i] {
                if busy[i] == 0 {
                    counter[i] += 1;
                    busy[i] = D - 1;
                } else {
                    busy[i] -= 1;
                }
            }
        }
    }

    for t in ts {
        k.request_stop(t).unwrap();
    }
    assert!(counter[0] >= T / D && counter[0] <= T / D + 1);
    assert_eq!(counter[1], 0, "pri 2 must starve under a busy pri 1");
    assert_eq!(counter[2], 0, "pri 3 must starve under a busy pri 1");
}

#[test]
fn priority_change_mid_run() {
    const T: u64 = 5000;
    const D: u64 = 50;

    let mut k = Kernel::new();
    let ts = [
        spawn(&mut k, 1, 0),
        spawn(&mut k, 2, 1),
        spawn(&mut k, 3, 2),
    ];
    let _idle = spawn(&mut k, 7, 3);
    let _ = k.schedule();

    let mut counter = [0u64; 3];
    let mut busy = [0u64; 3];
    for step in 0..T {
        if step == T / 2 {
            // Swap the busy hog and the starved thread.
            let _ = k.change_priority(ts[0], Priority(2)).unwrap();
            let _ = k.change_priority(ts[1], Priority(1)).unwrap();
        }
        let cur = tick(&mut k);
        for i in 0..3 {
            if cur == ts[i] {
                if busy[i] == 0 {
                    counter[i] += 1;
                    busy[i] = D - 1;
                } else {
                    busy[i] -= 1;
                }
            }
        }
    }

    // Each hog owned the CPU for half the run.
    let half = T / 2 / D;
    assert!(counter[0] >= half - 1 && counter[0] <= half + 1);
    assert!(counter[1] >= half - 1 && counter[1] <= half + 1);
    assert!(
        counter[0] + counter[1] >= T / D && counter[0] + counter[1] <= T / D + 2
    );
    assert_eq!(counter[2], 0);
}

#[test]
fn uniform_timers() {
    const T: u64 = 5000;
    const D: u64 = 50;

    let mut k = Kernel::new();
    let ts = [
        spawn(&mut k, 1, 0),
        spawn(&mut k, 3, 1),
        spawn(&mut k, 3, 2),
    ];
    let _idle = spawn(&mut k, 7, 3);
    let _ = k.schedule();

    // Each thread: increment, then sleep D (blocking).
    let mut counter = [0u64; 3];
    for _ in 0..T {
        let cur = tick(&mut k);
        for i in 0..3 {
            if cur == ts[i] {
                counter[i] += 1;
                k.sleep_prepare(D);
            }
        }
    }

    for c in counter {
        assert_eq!(c, T / D);
    }
}

#[test]
fn harmonic_timers() {
    // D has to divide by four for the fastest thread's period, so this
    // scenario runs with D = 48 over the same total-work shape.
    const T: u64 = 4800;
    const D: u64 = 48;

    let mut k = Kernel::new();
    let ts = [
        spawn(&mut k, 1, 0),
        spawn(&mut k, 2, 1),
        spawn(&mut k, 3, 2),
    ];
    let _idle = spawn(&mut k, 7, 3);
    let _ = k.schedule();

    let delays = [D, D / 2, D / 4];
    let mut counter = [0u64; 3];
    for _ in 0..T {
        let cur = tick(&mut k);
        for i in 0..3 {
            if cur == ts[i] {
                counter[i] += 1;
                k.sleep_prepare(delays[i]);
            }
        }
    }

    assert_eq!(counter[0], T / D);
    assert_eq!(counter[1], 2 * T / D);
    assert_eq!(counter[2], 4 * T / D);
}

#[test]
fn mutex_priority_inheritance_keeps_the_fast_lane_open() {
    const T: u64 = 5000;

    let mut k = Kernel::new();
    // A holds the mutex for stretches at low priority; M burns CPU in
    // bursts in the middle band; B needs the mutex constantly at the
    // top.
    let a = spawn(&mut k, 3, 0);
    let m_thread = spawn(&mut k, 2, 1);
    let b = spawn(&mut k, 1, 2);
    let _idle = spawn(&mut k, 7, 3);
    let _ = k.schedule();

    let m = k.mutex_create().unwrap();

    let mut a_hold_left = 0u32;
    let mut m_burst_left = 0u32;
    let mut b_iters = 0u64;

    for _ in 0..T {
        let cur = tick(&mut k);
        if cur == a {
            if k.mutex_owner(m).unwrap() == Some(a) {
                if a_hold_left > 0 {
                    a_hold_left -= 1;
                } else {
                    let _ = k.mutex_unlock(m).unwrap();
                }
            } else if k.mutex_lock_prepare(m).unwrap() {
                a_hold_left = 5;
            }
        } else if cur == m_thread {
            if m_burst_left > 0 {
                m_burst_left -= 1;
            } else {
                k.sleep_prepare(20);
                m_burst_left = 10;
            }
        } else if cur == b {
            let owned = k.mutex_owner(m).unwrap() == Some(b)
                || k.mutex_try_lock(m).unwrap();
            if owned {
                let _ = k.mutex_unlock(m).unwrap();
                b_iters += 1;
                if b_iters % 64 == 0 {
                    k.sleep_prepare(2);
                }
            } else {
                // Contended: block; the owner inherits our priority.
                assert!(!k.mutex_lock_prepare(m).unwrap());
            }
        }
    }

    assert!(
        b_iters > 4096,
        "inheritance failed: the middle band starved the top ({b_iters})"
    );
    // Full restoration after the dust settles.
    assert_eq!(k.thread(a).priority(), Priority(3));
    assert_eq!(k.thread(m_thread).priority(), Priority(2));
    assert_eq!(k.thread(b).priority(), Priority(1));
}

#[test]
fn semaphore_tokens_are_conserved() {
    const T: u64 = 5000;
    const D: u64 = 50;
    const INITIAL: u64 = 5;

    let mut k = Kernel::new();
    let rx = spawn(&mut k, 1, 0);
    let tx = spawn(&mut k, 2, 1);
    let _idle = spawn(&mut k, 7, 2);
    let _ = k.schedule();

    let s = k.sem_create(INITIAL as u32).unwrap();

    let mut received = 0u64;
    let mut posted_tx = 0u64;
    let mut posted_isr = 0u64;
    let mut rx_waiting = false;

    let mut act = |k: &mut Kernel,
                   cur: ThreadId,
                   received: &mut u64,
                   posted_tx: &mut u64,
                   rx_waiting: &mut bool| {
        if cur == rx {
            if *rx_waiting {
                // The wake handed us a token.
                assert_eq!(k.thread(rx).last_wake(), Wake::Normal);
                *received += 1;
                *rx_waiting = false;
            }
            loop {
                if k.sem_wait_prepare(s, None).unwrap() {
                    *received += 1;
                } else {
                    *rx_waiting = true;
                    break;
                }
            }
        } else if cur == tx {
            let _ = k.sem_post(s).unwrap();
            *posted_tx += 1;
            k.sleep_prepare(D);
        }
    };

    for step in 0..T {
        if step % 97 == 0 {
            // Interrupt-context post, racing whatever the threads are
            // up to.
            let _ = k.sem_post(s).unwrap();
            posted_isr += 1;
        }
        let cur = tick(&mut k);
        act(
            &mut k,
            cur,
            &mut received,
            &mut posted_tx,
            &mut rx_waiting,
        );
    }

    // Unblock the receiver one last time and let it drain.
    let _ = k.sem_post(s).unwrap();
    for _ in 0..3 {
        let cur = tick(&mut k);
        act(
            &mut k,
            cur,
            &mut received,
            &mut posted_tx,
            &mut rx_waiting,
        );
    }

    let posted_final = 1;
    assert_eq!(
        received,
        posted_tx + posted_isr + INITIAL + posted_final,
        "token accounting must balance exactly"
    );
}

#[test]
fn killed_waiter_leaves_every_queue() {
    let mut k = Kernel::new();
    let victim = spawn(&mut k, 1, 0);
    let other = spawn(&mut k, 2, 1);
    let _idle = spawn(&mut k, 7, 2);
    let _ = k.schedule();

    let s = k.sem_create(0).unwrap();
    let dl = k.deadline_in(100);
    assert!(!k.sem_wait_prepare(s, Some(dl)).unwrap());
    assert_eq!(k.schedule(), other);

    let _ = k.thread_kill(victim).unwrap();
    // The kill pulled the victim off the waiter and timeout queues: a
    // post now banks a token instead of waking it, and the deadline
    // passes without a stray wake.
    let _ = k.sem_post(s).unwrap();
    assert_eq!(k.sem_value(s).unwrap(), 1);
    k.advance_time(100);
    let _ = k.schedule();
    assert_eq!(k.thread(victim).last_wake(), Wake::Killed);
}

#[test]
fn multi_queue_select_loses_nothing() {
    let mut k = Kernel::new();
    let consumer = spawn(&mut k, 1, 0);
    let _idle = spawn(&mut k, 7, 1);
    let _ = k.schedule();

    let ring_a = Box::leak(vec![0usize; 4].into_boxed_slice());
    let ring_b = Box::leak(vec![0usize; 4].into_boxed_slice());
    let qa = k.queue_create(ring_a).unwrap();
    let qb = k.queue_create(ring_b).unwrap();
    let sig = k.sem_create(0).unwrap();
    k.queue_bind_signal(qa, sig, 0).unwrap();
    k.queue_bind_signal(qb, sig, 1).unwrap();

    // Interrupt-context producers on an irregular schedule; the
    // consumer multiplexes both queues through one signal.
    let mut sent = vec![];
    let mut got = vec![];
    let mut waiting = false;

    for step in 0u64..400 {
        if step % 7 == 3 {
            let v = 1000 + step as usize;
            if k.queue_try_send(qa, v).is_ok() {
                sent.push(v);
            }
        }
        if step % 11 == 5 {
            let v = 2000 + step as usize;
            if k.queue_try_send(qb, v).is_ok() {
                sent.push(v);
            }
        }

        let cur = tick(&mut k);
        if cur != consumer {
            continue;
        }
        // Consumer: resolve flags to a channel, drain one element, and
        // wait again. Stale flags just send it back to waiting.
        let flags = if waiting {
            waiting = false;
            k.thread(consumer).taken_signals()
        } else {
            match k.multi_wait_prepare(sig, None).unwrap() {
                Some(f) => f,
                None => {
                    waiting = true;
                    continue;
                }
            }
        };
        if let Some(ch) = k.multi_resolve(sig, flags).unwrap() {
            let q = k.bound_queue(sig, ch).unwrap();
            let (v, _hint) = k.queue_try_recv(q).unwrap();
            got.push(v);
        }
    }

    // Drain whatever the tail of the run left behind.
    loop {
        let (done_a, done_b) = (
            k.queue_try_recv(qa).map(|(v, _)| v),
            k.queue_try_recv(qb).map(|(v, _)| v),
        );
        match (done_a, done_b) {
            (Err(_), Err(_)) => break,
            (a, b) => {
                if let Ok(v) = a {
                    got.push(v);
                }
                if let Ok(v) = b {
                    got.push(v);
                }
            }
        }
    }

    sent.sort_unstable();
    got.sort_unstable();
    assert_eq!(sent, got, "every sent element must be received once");
}

#[test]
fn kill_routes_through_termination_handler() {
    fn handler(arg: usize) -> usize {
        arg * 2
    }

    let mut k = Kernel::new();
    let victim = spawn(&mut k, 2, 0);
    let watcher = spawn(&mut k, 1, 1);
    let _idle = spawn(&mut k, 7, 2);
    let _ = k.schedule();

    k.set_termination(victim, Some(handler), 21).unwrap();

    // The watcher joins on the victim...
    assert_eq!(k.current(), watcher);
    assert_eq!(k.join_prepare(victim, None).unwrap(), None);
    assert_eq!(k.schedule(), victim);
    // ...the victim parks, and gets killed while blocked.
    k.sleep_prepare(1000);
    let _ = k.schedule();
    let _ = k.thread_kill(victim).unwrap();

    // Dispatch loop: when the victim comes up terminating, act as the
    // termination trampoline would.
    for _ in 0..4 {
        let cur = tick(&mut k);
        if cur == victim && k.thread(victim).is_terminating() {
            let (h, arg) = k.thread(victim).termination_entry();
            let v = h(arg);
            let _ = k.thread_exit(v);
        }
    }

    // The handler's return value became the exit value, and the joiner
    // saw the stop.
    assert_eq!(k.thread(victim).exit_value(), 42);
    assert_eq!(k.thread(watcher).last_wake(), Wake::Normal);
}

#[test]
fn scheduler_invariants_hold_under_churn() {
    use kern::config::{MAX_THREADS, NUM_PRIORITIES};

    let mut k = Kernel::new();
    let mut threads = vec![];
    for i in 0..6 {
        threads.push(spawn(&mut k, 1 + (i % 4) as u8, i));
    }
    let idle = spawn(&mut k, 7, 6);
    let _ = k.schedule();
    let s = k.sem_create(1).unwrap();
    let m = k.mutex_create().unwrap();

    let mut rng: u32 = 0xC0FF_EE11;
    let mut step = move || {
        rng = rng.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        rng >> 16
    };

    for _ in 0..20_000 {
        // Interrupt-style noise.
        match step() % 8 {
            0 => {
                let _ = k.sem_post(s);
            }
            1 => {
                let victim = threads[step() as usize % threads.len()];
                if victim != k.current() {
                    let _ = k.thread_kill(victim);
                }
            }
            2 => {
                // Recycle one stopped slot into a fresh thread, so the
                // churn doesn't wind down as kills accumulate.
                for i in 0..threads.len() {
                    let t = threads[i];
                    if t != k.current()
                        && matches!(
                            k.thread(t).state(),
                            abi::ThreadState::Stopped
                        )
                    {
                        let _ = k.thread_dec_ref(t);
                        let pri = Priority(1 + (step() % 4) as u8);
                        let (nt, _hint) = k
                            .thread_init_and_run(pri, nop, 0, stack(8 + i))
                            .expect("respawn");
                        threads[i] = nt;
                        break;
                    }
                }
            }
            _ => {}
        }

        let cur = tick(&mut k);

        // Invariant: nobody runnable is strictly more important than
        // the chosen thread.
        let cur_pri = k.thread(cur).effective_priority();
        for i in 0..MAX_THREADS {
            let t = ThreadId(i as u16);
            if k.thread(t).state().is_runnable() {
                assert!(
                    !k.thread(t)
                        .effective_priority()
                        .is_more_important_than(cur_pri),
                    "priority inversion in the ready bands"
                );
            }
            // Invariant: inheritance only ever raises importance.
            assert!(k
                .thread(t)
                .effective_priority()
                .is_at_least_as_important_as(k.thread(t).priority()));
        }

        if cur == idle {
            continue;
        }
        if k.thread(cur).is_terminating() {
            let (h, arg) = k.thread(cur).termination_entry();
            let v = h(arg);
            let _ = k.thread_exit(v);
            continue;
        }

        // The chosen thread does something random but legal.
        match step() % 10 {
            0 | 1 => k.sleep_prepare(1 + u64::from(step() % 20)),
            2 => {
                let dl = k.deadline_in(u64::from(step() % 16));
                let _ = k.sem_wait_prepare(s, Some(dl));
            }
            3 => {
                let _ = k.sem_post(s);
            }
            4 => {
                if k.mutex_owner(m).unwrap() == Some(cur) {
                    let _ = k.mutex_unlock(m);
                } else {
                    let _ = k.mutex_lock_prepare(m);
                }
            }
            5 => {
                let p = Priority(1 + (step() % (NUM_PRIORITIES as u32 - 2)) as u8);
                let _ = k.change_priority(cur, p);
            }
            _ => {}
        }
    }

    // The mutex invariant survived: either free, or held by a live
    // thread.
    if let Some(o) = k.mutex_owner(m).unwrap() {
        assert!(!matches!(
            k.thread(o).state(),
            abi::ThreadState::Uninit
        ));
    }
}
