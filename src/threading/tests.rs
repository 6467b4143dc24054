use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;

#[test]
fn call_runs_on_the_coordinator_thread() {
    let (main, handle) = main_thread();
    let worker = Thread::spawn(Some("game"), move || {
        let on_main = handle.call(is_main_thread).unwrap();
        handle.terminate().unwrap();
        on_main
    })
    .unwrap();
    assert_eq!(main.run(), Err(ThreadError::Terminated));
    let saw_main = worker.join().unwrap();
    if cfg!(feature = "singlethread") {
        assert!(!saw_main);
    } else {
        assert!(saw_main);
    }
}

#[test]
fn call_returns_the_closure_result() {
    let (main, handle) = main_thread();
    let worker = Thread::spawn(None, move || {
        let v = handle.call(|| 6 * 7).unwrap();
        handle.terminate().unwrap();
        v
    })
    .unwrap();
    let _ = main.run();
    assert_eq!(worker.join().unwrap(), 42);
}

#[test]
fn calls_preserve_order() {
    let (main, handle) = main_thread();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let worker = Thread::spawn(None, move || {
        for i in 0..10 {
            let seen = Arc::clone(&seen2);
            handle.call(move || seen.lock().push(i)).unwrap();
        }
        handle.terminate().unwrap();
    })
    .unwrap();
    let _ = main.run();
    worker.join().unwrap();
    assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
}

#[cfg(not(feature = "singlethread"))]
#[test]
fn nested_loop_pumps_reentrant_calls() {
    let (main, handle) = main_thread();
    let main = Arc::new(main);
    let done = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(AtomicUsize::new(0));

    // The first job parks the outer loop in run_until; a second worker
    // keeps posting jobs that only the nested loop can execute.
    let inner_handle = handle.clone();
    let inner_done = Arc::clone(&done);
    let inner_counter = Arc::clone(&counter);
    let pump = Thread::spawn(Some("resize"), move || {
        for _ in 0..5 {
            let c = Arc::clone(&inner_counter);
            inner_handle.call(move || c.fetch_add(1, Ordering::SeqCst)).unwrap();
        }
        inner_done.store(true, Ordering::Release);
        // Wake the nested loop so it notices the flag.
        inner_handle.call(|| {}).unwrap();
        inner_handle.terminate().unwrap();
    })
    .unwrap();

    let main2 = Arc::clone(&main);
    let done2 = Arc::clone(&done);
    let worker = Thread::spawn(Some("game"), move || {
        handle
            .call(move || {
                // Simulates a draw interrupted by an OS callback that
                // needs more main-thread work before returning.
                main2.run_until(&done2).unwrap();
            })
            .unwrap();
    })
    .unwrap();

    assert_eq!(main.run(), Err(ThreadError::Terminated));
    worker.join().unwrap();
    pump.join().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[test]
fn run_reports_disconnect_when_handles_drop() {
    let (main, handle) = main_thread();
    drop(handle);
    assert_eq!(main.run(), Err(ThreadError::Disconnected));
}

#[test]
fn thread_join_returns_value() {
    let t = Thread::spawn(Some("t"), || {
        std::thread::sleep(Duration::from_millis(1));
        7u32
    })
    .unwrap();
    assert_eq!(t.join().unwrap(), 7);
}

#[test]
fn thread_is_running_goes_false() {
    let t = Thread::spawn(None, || {}).unwrap();
    // Joining proves completion regardless of scheduling.
    t.join().unwrap();
}
