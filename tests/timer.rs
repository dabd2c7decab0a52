use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reactor_io::{EventLoop, TimerId};

#[test]
fn repeating_timer_cancels_itself_mid_callback() {
    let _ = env_logger::try_init();

    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle().clone();

    let a_fired = Arc::new(AtomicUsize::new(0));
    let a_id: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
    let b_fired = Arc::new(AtomicUsize::new(0));
    let b_elapsed = Arc::new(Mutex::new(None::<Duration>));

    let start = Instant::now();

    {
        let a_fired = a_fired.clone();
        let a_id_slot = a_id.clone();
        let canceller = handle.clone();
        let id = handle.run_every(Duration::from_millis(50), move || {
            let count = a_fired.fetch_add(1, Ordering::SeqCst) + 1;
            if count == 3 {
                let id = a_id_slot.lock().unwrap().expect("timer id not stored");
                canceller.cancel(id);
            }
        });
        *a_id.lock().unwrap() = Some(id);
    }

    {
        let b_fired = b_fired.clone();
        let b_elapsed = b_elapsed.clone();
        handle.run_at(Instant::now() + Duration::from_millis(200), move || {
            b_fired.fetch_add(1, Ordering::SeqCst);
            *b_elapsed.lock().unwrap() = Some(start.elapsed());
        });
    }

    {
        let quitter = handle.clone();
        handle.run_after(Duration::from_millis(500), move || quitter.quit());
    }

    event_loop.run();

    assert_eq!(a_fired.load(Ordering::SeqCst), 3);
    assert_eq!(b_fired.load(Ordering::SeqCst), 1);
    let b_elapsed = b_elapsed.lock().unwrap().expect("one-shot never fired");
    assert!(b_elapsed >= Duration::from_millis(200), "{:?}", b_elapsed);
}

#[test]
fn cancel_is_idempotent_and_prevents_firing() {
    let _ = env_logger::try_init();

    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle().clone();

    let fired = Arc::new(AtomicUsize::new(0));

    let id = {
        let fired = fired.clone();
        handle.run_after(Duration::from_millis(100), move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };

    handle.cancel(id);
    handle.cancel(id);

    {
        let quitter = handle.clone();
        handle.run_after(Duration::from_millis(250), move || quitter.quit());
    }

    event_loop.run();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn timers_fire_in_expiration_order() {
    let _ = env_logger::try_init();

    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle().clone();

    let order = Arc::new(Mutex::new(Vec::new()));

    {
        let order = order.clone();
        handle.run_after(Duration::from_millis(60), move || {
            order.lock().unwrap().push(2);
        });
    }
    {
        let order = order.clone();
        handle.run_after(Duration::from_millis(20), move || {
            order.lock().unwrap().push(1);
        });
    }
    {
        let quitter = handle.clone();
        handle.run_after(Duration::from_millis(150), move || quitter.quit());
    }

    event_loop.run();

    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

#[test]
fn run_every_keeps_firing_until_cancelled_from_outside() {
    let _ = env_logger::try_init();

    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle().clone();

    let ticks = Arc::new(AtomicUsize::new(0));

    let id = {
        let ticks = ticks.clone();
        handle.run_every(Duration::from_millis(30), move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        })
    };

    {
        let canceller = handle.clone();
        handle.run_after(Duration::from_millis(160), move || canceller.cancel(id));
    }
    {
        let quitter = handle.clone();
        handle.run_after(Duration::from_millis(320), move || quitter.quit());
    }

    event_loop.run();

    let ticks = ticks.load(Ordering::SeqCst);
    // roughly 160 / 30 firings, then silence after the cancel
    assert!((3..=6).contains(&ticks), "ticks = {}", ticks);
}
