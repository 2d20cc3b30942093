//! Basic usage: one limiter pacing messages to a worker thread.

use pacer::{Event, RateLimiterBuilder, ThreadExecutor, ThreadTimer};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn main() {
    println!("=== Basic Pacer Example ===\n");

    let timers = ThreadTimer::start("pacer-timer").expect("timer thread");
    let executor = Arc::new(ThreadExecutor::<String>::new());
    let owner = executor.register();

    let start = Instant::now();
    let (worker, worker_thread) = executor
        .spawn("worker", move |event| match event {
            Event::Released(msg) => {
                println!("   [{:>5}ms] sent      {}", start.elapsed().as_millis(), msg)
            }
            Event::Cancelled(msg) => {
                println!("   [{:>5}ms] cancelled {}", start.elapsed().as_millis(), msg)
            }
            Event::ShutdownComplete(_) => {}
        })
        .expect("worker thread");

    let limiter = RateLimiterBuilder::new()
        .interval(Duration::from_millis(200))
        .per_tick(2)
        .name("outbound")
        .build(timers.clone(), executor.clone(), owner.id())
        .expect("valid configuration");

    println!("1. Pacing: 6 messages, 2 every 200ms");
    for n in 1..=6 {
        limiter
            .enqueue(worker, format!("message {n}"))
            .expect("accepting work");
    }
    thread::sleep(Duration::from_millis(700));

    println!("\n2. Cancelling before release");
    let keep = limiter.enqueue(worker, "keep".to_string()).expect("accepting work");
    let drop_me = limiter.enqueue(worker, "drop".to_string()).expect("accepting work");
    match limiter.cancel(&drop_me) {
        Ok(item) => println!("   withdrew {item:?}"),
        Err(err) => println!("   too late: {err}"),
    }
    println!("   keep still queued: {}", limiter.is_queued(&keep));
    thread::sleep(Duration::from_millis(300));

    println!("\n3. Stall and resume");
    limiter.stall().expect("not shut down");
    for n in 1..=3 {
        limiter
            .enqueue(worker, format!("held {n}"))
            .expect("accepting work");
    }
    println!("   stalled with {} pending, waiting 500ms", limiter.pending());
    thread::sleep(Duration::from_millis(500));
    limiter.resume().expect("timer available");
    println!("   resumed");
    thread::sleep(Duration::from_millis(500));

    println!("\n4. Metrics\n{}", limiter.metrics());

    println!("\n5. Shutdown with work queued");
    limiter.set_interval(Duration::from_secs(10)).expect("not shut down");
    for n in 1..=3 {
        limiter
            .enqueue(worker, format!("late {n}"))
            .expect("accepting work");
    }
    limiter.shutdown();
    if let Some(Event::ShutdownComplete(notice)) = owner.recv_timeout(Duration::from_secs(1)) {
        println!("   owner notified: `{}` shut down", notice.limiter_name());
    }

    executor.unregister(worker);
    worker_thread.join().expect("worker exits");
    timers.shutdown();
}
