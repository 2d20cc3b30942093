//! Per-key pacing: each zone gets its own limiter from a shared template.

use pacer::{Event, RateLimiterConfig, RateLimiterSet, ThreadExecutor, ThreadTimer};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    println!("=== Keyed Pacer Example ===\n");

    let timers = ThreadTimer::start("pacer-timer").expect("timer thread");
    let executor = Arc::new(ThreadExecutor::<String>::new());
    let owner = executor.register();
    let worker = executor.register();

    let template = RateLimiterConfig::new(Duration::from_millis(100), 1).with_name("zone");
    let set = RateLimiterSet::new(timers.clone(), executor.clone(), owner.id(), template)
        .expect("valid template");

    let zones = ["example.com", "example.org", "example.net"];
    for zone in zones {
        for n in 1..=3 {
            set.enqueue(zone, worker.id(), format!("{zone} refresh {n}"))
                .expect("accepting work");
        }
    }
    println!("queued 3 refreshes for each of {} zones", set.len());
    println!("{}\n", set.stats());

    // One per zone per tick: each zone drains independently
    let mut received = 0;
    while received < 9 {
        match worker.recv_timeout(Duration::from_secs(2)) {
            Some(Event::Released(msg)) => {
                received += 1;
                println!("   {msg}");
            }
            Some(_) => {}
            None => break,
        }
    }

    if let Some(slow) = set.get(&"example.org") {
        println!("\nexample.org: {}", slow.metrics().health_status());
    }

    std::thread::sleep(Duration::from_millis(150));
    println!("\nreaped {} idle limiters", set.reap_idle());
    println!("owner received {} shutdown notices", owner.drain().len());

    set.shutdown_all();
    timers.shutdown();
}
