//! Example from the README.

use std::sync::atomic::{AtomicU64, Ordering};

use lockstep::{SpinMutex, ThreadPool};

fn main() {
    // Two participants: the main thread plus one worker.
    let mut pool = ThreadPool::new(2).unwrap();

    // Grow the pool before a heavier phase.
    pool.extend(2).unwrap();
    println!("pool has {} participants", pool.participant_count());

    let sum = AtomicU64::new(0);
    pool.run_jobs(1000, |index| {
        sum.fetch_add(index as u64, Ordering::Relaxed);
    })
    .unwrap();
    println!("sum of 0..1000 is {}", sum.load(Ordering::Relaxed));

    // One job per participant, for example to set up per-thread scratch space.
    let scratch = SpinMutex::new(Vec::new());
    pool.run(|slot| scratch.lock().push(slot)).unwrap();
    println!("prepared {} scratch slots", scratch.lock().len());

    // One-off fan-out without a persistent pool.
    lockstep::temporary_run(3, |index| println!("temporary thread {index} checking in")).unwrap();

    pool.stop();
}
