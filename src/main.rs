use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use semsync::{logger, MutexCell, MutexError, SpinLock};

const INC_THREADS: usize = 5;
const INCREMENT: i64 = 2;
const INC_ITERATIONS: usize = 20000;
const DEC_THREADS: usize = 4;
const DECREMENT: i64 = 2;
const DEC_ITERATIONS: usize =
    INC_ITERATIONS * INC_THREADS * INCREMENT as usize / DEC_THREADS / DECREMENT as usize;

/// Shared state handed to every worker of one run.
struct CounterContext<C> {
    counter: C,
}

trait Counter: Sync {
    fn add(&self, delta: i64) -> Result<(), MutexError>;
    fn value(&self) -> Result<i64, MutexError>;
}

/// Read and write are separate steps, so concurrent updates get lost.
struct NaiveCounter(AtomicI64);

impl Counter for NaiveCounter {
    fn add(&self, delta: i64) -> Result<(), MutexError> {
        let current = self.0.load(Ordering::Relaxed);
        self.0.store(current + delta, Ordering::Relaxed);
        Ok(())
    }

    fn value(&self) -> Result<i64, MutexError> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

struct AtomicCounter(AtomicI64);

impl Counter for AtomicCounter {
    fn add(&self, delta: i64) -> Result<(), MutexError> {
        self.0.fetch_add(delta, Ordering::Relaxed);
        Ok(())
    }

    fn value(&self) -> Result<i64, MutexError> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

impl Counter for MutexCell<i64> {
    fn add(&self, delta: i64) -> Result<(), MutexError> {
        *self.lock()? += delta;
        Ok(())
    }

    fn value(&self) -> Result<i64, MutexError> {
        Ok(*self.lock()?)
    }
}

impl Counter for SpinLock<i64> {
    fn add(&self, delta: i64) -> Result<(), MutexError> {
        *self.lock() += delta;
        Ok(())
    }

    fn value(&self) -> Result<i64, MutexError> {
        Ok(*self.lock())
    }
}

#[derive(Debug, Clone, Copy)]
struct Workload {
    inc_threads: usize,
    inc_iterations: usize,
    dec_threads: usize,
    dec_iterations: usize,
}

impl Workload {
    const DEMO: Workload = Workload {
        inc_threads: INC_THREADS,
        inc_iterations: INC_ITERATIONS,
        dec_threads: DEC_THREADS,
        dec_iterations: DEC_ITERATIONS,
    };

    fn workers(&self) -> usize {
        self.inc_threads + self.dec_threads
    }
}

struct RunStats {
    name: &'static str,
    counter: i64,
    total: Duration,
    average: Duration,
}

fn run<C: Counter>(
    name: &'static str,
    context: &CounterContext<C>,
    workload: Workload,
) -> Result<RunStats, MutexError> {
    let worker = |delta: i64, iterations: usize| {
        let start = Instant::now();
        for _ in 0..iterations {
            context.counter.add(delta)?;
        }
        Ok::<_, MutexError>(start.elapsed())
    };

    let times = std::thread::scope(|s| {
        let mut handles = Vec::new();
        for _ in 0..workload.inc_threads {
            handles.push(s.spawn(|| worker(INCREMENT, workload.inc_iterations)));
        }
        for _ in 0..workload.dec_threads {
            handles.push(s.spawn(|| worker(-DECREMENT, workload.dec_iterations)));
        }
        let mut times = Vec::with_capacity(handles.len());
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(result) => {
                    let elapsed = result?;
                    debug!("{name}: worker {id} took {elapsed:?}");
                    times.push(elapsed);
                }
                Err(_) => error!("{name}: worker {id} panicked"),
            }
        }
        Ok::<_, MutexError>(times)
    })?;

    let counter = context.counter.value()?;
    let total: Duration = times.iter().sum();
    let average = total / workload.workers().max(1) as u32;
    if counter == 0 {
        info!("{name}: counter is 0 as expected");
    } else {
        warn!("{name}: counter is {counter}, expected 0");
    }
    Ok(RunStats {
        name,
        counter,
        total,
        average,
    })
}

fn summary(stats: &[RunStats]) {
    info!("SUMMARY");
    info!(
        "{:<20} {:>10} {:>8} {:>14} {:>14}",
        "test case", "counter", "result", "total", "avg/thread"
    );
    for run in stats {
        let result = if run.counter == 0 { "success" } else { "failure" };
        info!(
            "{:<20} {:>10} {:>8} {:>14} {:>14}",
            run.name,
            run.counter,
            result,
            format!("{:?}", run.total),
            format!("{:?}", run.average)
        );
    }
}

fn all_runs(workload: Workload) -> Result<Vec<RunStats>, MutexError> {
    let naive = CounterContext {
        counter: NaiveCounter(AtomicI64::new(0)),
    };
    let locked = CounterContext {
        counter: MutexCell::new(0i64),
    };
    let spinning = CounterContext {
        counter: SpinLock::new(0i64),
    };
    let atomic = CounterContext {
        counter: AtomicCounter(AtomicI64::new(0)),
    };

    Ok(vec![
        run("no synchronization", &naive, workload)?,
        run("semaphore mutex", &locked, workload)?,
        run("spinlock", &spinning, workload)?,
        run("atomic add/sub", &atomic, workload)?,
    ])
}

fn main() {
    if let Err(err) = logger::init() {
        eprintln!("failed to install logger: {err}");
    }

    info!(
        "{INC_THREADS} threads add {INCREMENT} {INC_ITERATIONS} times, \
         {DEC_THREADS} threads subtract {DECREMENT} {DEC_ITERATIONS} times"
    );

    match all_runs(Workload::DEMO) {
        Ok(stats) => summary(&stats),
        Err(err) => {
            error!("mutex error: {err}");
            std::process::exit(1);
        }
    }
}
