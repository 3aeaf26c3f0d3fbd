use fiberjobs::{JobDescriptor, JobManager, JobManagerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("fiberjobs - Fiber-Based Job Scheduler\n");

    let config = match std::env::var("FIBERJOBS_CONFIG") {
        Ok(json) => match JobManagerConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Invalid FIBERJOBS_CONFIG: {e}");
                std::process::exit(1);
            }
        },
        Err(_) => JobManagerConfig::default(),
    };

    let num_threads = 4;
    let manager = match JobManager::with_config(num_threads, config) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Failed to start job manager: {e}");
            std::process::exit(1);
        }
    };
    println!(
        "Initialized job manager with {} worker threads and {} fibers\n",
        manager.num_workers(),
        manager.fiber_pool_size()
    );

    // Example 1: Simple job execution
    println!("Example 1: Simple job execution");
    let counter = manager.run(|| {
        println!("  Hello from a fiber job!");
    });
    manager.wait_for_counter(counter);
    println!("  Job completed\n");

    // Example 2: Fan-out / fan-in from inside a job
    println!("Example 2: Nested fan-out");
    let ctx = manager.context();
    let sum = Arc::new(AtomicUsize::new(0));
    let sum_clone = sum.clone();
    let num_jobs = 100;

    let start = Instant::now();
    let counter = manager.run(move || {
        let inner = ctx.run_jobs((0..num_jobs).map(|i| {
            let sum = sum_clone.clone();
            JobDescriptor::new(move || {
                let mut _local_sum = 0;
                for j in 0..1000 {
                    _local_sum += j;
                }
                sum.fetch_add(i, Ordering::SeqCst);
            })
        }));
        ctx.wait_for_counter(inner);
        println!(
            "  Parent job resumed on worker {:?}",
            ctx.current_worker_id()
        );
    });
    manager.wait_for_counter(counter);

    let expected_sum: usize = (0..num_jobs).sum();
    println!("  Executed {} jobs in {:?}", num_jobs, start.elapsed());
    println!(
        "  Sum result: {} (expected: {})\n",
        sum.load(Ordering::SeqCst),
        expected_sum
    );

    // Example 3: High-throughput test
    println!("Example 3: High-throughput run");
    let num_jobs = 10000;
    let start = Instant::now();
    let counter = manager.run_jobs((0..num_jobs).map(|_| {
        JobDescriptor::new(|| {
            let mut _x = 0;
            for i in 0..10 {
                _x += i;
            }
        })
    }));
    manager.wait_for_counter(counter);

    let duration = start.elapsed();
    let jobs_per_second = num_jobs as f64 / duration.as_secs_f64();
    println!("  Executed {} jobs in {:?}", num_jobs, duration);
    println!("  Throughput: {:.2} jobs/second\n", jobs_per_second);

    println!("Shutting down job manager...");
    match manager.terminate() {
        Ok(report) => println!("Done! {report:?}"),
        Err(e) => eprintln!("Shutdown error: {}", e),
    }
}
