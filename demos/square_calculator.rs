use future_pool::{PoolConfig, PoolError, ShutdownMode, TaskHandle, WorkerPool};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;

/// Squares numbers on a worker pool, taking about a second per number.
struct SquareCalculator {
  pool: Arc<WorkerPool<u64>>,
}

impl SquareCalculator {
  fn new(name: &str, width: usize) -> Result<Self, PoolError> {
    let pool = WorkerPool::with_config(PoolConfig::new(width).with_name(name), Handle::current())?;
    Ok(Self { pool })
  }

  fn calculate(&self, input: u64) -> Result<TaskHandle<u64>, PoolError> {
    self.pool.submit(
      |n: u64| async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        n.checked_mul(n).ok_or_else(|| format!("square of {} overflows u64", n))
      },
      input,
    )
  }

  async fn shutdown(self) -> Result<(), PoolError> {
    self.pool.shutdown(ShutdownMode::Graceful).await
  }
}

async fn run_pair(name: &str, width: usize) -> Result<(), PoolError> {
  let calculator = SquareCalculator::new(name, width)?;
  let started = Instant::now();

  let result1 = calculator.calculate(5)?;
  let result2 = calculator.calculate(1000)?;

  while !result1.is_done() || !result2.is_done() {
    info!(
      "Task 1 is {} and Task 2 is {}.",
      if result1.is_done() { "done" } else { "not done" },
      if result2.is_done() { "done" } else { "not done" }
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
  }

  info!("Results: {} and {}", result1.get().await?, result2.get().await?);
  info!("Pool '{}' with width {} took {} ms", name, width, started.elapsed().as_millis());
  calculator.shutdown().await
}

#[tokio::main]
async fn main() -> Result<(), PoolError> {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Sequential: one worker, about two seconds ---");
  run_pair("single_worker", 1).await?;

  info!("--- Parallel: two workers, about one second ---");
  run_pair("two_workers", 2).await?;

  info!("--- Timeout shorter than the computation ---");
  let calculator = SquareCalculator::new("timeout", 1)?;
  let pending = calculator.calculate(5)?;
  match pending.get_timeout(Duration::from_millis(500)).await {
    Err(PoolError::Timeout(waited)) => info!("No result after {:?}, task keeps running", waited),
    other => info!("Unexpected outcome: {:?}", other),
  }
  info!("Eventually: {:?}", pending.get().await);
  calculator.shutdown().await?;

  info!("--- Cancel, then get ---");
  let calculator = SquareCalculator::new("cancel", 1)?;
  let doomed = calculator.calculate(4)?;
  info!("cancel returned {}", doomed.cancel(true));
  info!("get returned {:?}, is_cancelled = {}", doomed.get().await, doomed.is_cancelled());
  calculator.shutdown().await?;

  Ok(())
}
