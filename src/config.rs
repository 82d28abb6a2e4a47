use crate::error::PoolError;

use std::num::NonZeroUsize;

use tokio::sync::Semaphore;

/// Construction parameters for a `WorkerPool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Name used in log fields and completion notifications.
  pub name: String,
  /// Maximum number of tasks executing at the same time. Must be at least 1.
  pub width: usize,
  /// Maximum number of tasks waiting for dispatch. `None` means unbounded.
  /// When full, `submit` rejects with `PoolError::QueueFull` instead of blocking.
  pub queue_capacity: Option<usize>,
}

impl PoolConfig {
  pub fn new(width: usize) -> Self {
    Self {
      width,
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_width(mut self, width: usize) -> Self {
    self.width = width;
    self
  }

  pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = Some(capacity);
    self
  }

  pub fn unbounded(mut self) -> Self {
    self.queue_capacity = None;
    self
  }

  pub(crate) fn validate(&self) -> Result<(), PoolError> {
    if self.width < 1 {
      return Err(PoolError::InvalidConfiguration(format!(
        "pool width must be at least 1, got {}",
        self.width
      )));
    }
    let max_width = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
    if self.width > max_width {
      return Err(PoolError::InvalidConfiguration(format!(
        "pool width must be at most {}, got {}",
        max_width, self.width
      )));
    }
    if self.queue_capacity == Some(0) {
      return Err(PoolError::InvalidConfiguration(
        "queue capacity must be at least 1 when bounded".to_string(),
      ));
    }
    Ok(())
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "worker_pool".to_string(),
      width: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
      queue_capacity: None,
    }
  }
}
