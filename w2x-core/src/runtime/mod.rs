pub mod scheduler;

pub use scheduler::{Job, Scheduler, SchedulerStats};

#[cfg(test)]
mod tests;
