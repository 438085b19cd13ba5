/*!
 * Scheduler Module
 * vCPU admission, the giant lock, and generic sleep queues
 */

pub mod cpu;
pub mod giant;
pub mod sleepq;

pub use cpu::{CpuPool, CpuPoolStats};
pub use giant::{GiantLock, GiantStats, Lent, Release};
pub use sleepq::{SleepQueue, SleepResult};
