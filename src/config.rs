//! Compile-time configuration
//!
//! These constants control resource limits and backend behavior.

/// System tick rate in Hz
pub const CFG_TICK_RATE_HZ: u32 = 1000;

/// Core clock feeding the SysTick counter (preemptive backend)
pub const CFG_CPU_CLOCK_HZ: u32 = 16_000_000;

/// Idle task stack size in words
pub const CFG_IDLE_TASK_STACK: usize = 128;

/// Size of the OSAL heap region in bytes
pub const CFG_HEAP_SIZE: usize = 32 * 1024;

/// Maximum number of priority levels (0 = highest)
pub const CFG_PRIO_MAX: usize = 32;

/// Idle task priority (lowest)
pub const CFG_PRIO_IDLE: u8 = (CFG_PRIO_MAX - 1) as u8;

/// Priority assumed for callers that are not OSAL tasks (hosted main thread)
pub const CFG_PRIO_DEFAULT: u8 = (CFG_PRIO_MAX / 2) as u8;

/// Timer service task priority
pub const CFG_TIMER_TASK_PRIO: u8 = 2;

/// Timer service task stack size in words
pub const CFG_TIMER_TASK_STACK: usize = 256;

/// Minimum task stack size in words
pub const CFG_STK_SIZE_MIN: usize = 64;

/// Number of entries in the delay/timeout tick wheel
pub const CFG_TICK_WHEEL_SIZE: usize = 16;

/// Default time quanta for round-robin among equal priorities
pub const CFG_TIME_QUANTA_DEFAULT: u32 = 10;
