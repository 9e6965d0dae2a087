// Use mimalloc only on x86_64 to avoid cross-compilation issues.
#[cfg(target_arch = "x86_64")]
use mimalloc::MiMalloc;

#[cfg(target_arch = "x86_64")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod client;
pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod id;
pub mod job;
pub mod probe;
pub mod store;
pub mod worker;
