pub mod config;
pub mod crypto;
pub mod engine;
pub mod ike;
pub mod kernel;

pub use config::{ConnectionError, IronswanConfig};
pub use engine::Engine;
pub use ike::{IkeError, IkeVersion};
pub use kernel::{KernelError, KernelInterface, NullKernel};
