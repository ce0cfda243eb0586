pub mod system;
pub mod workers;

pub use system::*;
pub use workers::*;
