mod instance;
mod priority;
mod project;
mod snapshot;

pub use instance::*;
pub use priority::*;
pub use project::*;
pub use snapshot::*;
