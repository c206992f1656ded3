pub mod notifier;
pub mod transport;

pub use notifier::*;
pub use transport::*;
