// Notifier implementations
pub mod email;
pub mod noop;

pub use email::EmailNotifier;
pub use noop::NoopNotifier;
