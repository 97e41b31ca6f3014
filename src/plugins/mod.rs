pub mod traits;
pub mod notifiers;

pub use notifiers::{EmailNotifier, NoopNotifier};
pub use traits::{ChangeNotification, NotificationResult, Notifier};
