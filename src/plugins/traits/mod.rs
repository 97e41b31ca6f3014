pub mod notifier;

pub use notifier::{ChangeNotification, NotificationResult, Notifier};
