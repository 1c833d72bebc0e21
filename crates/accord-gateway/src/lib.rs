pub mod connection;
pub mod dispatcher;
pub mod view;

pub use dispatcher::{Dispatcher, Subscription, SubscriptionHandle, Topic};
pub use view::{AccountView, PollSchedule};
