pub mod config;
pub mod memory;
pub mod messenger;
pub mod notify;
pub mod store;
pub mod types;

pub use config::Config;
pub use memory::MemoryStore;
pub use messenger::Messenger;
pub use notify::{LogNotifier, Notifier};
pub use store::Store;
