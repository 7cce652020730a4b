pub mod error;
pub mod etcd;
pub mod keys;
pub mod memory;
pub mod store;

pub use error::StoreError;
pub use etcd::EtcdStore;
pub use keys::Keys;
pub use memory::InMemoryStore;
pub use store::{Store, WatchEvent};
