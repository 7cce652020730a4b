pub mod dataset;
pub mod error;
pub mod request;
pub mod resource;
pub mod suite;

pub use dataset::Dataset;
pub use error::DomainError;
pub use request::{EnvironmentRequest, Execution, ProviderIds, Test, TestCase};
pub use resource::{Resource, ResourceKind};
pub use suite::{StoredSubSuite, SubSuite};
