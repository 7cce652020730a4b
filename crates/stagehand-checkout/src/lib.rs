pub mod error;
pub mod events;
pub mod kubernetes;
pub mod orchestrate;
pub mod publish;
pub mod release;
pub mod split;
pub mod suite;
pub mod tercc;

pub use error::CheckoutError;
pub use events::{Conclusion, EnvironmentDefined, EventClient, LoggingEventClient, RecordingEventClient};
pub use orchestrate::Orchestrator;
pub use publish::{OrchestratedPublisher, Publisher, UploadPublisher};
pub use release::Releaser;
pub use split::{assign_iuts, split, IutSlot, TestRunnerGroup};
pub use suite::SuiteBuilder;
pub use tercc::requests_from_tercc;
