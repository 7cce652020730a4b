pub mod driver;
pub mod encrypt;
pub mod error;
pub mod external;
pub mod local;
pub mod registry;
pub mod rules;

pub use driver::{ProviderDriver, SharedDataset};
pub use error::ProviderError;
pub use external::{ExternalDriver, ExternalRuleset};
pub use local::{Ruleset, RulesDriver};
pub use registry::ProviderRegistry;
pub use rules::{Evaluator, RuleError};
