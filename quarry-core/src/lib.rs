pub mod crd;
pub mod error;
pub mod tier;

pub use error::{Error, Result};
pub use tier::{TierKind, TierNames, WorkloadKind};

/// The name used by the operator as its field manager & `managed-by` label value.
pub const OPERATOR_NAME: &str = "quarry-operator";

/// The label selector matching every object written by the Quarry operator.
pub const QUARRY_OPERATOR_LABEL_SELECTORS: &str = "app.kubernetes.io/managed-by=quarry-operator";
