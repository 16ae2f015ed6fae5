//! Online/offline parity verification.

mod checker;

pub use checker::{relative_error, EntityParity, FeatureParity, ParityChecker, ParityReport};
