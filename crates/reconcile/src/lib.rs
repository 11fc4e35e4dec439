//! Tether reconcile: the per-kind control loop that keeps external
//! resources in line with their declarative records.

#![forbid(unsafe_code)]

pub mod compare;
pub mod controller;
pub mod error;
pub mod external;
pub mod fake;
pub mod reconciler;
pub mod resources;

pub use controller::{disposition, process, Controller};
pub use error::{ReconcileError, ReconcileResult};
pub use external::{ConnectionParams, Connector, Credential, DevOpsClient, ExternalError, Locator};
pub use reconciler::{Outcome, Reconciler};
pub use resources::{CreateOutcome, ExternalResource, Managed, Pass};
