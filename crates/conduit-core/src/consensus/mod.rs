//! Adaptive consensus review.
//!
//! A fan-out/fan-in review whose shape is decided at run time: the mode
//! picks which specialists run unconditionally, and the running confidence
//! of earlier specialists escalates or skips the rest.

pub mod builder;
pub mod metrics;
pub mod mode;
pub mod review;
pub mod specialist;
pub mod workflow;

pub use specialist::{BoxSpecialist, HeuristicSpecialist, Specialist, SpecialistRequest};
pub use workflow::{CONSENSUS_WORKFLOW_TYPE, consensus_definition, report_from_results};
