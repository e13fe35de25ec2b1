//! Custom Resource Definitions for the CMState injector
//!
//! `CMState` is the group record binding an audience of pods to one backing
//! ConfigMap; `CMTemplate` describes how that ConfigMap is rendered.

mod cmstate;
mod cmtemplate;
mod types;

pub use cmstate::{CMAudience, CMState, CMStateSpec, CMStateStatus, CONDITION_AVAILABLE};
pub use cmtemplate::{CMTemplate, CMTemplateSpec, TemplateBody};
pub use types::{Condition, ConditionStatus};
