pub mod component_status;
pub mod error_events;
pub mod execution_records;
pub mod plans;
pub mod rules;
