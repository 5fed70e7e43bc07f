pub mod agents;
pub mod auth;
pub mod deployments;
pub mod experiments;
pub mod loadsim;
pub mod pipelines;
