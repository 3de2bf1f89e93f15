pub mod artifact;
pub mod consts;
pub mod error;
pub mod ledger;
pub mod params;
pub mod pipeline;
pub mod project;
pub mod registry;
pub mod stage;
pub mod tools;
