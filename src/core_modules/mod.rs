pub mod assigner;
pub mod complex_events;
pub mod export;
pub mod fingerprint;
pub mod lineage;
pub mod segment;
pub mod similarity;
