pub mod compute_at;
pub mod domain;
pub mod heuristics;
pub mod root_map;
