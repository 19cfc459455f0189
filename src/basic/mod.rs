pub mod ac;
pub mod equations;
pub mod error;
pub mod network;
pub mod post_processing;
pub mod solver;
