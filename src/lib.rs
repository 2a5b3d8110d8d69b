pub mod architectures;
pub mod error;
pub mod layers;
pub mod models;
pub mod util;
