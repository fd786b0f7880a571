pub mod client;
pub mod forge;
