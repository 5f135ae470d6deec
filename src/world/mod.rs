pub mod location;
pub mod manager;
pub mod navmesh;
