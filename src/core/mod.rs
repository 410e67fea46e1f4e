pub mod checkpoint;
pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod schema;
pub mod state;
