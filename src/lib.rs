pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod heal;
pub mod health;
pub mod lock;
pub mod phase;
pub mod phases;
pub mod recovery;
pub mod rollback;
pub mod state;
pub mod ui;
pub mod util;
