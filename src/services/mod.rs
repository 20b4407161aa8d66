pub mod board_store;
pub mod broadcast;
pub mod hub;
pub mod identity;
pub mod persistence;
pub mod router;
pub mod session;
