pub mod event_loop;
pub mod router;
pub mod server;
pub mod subsystems;
