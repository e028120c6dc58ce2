pub mod fifo;
pub mod flush;
pub mod gateway;
pub mod housekeeping;
pub mod mail;
pub mod orchestrator;
pub mod parse;
pub mod poll;
pub mod sweep;
pub mod terminal;
