// charta-common: shared types and the callback log for the Charta workspace

pub mod callback_log;
pub mod types;
