pub mod timeout;
pub mod ws;
