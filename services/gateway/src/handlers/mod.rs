pub mod health;
pub mod history;
pub mod streams;
pub mod ws;
