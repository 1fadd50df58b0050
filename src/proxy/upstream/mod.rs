// Upstream dialect: wire types, dispatcher, token bootstrap

pub mod client;
pub mod models;
pub mod token;
