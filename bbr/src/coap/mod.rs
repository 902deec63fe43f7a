pub mod client;
pub mod handlers;
pub mod message;
pub mod server;

pub use client::CoapClient;
pub use message::{CoapCode, CoapMessage, CoapType};
pub use server::{CoapResponse, CoapServer, ResourceHandler};
