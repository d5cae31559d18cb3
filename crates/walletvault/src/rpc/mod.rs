pub mod bus;
pub mod client;
pub mod commands;
pub mod envelope;
pub mod server;
pub mod transport;

use std::{future::Future, pin::Pin};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
