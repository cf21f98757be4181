pub mod averager;
pub mod channel;
pub mod communications;
pub mod configs;
pub mod controller;
pub mod error;
pub mod hardware;
pub mod history;
pub mod lock;
pub mod protocol;
pub mod scheduler;
pub mod util;
