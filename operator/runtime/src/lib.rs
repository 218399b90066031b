#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gameserver_operator_core as core;
pub use gameserver_operator_http as http;
pub use gameserver_operator_k8s_api as k8s;
pub use gameserver_operator_k8s_index as index;

mod args;
mod manager;
mod tls;

pub use self::{args::Args, manager::Manager};
