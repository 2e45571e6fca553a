pub mod bpf;
pub mod capture;
pub mod cli;
pub mod error;
pub mod output;
pub mod route;
pub mod wire;
