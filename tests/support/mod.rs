#![allow(dead_code)]

pub mod file_server;
pub mod socket_guard;
