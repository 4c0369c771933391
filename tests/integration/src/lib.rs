//! Integration tests: several replicas sharing one store, and the
//! flowpool-server binary end to end.

#![cfg(test)]

mod helpers;

mod binding;
mod failover;
mod pool;
mod server;
