//! Control groups provide a way of controlling groups of processes.
//! This crate drives the cgroup v1 cpu controller: it places a process under
//! CFS and real-time bandwidth constraints and reports how often the group
//! was throttled.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

#[cfg(test)]
#[macro_use]
extern crate mockall;


pub mod common;
pub mod stats;
pub mod test_collaborators;
pub mod v1;
