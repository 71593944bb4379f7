//! Execution backends for the ASG.
//!
//! [`backend::Backend`] is the interface; [`cpu_backend::CpuBackend`] runs
//! graphs with `ndarray`.

pub mod backend;
pub mod cpu_backend;
