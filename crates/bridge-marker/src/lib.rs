//! Exposes Linux bridge interfaces to the kubelet as schedulable extended
//! resources.
//!
//! One device plugin is served per discovered bridge; each advertises a
//! fixed number of synthetic slots whose health follows the bridge's kernel
//! operational state, so workloads requesting a named bridge only land on
//! nodes where that bridge exists and is up.

pub mod config;
pub mod logging;
pub mod netlink;
pub mod plugin;
