//! Integrations with the outside world: the kubelet gRPC protocol and NVML.

pub mod k8s;
pub mod nvml;
