//! The payload assembly and delivery pipeline.
//!
//! Instances admitted by the [`DispatchGuard`] are grouped into payloads by the
//! [`BucketAssembler`]. Closed payloads are persisted and drained by the [`DeliveryWorker`],
//! which uploads them to the object store and publishes a workflow request.

mod assembler;
mod delivery;
mod guard;
pub mod message;
mod payload;
mod registry;
mod retry;
pub mod services;
#[cfg(test)]
pub(crate) mod testing;

pub use assembler::{BucketAssembler, Cancelled, QueueError, DEFAULT_TIMEOUT};
pub use delivery::{DeliveryCollaborators, DeliveryOptions, DeliveryWorker};
pub use guard::{AdmissionError, AdmissionRequest, Admitted, DispatchGuard};
#[cfg(test)]
pub(crate) use payload::file_record;
pub use payload::{FileRecord, InstanceUids, Payload, PayloadError, PayloadState};
pub use registry::{ChangeKind, ChangeNotifier, ConfigChange, EndpointRegistry, EndpointSnapshot};
pub use retry::RetryPolicy;
