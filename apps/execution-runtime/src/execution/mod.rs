pub mod service;
pub mod store;
pub mod types;


pub use service::{
    AdmissionDenied, AmbiguousReturnPolicy, ExecutionError, ExecutionPolicy, ExecutionService,
};
pub use store::{ExecutionStore, StoreError};
