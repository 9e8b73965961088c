//! Patients and staff: the canonical records the workflows feed into.

pub mod model;
pub mod routes;
pub mod service;

pub use model::{
    Address, ClinicalFlags, DocumentFlags, NewPatient, NewUser, Patient, PatientAssignment,
    PatientStatus, StatusType, User,
};
pub use routes::patient_routes;
pub use service::PatientRegistry;
