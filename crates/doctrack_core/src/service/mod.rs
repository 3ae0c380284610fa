//! Core use-case services.
//!
//! # Responsibility
//! - Combine repositories and the apply engine into transactional use cases.
//! - Keep CLI and embedding callers decoupled from storage details.

pub mod document_service;

pub use document_service::{DocumentService, PostponedReport, ServiceError, ServiceResult};
