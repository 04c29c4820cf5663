use crate::service::{FaceService, ServiceError};
use facematch_core::StoreError;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facematch.FaceMatch1";
pub const OBJECT_PATH: &str = "/org/facematch/FaceMatch1";

/// D-Bus errors, one per failure kind: `org.facematch.Error.<Kind>`.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.facematch.Error")]
pub enum FaceMatchError {
    #[zbus(error)]
    ZBus(zbus::Error),
    DecodeError(String),
    NoFaceDetected(String),
    InvalidDimension(String),
    NonFiniteValue(String),
    EmptyName(String),
    NotFound(String),
    PersistenceError(String),
    EngineError(String),
    Internal(String),
}

impl From<ServiceError> for FaceMatchError {
    fn from(e: ServiceError) -> Self {
        let msg = e.to_string();
        match e {
            ServiceError::Decode(_) => FaceMatchError::DecodeError(msg),
            ServiceError::NoFaceDetected => FaceMatchError::NoFaceDetected(msg),
            ServiceError::Store(StoreError::InvalidDimension { .. } | StoreError::EmptyVector) => {
                FaceMatchError::InvalidDimension(msg)
            }
            ServiceError::Store(StoreError::NonFiniteValue) => FaceMatchError::NonFiniteValue(msg),
            ServiceError::Store(StoreError::EmptyName) => FaceMatchError::EmptyName(msg),
            ServiceError::Store(StoreError::NotFound(_)) => FaceMatchError::NotFound(msg),
            ServiceError::Persistence(_) => FaceMatchError::PersistenceError(msg),
            ServiceError::Engine(_) => FaceMatchError::EngineError(msg),
        }
    }
}

/// Serialize a successful result as the JSON reply payload.
fn respond<T: Serialize>(result: Result<T, ServiceError>) -> Result<String, FaceMatchError> {
    let value = result.map_err(|e| {
        tracing::warn!(kind = e.kind(), error = %e, "request failed");
        FaceMatchError::from(e)
    })?;
    serde_json::to_string(&value).map_err(|e| FaceMatchError::Internal(e.to_string()))
}

/// D-Bus interface for the facematch daemon.
///
/// Bus name: org.facematch.FaceMatch1
/// Object path: /org/facematch/FaceMatch1
pub struct FaceMatchInterface {
    service: Arc<FaceService>,
}

impl FaceMatchInterface {
    pub fn new(service: Arc<FaceService>) -> Self {
        Self { service }
    }
}

#[interface(name = "org.facematch.FaceMatch1")]
impl FaceMatchInterface {
    /// Enroll an encoded face image under `name`.
    async fn enroll(&self, name: &str, image: Vec<u8>) -> Result<String, FaceMatchError> {
        tracing::info!(name, bytes = image.len(), "enroll requested");
        respond(self.service.enroll(name, image).await)
    }

    /// Identify an encoded face image against the enrolled gallery.
    async fn identify(&self, image: Vec<u8>) -> Result<String, FaceMatchError> {
        tracing::info!(bytes = image.len(), "identify requested");
        respond(self.service.identify(image).await)
    }

    /// Closest `k` identities with their distances, no threshold applied.
    async fn rank(&self, image: Vec<u8>, k: u32) -> Result<String, FaceMatchError> {
        tracing::info!(bytes = image.len(), k, "rank requested");
        respond(self.service.rank(image, k as usize).await)
    }

    /// List enrolled identities with their embedding counts.
    async fn list_identities(&self) -> Result<String, FaceMatchError> {
        respond(Ok(self.service.list()))
    }

    /// Remove an identity and all of its embeddings.
    async fn remove(&self, name: &str) -> Result<String, FaceMatchError> {
        tracing::info!(name, "remove requested");
        respond(self.service.remove(name).await)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, FaceMatchError> {
        respond(Ok(self.service.status()))
    }
}
