//! BoxCalculationBackend -- object-safe dynamic dispatch wrapper for
//! CalculationBackend.
//!
//! 1. Define an object-safe `CalculationBackendDyn` trait with boxed futures
//! 2. Blanket-impl `CalculationBackendDyn` for all `T: CalculationBackend`
//! 3. `BoxCalculationBackend` wraps `Box<dyn CalculationBackendDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use super::backend::{CalculationBackend, CalculationError, CalculationRequest, JobId, JobState};

/// Object-safe version of [`CalculationBackend`] with boxed futures.
pub trait CalculationBackendDyn: Send + Sync {
    fn name(&self) -> &str;

    fn submit_boxed<'a>(
        &'a self,
        request: &'a CalculationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<JobId, CalculationError>> + Send + 'a>>;

    fn poll_boxed<'a>(
        &'a self,
        job: &'a JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobState, CalculationError>> + Send + 'a>>;
}

impl<T: CalculationBackend> CalculationBackendDyn for T {
    fn name(&self) -> &str {
        CalculationBackend::name(self)
    }

    fn submit_boxed<'a>(
        &'a self,
        request: &'a CalculationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<JobId, CalculationError>> + Send + 'a>> {
        Box::pin(self.submit(request))
    }

    fn poll_boxed<'a>(
        &'a self,
        job: &'a JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobState, CalculationError>> + Send + 'a>> {
        Box::pin(self.poll(job))
    }
}

/// Type-erased calculation backend, selected at runtime.
pub struct BoxCalculationBackend {
    inner: Box<dyn CalculationBackendDyn + Send + Sync>,
}

impl BoxCalculationBackend {
    pub fn new<T: CalculationBackend + 'static>(backend: T) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn submit(&self, request: &CalculationRequest) -> Result<JobId, CalculationError> {
        self.inner.submit_boxed(request).await
    }

    pub async fn poll(&self, job: &JobId) -> Result<JobState, CalculationError> {
        self.inner.poll_boxed(job).await
    }
}

impl std::fmt::Debug for BoxCalculationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCalculationBackend")
            .field("name", &self.inner.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculation::DisabledBackend;

    #[tokio::test]
    async fn boxed_backend_delegates() {
        let backend = BoxCalculationBackend::new(DisabledBackend);
        assert_eq!(backend.name(), "disabled");
        let err = backend.poll(&JobId("7".to_string())).await.unwrap_err();
        assert!(matches!(err, CalculationError::JobNotFound(_)));
    }
}
