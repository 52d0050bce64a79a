use tokio::fs::File;

use crate::common::error::{GatewayError, parameter_error};
use crate::common::identity::{IdentityRef, resolve_user};
use crate::server::job::{Job, OutputKind};
use crate::server::pbs::PbsBackend;
use crate::server::unixbatch::{SingleStatus, UnixBatchBackend};
use crate::store::StoreRef;

pub enum Backend {
    Pbs(PbsBackend),
    UnixBatch(UnixBatchBackend),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Pbs(_) => "pbs",
            Backend::UnixBatch(_) => "unix_batch",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitRequest {
    pub executable: String,
    pub parameters: Vec<String>,
    pub family: Option<String>,
    pub interactive: bool,
}

/// Rendered job status. PBS answers with text, the `at` variant with JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    Text(String),
    Json(String),
}

/// Entry point of every public operation: resolves the caller, checks ownership of the job and
/// hands over to the configured backend.
pub struct Dispatcher {
    identity: IdentityRef,
    store: StoreRef,
    backend: Backend,
}

impl Dispatcher {
    pub fn new(identity: IdentityRef, store: StoreRef, backend: Backend) -> Self {
        Self {
            identity,
            store,
            backend,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    async fn user(&self, session_id: Option<&str>) -> crate::Result<String> {
        resolve_user(self.identity.as_ref(), session_id).await
    }

    /// Loads a job of the caller. A missing job and a job of somebody else look the same.
    async fn authorize(&self, session_id: Option<&str>, job_id: &str) -> crate::Result<Job> {
        let user = self.user(session_id).await?;
        let id = job_id.to_string();
        match self.store.blocking(move |store| store.get_job(&id)).await? {
            Some(job) if job.username == user => Ok(job),
            _ => Err(GatewayError::ForbiddenError(
                "Job does not belong to you".to_string(),
            )),
        }
    }

    pub async fn submit(
        &self,
        session_id: Option<&str>,
        request: &SubmitRequest,
    ) -> crate::Result<String> {
        let user = self.user(session_id).await?;
        log::info!(
            "Submit from {user}: executable: {}, parameters: {:?}, family: {:?}, interactive: {}",
            request.executable,
            request.parameters,
            request.family,
            request.interactive
        );
        if request.executable.is_empty() {
            return parameter_error("No executable was specified");
        }
        let family = request.family.as_deref();
        match (&self.backend, request.interactive) {
            (Backend::Pbs(pbs), false) => {
                pbs.submit_batch(&user, &request.executable, &request.parameters, family)
                    .await
            }
            (Backend::Pbs(pbs), true) => {
                pbs.submit_interactive(&user, &request.executable, &request.parameters)
                    .await
            }
            (Backend::UnixBatch(batch), false) => {
                batch
                    .submit_batch(&user, &request.executable, &request.parameters, family)
                    .await
            }
            (Backend::UnixBatch(_), true) => {
                parameter_error("Interactive jobs are not supported by batch")
            }
        }
    }

    /// Minutes until the job would complete or start; the queues give no better answer than now.
    pub async fn estimate(
        &self,
        session_id: Option<&str>,
        request: &SubmitRequest,
    ) -> crate::Result<u32> {
        self.user(session_id).await?;
        match (&self.backend, request.interactive) {
            (Backend::UnixBatch(_), true) => {
                parameter_error("Interactive jobs are not supported by batch")
            }
            _ => Ok(0),
        }
    }

    pub async fn cancel(&self, session_id: Option<&str>, job_id: &str) -> crate::Result<()> {
        let job = self.authorize(session_id, job_id).await?;
        match &self.backend {
            Backend::Pbs(pbs) => pbs.cancel(&job).await,
            Backend::UnixBatch(batch) => batch.cancel(&job).await,
        }
    }

    pub async fn delete(&self, session_id: Option<&str>, job_id: &str) -> crate::Result<()> {
        let job = self.authorize(session_id, job_id).await?;
        match &self.backend {
            Backend::Pbs(pbs) => pbs.delete(&job).await,
            Backend::UnixBatch(batch) => batch.delete(&job).await,
        }
    }

    pub async fn status(
        &self,
        session_id: Option<&str>,
        job_id: &str,
    ) -> crate::Result<StatusReport> {
        let job = self.authorize(session_id, job_id).await?;
        match &self.backend {
            Backend::Pbs(pbs) => Ok(StatusReport::Text(pbs.status(&job)?)),
            Backend::UnixBatch(batch) => {
                let status = batch.status(&job).await?;
                Ok(StatusReport::Json(serde_json::to_string(&SingleStatus {
                    status,
                })?))
            }
        }
    }

    pub async fn list(&self, session_id: Option<&str>) -> crate::Result<StatusReport> {
        let user = self.user(session_id).await?;
        let jobs = self
            .store
            .blocking(move |store| store.find_jobs_by_user(&user))
            .await?;
        match &self.backend {
            Backend::Pbs(pbs) => Ok(StatusReport::Text(pbs.list(&jobs))),
            Backend::UnixBatch(batch) => {
                let entries = batch.list(&jobs).await?;
                Ok(StatusReport::Json(serde_json::to_string(&entries)?))
            }
        }
    }

    /// Opens the standard output or error of a job for streaming.
    pub async fn output(
        &self,
        session_id: Option<&str>,
        job_id: &str,
        kind: OutputKind,
    ) -> crate::Result<File> {
        let job = self.authorize(session_id, job_id).await?;
        let path = match &self.backend {
            Backend::Pbs(pbs) => pbs.output(&job, kind).await?,
            Backend::UnixBatch(batch) => batch.output(&job, kind).await?,
        };
        File::open(&path).await.map_err(|error| {
            GatewayError::InternalError(format!("Cannot open {}: {error}", path.display()))
        })
    }
}
