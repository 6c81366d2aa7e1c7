use tokio::sync::mpsc::{Sender, channel};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::{
    constants::{STREAM_BUFFER, STREAM_TX_ERR},
    core::{
        domain::{SubmissionId, SubmissionState},
        service::{ExecutionService, SubmissionHandle},
    },
    grpc::models::{
        CancelRequest, CancelResponse, Empty, HealthResponse, LanguageInfo, LanguageList,
        SubmissionUpdate, SubmitRequest, code_runner_server::CodeRunner,
    },
};

#[derive(Clone, Debug)]
pub struct CodeRunnerImpl {
    service: ExecutionService,
}

impl CodeRunnerImpl {
    pub fn new(service: ExecutionService) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl CodeRunner for CodeRunnerImpl {
    type SubmitStream = ReceiverStream<Result<SubmissionUpdate, Status>>;

    #[tracing::instrument(skip_all)]
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<Self::SubmitStream>, Status> {
        let request = request.into_inner();
        tracing::debug!(
            language = %request.language,
            source_bytes = request.source.len(),
            files = request.files.len(),
            "Received submission"
        );

        let handle = self.service.submit(request.into())?;
        tracing::debug!(
            submission_id = %handle.id,
            admission = ?handle.admission,
            "Submission admitted"
        );
        let (stream_tx, stream_rx) = channel(STREAM_BUFFER);
        tokio::spawn(forward_updates(self.service.clone(), handle, stream_tx));

        Ok(Response::new(ReceiverStream::new(stream_rx)))
    }

    #[tracing::instrument(skip_all)]
    async fn cancel(
        &self,
        request: Request<CancelRequest>,
    ) -> Result<Response<CancelResponse>, Status> {
        let id = SubmissionId::try_from(request.into_inner())?;
        let cancelled = self.service.cancel(id);
        Ok(Response::new(CancelResponse { cancelled }))
    }

    async fn health(&self, _request: Request<Empty>) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(self.service.health().await.into()))
    }

    async fn list_languages(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<LanguageList>, Status> {
        let languages = self
            .service
            .languages()
            .into_iter()
            .map(LanguageInfo::from)
            .collect();
        Ok(Response::new(LanguageList { languages }))
    }
}

/// Pumps state updates to the client until `Done`. A client that goes away
/// cancels its submission.
async fn forward_updates(
    service: ExecutionService,
    mut handle: SubmissionHandle,
    stream_tx: Sender<Result<SubmissionUpdate, Status>>,
) {
    let id = handle.id;
    loop {
        let state = tokio::select! {
            _ = stream_tx.closed() => None,
            state = handle.updates.recv() => match state {
                Some(state) => Some(state),
                None => return,
            },
        };
        let Some(state) = state else {
            tracing::info!(submission_id = %id, "Client disconnected, cancelling submission");
            service.cancel(id);
            return;
        };

        let done = matches!(state, SubmissionState::Done(_));
        let update = SubmissionUpdate::try_from((id, state)).map_err(Status::from);
        if let Err(err) = &update {
            tracing::error!(submission_id = %id, "{}", err.message());
        }
        if stream_tx.send(update).await.is_err() {
            tracing::warn!(submission_id = %id, "{}", STREAM_TX_ERR);
            service.cancel(id);
            return;
        }
        if done {
            return;
        }
    }
}
