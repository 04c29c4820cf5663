use facematch_core::{EmbedError, Embedder, Embedding};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Embed {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, EmbedError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode `image` and run the embedding model on it.
    pub async fn embed(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The embedder is loaded by the caller (fail-fast at startup) and moved
/// onto the thread, which then serves requests one at a time until every
/// handle is dropped.
pub fn spawn_engine(mut embedder: Box<dyn Embedder>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Embed { image, reply } => {
                        let bytes = image.len();
                        let result = embedder.embed(&image);
                        match &result {
                            Ok(e) => tracing::debug!(bytes, dim = e.dimension(), "embedding extracted"),
                            Err(err) => tracing::debug!(bytes, error = %err, "embedding failed"),
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic stand-in for the embedding model.

    use super::*;

    /// Interprets the image bytes as comma-separated floats.
    ///
    /// `"noface"` -> `NoFaceDetected`; anything not valid UTF-8 floats -> `Decode`.
    pub struct TextEmbedder;

    impl Embedder for TextEmbedder {
        fn embed(&mut self, image: &[u8]) -> Result<Embedding, EmbedError> {
            let text = std::str::from_utf8(image)
                .map_err(|e| EmbedError::Decode(e.to_string()))?
                .trim();
            if text == "noface" {
                return Err(EmbedError::NoFaceDetected);
            }
            let values = text
                .split(',')
                .map(|s| s.trim().parse::<f32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| EmbedError::Decode(e.to_string()))?;
            Ok(Embedding::new(values))
        }
    }
}
